//! HTTP implementation of the store-lifecycle client.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use super::{MemberInfo, ReplicationConfig, StoreInfo, StoreLifecycleClient};
use strata_core::crd::StoreState;

const STORES_PATH: &str = "pd/api/v1/stores";
const STORE_PATH: &str = "pd/api/v1/store";
const REPLICATE_PATH: &str = "pd/api/v1/config/replicate";
const SCHEDULERS_PATH: &str = "pd/api/v1/schedulers";
const MEMBERS_PATH: &str = "pd/api/v1/members";

/// The scheduler name prefix used for leader eviction.
pub const EVICT_LEADER_SCHEDULER: &str = "evict-leader-scheduler";

/// Store-lifecycle client speaking the coordinator's HTTP JSON API.
pub struct HttpStoreClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpStoreClient {
    /// Create a new instance.
    pub fn new(http: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self { http, base_url, timeout }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Issue a GET request and decode its JSON body.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let res = timeout(self.timeout, self.http.get(&url).send())
            .await
            .with_context(|| format!("timeout from coordinator GET {}", url))?
            .with_context(|| format!("error from coordinator GET {}", url))?
            .error_for_status()
            .with_context(|| format!("error status from coordinator GET {}", url))?;
        let body = timeout(self.timeout, res.text())
            .await
            .with_context(|| format!("timeout reading body of coordinator GET {}", url))?
            .with_context(|| format!("error reading body of coordinator GET {}", url))?;
        serde_json::from_str(&body).with_context(|| format!("error decoding body of coordinator GET {}", url))
    }

    /// Issue a request without a response body, optionally treating NOT_FOUND as success.
    async fn send<B: Serialize>(&self, method: Method, path: &str, body: Option<&B>, allow_not_found: bool) -> Result<()> {
        let url = self.url(path);
        let mut req = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let res = timeout(self.timeout, req.send())
            .await
            .with_context(|| format!("timeout from coordinator {} {}", method, url))?
            .with_context(|| format!("error from coordinator {} {}", method, url))?;
        if allow_not_found && res.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        res.error_for_status()
            .with_context(|| format!("error status from coordinator {} {}", method, url))?;
        Ok(())
    }
}

#[async_trait]
impl StoreLifecycleClient for HttpStoreClient {
    #[tracing::instrument(level = "debug", skip(self), fields(url = %self.base_url))]
    async fn list_stores(&self) -> Result<Vec<StoreInfo>> {
        // Up, Offline & Tombstone. Down stores are reported as Up with a `Down` state name.
        let path = format!("{}?state=0&state=1&state=2", STORES_PATH);
        let stores: StoresResponse = self.get_json(&path).await?;
        Ok(stores.into_stores())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(url = %self.base_url))]
    async fn get_replication_config(&self) -> Result<ReplicationConfig> {
        let config: ReplicateResponse = self.get_json(REPLICATE_PATH).await?;
        Ok(ReplicationConfig {
            max_replicas: config.max_replicas,
        })
    }

    #[tracing::instrument(level = "debug", skip(self), fields(url = %self.base_url))]
    async fn get_leader_eviction_schedulers(&self, store_ids: &[u64]) -> Result<BTreeMap<u64, String>> {
        let schedulers: Vec<String> = self.get_json(SCHEDULERS_PATH).await?;
        Ok(filter_eviction_schedulers(&schedulers, store_ids))
    }

    #[tracing::instrument(level = "debug", skip(self), fields(url = %self.base_url))]
    async fn begin_leader_eviction(&self, store_id: u64) -> Result<()> {
        let body = EvictLeaderRequest {
            name: EVICT_LEADER_SCHEDULER,
            store_id,
        };
        self.send(Method::POST, SCHEDULERS_PATH, Some(&body), false).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(url = %self.base_url))]
    async fn end_leader_eviction(&self, store_id: u64) -> Result<()> {
        let path = format!("{}/{}", SCHEDULERS_PATH, eviction_scheduler_name(store_id));
        self.send::<()>(Method::DELETE, &path, None, true).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(url = %self.base_url))]
    async fn remove_store(&self, store_id: u64) -> Result<()> {
        let path = format!("{}/{}", STORE_PATH, store_id);
        self.send::<()>(Method::DELETE, &path, None, false).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(url = %self.base_url))]
    async fn list_members(&self) -> Result<Vec<MemberInfo>> {
        let members: MembersResponse = self.get_json(MEMBERS_PATH).await?;
        Ok(members.into_members())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(url = %self.base_url))]
    async fn remove_member(&self, member_id: u64) -> Result<()> {
        let path = format!("{}/id/{}", MEMBERS_PATH, member_id);
        self.send::<()>(Method::DELETE, &path, None, true).await
    }
}

/// The name of the leader eviction scheduler of the given store.
pub fn eviction_scheduler_name(store_id: u64) -> String {
    format!("{}-{}", EVICT_LEADER_SCHEDULER, store_id)
}

/// Select the eviction schedulers which belong to any of the given stores.
pub fn filter_eviction_schedulers(schedulers: &[String], store_ids: &[u64]) -> BTreeMap<u64, String> {
    store_ids
        .iter()
        .filter_map(|id| {
            let name = eviction_scheduler_name(*id);
            schedulers.iter().find(|sched| **sched == name).map(|sched| (*id, sched.clone()))
        })
        .collect()
}

#[derive(Deserialize)]
pub(super) struct StoresResponse {
    #[serde(default)]
    stores: Vec<StoreEnvelope>,
}

#[derive(Deserialize)]
struct StoreEnvelope {
    store: StoreMeta,
    #[serde(default)]
    status: StoreStatus,
}

#[derive(Deserialize)]
struct StoreMeta {
    id: u64,
    #[serde(default)]
    address: String,
    state_name: String,
    #[serde(default)]
    labels: Vec<StoreLabel>,
}

#[derive(Deserialize)]
struct StoreLabel {
    key: String,
    value: String,
}

#[derive(Default, Deserialize)]
struct StoreStatus {
    #[serde(default)]
    leader_count: i64,
    #[serde(default)]
    last_heartbeat_ts: Option<DateTime<Utc>>,
}

impl StoresResponse {
    /// Stores in a state this operator does not know are skipped.
    pub(super) fn into_stores(self) -> Vec<StoreInfo> {
        self.stores
            .into_iter()
            .filter_map(|env| {
                let state = match StoreState::from_name(&env.store.state_name) {
                    Some(state) => state,
                    None => {
                        tracing::warn!(store_id = env.store.id, state = %env.store.state_name, "skipping store in unknown state");
                        return None;
                    }
                };
                Some(StoreInfo {
                    id: env.store.id,
                    address: env.store.address,
                    state,
                    leader_count: env.status.leader_count,
                    last_heartbeat: env.status.last_heartbeat_ts,
                    labels: env.store.labels.into_iter().map(|label| (label.key, label.value)).collect(),
                })
            })
            .collect()
    }
}

#[derive(Deserialize)]
pub(super) struct ReplicateResponse {
    #[serde(rename = "max-replicas")]
    pub(super) max_replicas: u64,
}

#[derive(Serialize)]
struct EvictLeaderRequest {
    name: &'static str,
    store_id: u64,
}

#[derive(Deserialize)]
pub(super) struct MembersResponse {
    #[serde(default)]
    members: Vec<MemberEnvelope>,
}

#[derive(Deserialize)]
struct MemberEnvelope {
    name: String,
    member_id: u64,
    #[serde(default)]
    client_urls: Vec<String>,
}

impl MembersResponse {
    pub(super) fn into_members(self) -> Vec<MemberInfo> {
        self.members
            .into_iter()
            .map(|member| MemberInfo {
                id: member.member_id,
                name: member.name,
                client_urls: member.client_urls,
            })
            .collect()
    }
}
