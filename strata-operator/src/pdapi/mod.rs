//! Store-lifecycle client for a cluster's coordinator.
//!
//! Clients are stateless. Every call is a single request bounded by a timeout, and errors are
//! returned to the caller as is. Retries are the business of the reconciliation loop.

mod http;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use self::http::HttpStoreClient;
use strata_core::crd::{RequiredMetadata, StoreState, StrataCluster};

/// The port of the coordinator's client API.
pub const COORDINATOR_CLIENT_PORT: u16 = 2379;

/// A store as reported by the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreInfo {
    pub id: u64,
    /// The advertised address of the store, `host:port`.
    pub address: String,
    pub state: StoreState,
    pub leader_count: i64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
}

impl StoreInfo {
    /// The name of the pod backing this store, which is the first DNS label of its address.
    pub fn pod_name(&self) -> &str {
        let host = self.address.rsplit_once(':').map(|(host, _)| host).unwrap_or(&self.address);
        host.split('.').next().unwrap_or(host)
    }

    /// The IP or host part of this store's address.
    pub fn ip(&self) -> &str {
        self.address.rsplit_once(':').map(|(host, _)| host).unwrap_or(&self.address)
    }

    /// Check if this store is a columnar replica rather than a member of the storage tier.
    pub fn is_tiflash(&self) -> bool {
        self.labels
            .get(strata_core::labels::STORE_LABEL_ENGINE)
            .map(|engine| engine == strata_core::labels::STORE_ENGINE_TIFLASH)
            .unwrap_or(false)
    }
}

/// The replication config of the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicationConfig {
    pub max_replicas: u64,
}

/// A member of the consensus tier.
#[derive(Clone, Debug, PartialEq)]
pub struct MemberInfo {
    pub id: u64,
    pub name: String,
    pub client_urls: Vec<String>,
}

/// A typed client of a coordinator's store-lifecycle API.
#[async_trait]
pub trait StoreLifecycleClient: Send + Sync {
    /// List all stores, including tombstones.
    async fn list_stores(&self) -> Result<Vec<StoreInfo>>;

    /// Fetch the replication config.
    async fn get_replication_config(&self) -> Result<ReplicationConfig>;

    /// Fetch the leader eviction schedulers registered for any of the given stores.
    async fn get_leader_eviction_schedulers(&self, store_ids: &[u64]) -> Result<BTreeMap<u64, String>>;

    /// Register a leader eviction scheduler for the given store.
    async fn begin_leader_eviction(&self, store_id: u64) -> Result<()>;

    /// Remove the leader eviction scheduler of the given store.
    async fn end_leader_eviction(&self, store_id: u64) -> Result<()>;

    /// Request removal of the given store. Removal is asynchronous.
    async fn remove_store(&self, store_id: u64) -> Result<()>;

    /// List the members of the consensus tier.
    async fn list_members(&self) -> Result<Vec<MemberInfo>>;

    /// Remove a member of the consensus tier.
    async fn remove_member(&self, member_id: u64) -> Result<()>;
}

/// A factory of store-lifecycle clients, one per cluster.
pub trait CoordinatorControl: Send + Sync {
    /// Get a client for the given cluster's coordinator.
    fn client(&self, cluster: &StrataCluster) -> Arc<dyn StoreLifecycleClient>;
}

/// Builds HTTP clients against a cluster's coordinator service.
pub struct HttpCoordinatorControl {
    http: reqwest::Client,
    timeout: Duration,
    cluster_domain: Option<String>,
}

impl HttpCoordinatorControl {
    /// Create a new instance.
    pub fn new(timeout: Duration, cluster_domain: Option<String>) -> Result<Self> {
        use anyhow::Context;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("error building coordinator HTTP client")?;
        Ok(Self { http, timeout, cluster_domain })
    }

    /// The URL of the given cluster's coordinator.
    pub fn coordinator_url(cluster: &StrataCluster, cluster_domain: Option<&str>) -> String {
        if let Some(url) = cluster.spec.coordinator_url.as_ref() {
            return url.trim_end_matches('/').to_string();
        }
        let (ns, name) = (RequiredMetadata::namespace(cluster), RequiredMetadata::name(cluster));
        match cluster_domain {
            Some(domain) if !domain.is_empty() => format!("http://{}-pd.{}.svc.{}:{}", name, ns, domain, COORDINATOR_CLIENT_PORT),
            _ => format!("http://{}-pd.{}.svc:{}", name, ns, COORDINATOR_CLIENT_PORT),
        }
    }
}

impl CoordinatorControl for HttpCoordinatorControl {
    fn client(&self, cluster: &StrataCluster) -> Arc<dyn StoreLifecycleClient> {
        let url = Self::coordinator_url(cluster, self.cluster_domain.as_deref());
        Arc::new(HttpStoreClient::new(self.http.clone(), url, self.timeout))
    }
}
