//! Access to the K8s objects read & mutated while reconciling a cluster.
//!
//! Everything the reconciliation logic needs from K8s goes through `ResourceControl`, which keeps
//! the scaling logic testable against in-memory fakes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::Resource;
use serde_json::json;
use tokio::time::timeout;

use strata_core::crd::{RequiredMetadata, StrataCluster, StrataClusterStatus};
use strata_core::labels::{ANNO_DEFER_DELETING, ANNO_DELETE_SLOTS, APP_NAME};
use strata_core::ReplicaSlots;

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// The type of an event recorded on a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// A metadata update for a single object.
///
/// A `None` value removes the key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetaPatch {
    pub labels: BTreeMap<String, Option<String>>,
    pub annotations: BTreeMap<String, Option<String>>,
}

impl MetaPatch {
    /// Set a label.
    pub fn label(mut self, key: &str, val: impl Into<String>) -> Self {
        self.labels.insert(key.into(), Some(val.into()));
        self
    }

    /// Set an annotation.
    pub fn annotation(mut self, key: &str, val: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), Some(val.into()));
        self
    }

    /// Remove an annotation.
    pub fn remove_annotation(mut self, key: &str) -> Self {
        self.annotations.insert(key.into(), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }

    /// Render as a JSON merge patch body.
    pub fn to_merge_patch(&self) -> serde_json::Value {
        json!({"metadata": {"labels": self.labels, "annotations": self.annotations}})
    }

    /// Apply this patch to the given metadata, as the API server would.
    pub fn apply_to(&self, meta: &mut ObjectMeta) {
        fn merge(target: &mut Option<BTreeMap<String, String>>, patch: &BTreeMap<String, Option<String>>) {
            if patch.is_empty() {
                return;
            }
            let map = target.get_or_insert_with(BTreeMap::new);
            for (key, val) in patch {
                match val {
                    Some(val) => map.insert(key.clone(), val.clone()),
                    None => map.remove(key),
                };
            }
        }
        merge(&mut meta.labels, &self.labels);
        merge(&mut meta.annotations, &self.annotations);
    }
}

/// The K8s operations used while reconciling a cluster.
#[async_trait]
pub trait ResourceControl: Send + Sync {
    /// Fetch a cluster, `None` if it does not exist.
    async fn get_cluster(&self, ns: &str, name: &str) -> Result<Option<StrataCluster>>;

    /// Write the status of the given cluster.
    async fn update_cluster_status(&self, cluster: &StrataCluster, status: &StrataClusterStatus) -> Result<()>;

    /// Fetch a StatefulSet, `None` if it does not exist.
    async fn get_statefulset(&self, ns: &str, name: &str) -> Result<Option<StatefulSet>>;

    /// Set the replica count & delete slots of a StatefulSet.
    async fn scale_statefulset(&self, ns: &str, name: &str, slots: &ReplicaSlots) -> Result<()>;

    /// Fetch a pod, `None` if it does not exist.
    async fn get_pod(&self, ns: &str, name: &str) -> Result<Option<Pod>>;

    /// List pods matching the given label selector.
    async fn list_pods(&self, ns: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Update the labels & annotations of a pod.
    async fn patch_pod_meta(&self, ns: &str, name: &str, patch: &MetaPatch) -> Result<()>;

    /// Fetch a storage claim, `None` if it does not exist.
    async fn get_claim(&self, ns: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    /// Update the labels & annotations of a storage claim.
    async fn patch_claim_meta(&self, ns: &str, name: &str, patch: &MetaPatch) -> Result<()>;

    /// Record an event on the given cluster.
    async fn record_event(&self, cluster: &StrataCluster, event_type: EventType, reason: &str, message: &str) -> Result<()>;
}

/// Read the replica slots of a StatefulSet.
///
/// Delete slots are only read when `with_delete_slots` is set.
pub fn statefulset_slots(sts: &StatefulSet, with_delete_slots: bool) -> Result<ReplicaSlots> {
    let replicas = sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1);
    if !with_delete_slots {
        return Ok(ReplicaSlots::with_replicas(replicas));
    }
    let slots = match sts.metadata.annotations.as_ref().and_then(|annos| annos.get(ANNO_DELETE_SLOTS)) {
        Some(val) => ReplicaSlots::decode_delete_slots(val)
            .with_context(|| format!("error reading delete slots of StatefulSet {}", sts.metadata.name.as_deref().unwrap_or_default()))?,
        None => Default::default(),
    };
    Ok(ReplicaSlots::new(replicas, slots))
}

/// The storage claims mounted by the given pod.
pub fn pod_claim_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.volumes
                .iter()
                .flatten()
                .filter_map(|vol| vol.persistent_volume_claim.as_ref().map(|pvc| pvc.claim_name.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Check if the given pod is ready.
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conds| conds.iter().any(|cond| cond.type_ == "Ready" && cond.status == "True"))
        .unwrap_or(false)
}

/// Read an RFC3339 timestamp annotation from the given metadata.
pub fn time_annotation(meta: &ObjectMeta, key: &str) -> Option<DateTime<Utc>> {
    let val = meta.annotations.as_ref()?.get(key)?;
    match DateTime::parse_from_rfc3339(val) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(err) => {
            tracing::warn!(error = ?err, key, val = %val, "ignoring malformed timestamp annotation");
            None
        }
    }
}

/// Check if the given claim is already marked for deferred deletion.
pub fn claim_is_deferred(claim: &PersistentVolumeClaim) -> bool {
    claim
        .metadata
        .annotations
        .as_ref()
        .map(|annos| annos.contains_key(ANNO_DEFER_DELETING))
        .unwrap_or(false)
}

/// `ResourceControl` backed by the K8s API.
pub struct KubeResources {
    client: Client,
}

impl KubeResources {
    /// Create a new instance.
    pub fn new(client: Client) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

/// Map a NOT_FOUND API error to `None`.
fn not_found_as_none<T>(res: std::result::Result<T, kube::Error>) -> std::result::Result<Option<T>, kube::Error> {
    match res {
        Ok(val) => Ok(Some(val)),
        Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Ok(None),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl ResourceControl for KubeResources {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_cluster(&self, ns: &str, name: &str) -> Result<Option<StrataCluster>> {
        let api: Api<StrataCluster> = Api::namespaced(self.client.clone(), ns);
        let res = timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching cluster")?;
        not_found_as_none(res).context("error fetching cluster")
    }

    #[tracing::instrument(level = "debug", skip(self, cluster, status), fields(cluster = %cluster.key()))]
    async fn update_cluster_status(&self, cluster: &StrataCluster, status: &StrataClusterStatus) -> Result<()> {
        tracing::debug!("updating cluster status");
        let api: Api<StrataCluster> = Api::namespaced(self.client.clone(), RequiredMetadata::namespace(cluster));
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true;
        let body = json!({
            "apiVersion": StrataCluster::api_version(&()),
            "kind": StrataCluster::kind(&()),
            "status": status,
        });
        timeout(API_TIMEOUT, api.patch_status(RequiredMetadata::name(cluster), &params, &Patch::Apply(&body)))
            .await
            .context("timeout while updating cluster status")?
            .context("error updating cluster status")
            .map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_statefulset(&self, ns: &str, name: &str) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), ns);
        let res = timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching StatefulSet")?;
        not_found_as_none(res).context("error fetching StatefulSet")
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn scale_statefulset(&self, ns: &str, name: &str, slots: &ReplicaSlots) -> Result<()> {
        tracing::info!(%slots, "scaling StatefulSet");
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), ns);
        let body = json!({
            "metadata": {"annotations": {ANNO_DELETE_SLOTS: slots.encode_delete_slots()}},
            "spec": {"replicas": slots.replicas()},
        });
        timeout(API_TIMEOUT, api.patch(name, &PatchParams::default(), &Patch::Merge(&body)))
            .await
            .context("timeout while scaling StatefulSet")?
            .context("error scaling StatefulSet")
            .map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_pod(&self, ns: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let res = timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching pod")?;
        not_found_as_none(res).context("error fetching pod")
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_pods(&self, ns: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let params = ListParams {
            label_selector: Some(selector.into()),
            ..Default::default()
        };
        timeout(API_TIMEOUT, api.list(&params))
            .await
            .context("timeout while listing pods")?
            .context("error listing pods")
            .map(|list| list.items)
    }

    #[tracing::instrument(level = "debug", skip(self, patch))]
    async fn patch_pod_meta(&self, ns: &str, name: &str, patch: &MetaPatch) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        timeout(API_TIMEOUT, api.patch(name, &PatchParams::default(), &Patch::Merge(&patch.to_merge_patch())))
            .await
            .context("timeout while patching pod metadata")?
            .context("error patching pod metadata")
            .map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_claim(&self, ns: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), ns);
        let res = timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching storage claim")?;
        not_found_as_none(res).context("error fetching storage claim")
    }

    #[tracing::instrument(level = "debug", skip(self, patch))]
    async fn patch_claim_meta(&self, ns: &str, name: &str, patch: &MetaPatch) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), ns);
        timeout(API_TIMEOUT, api.patch(name, &PatchParams::default(), &Patch::Merge(&patch.to_merge_patch())))
            .await
            .context("timeout while patching storage claim metadata")?
            .context("error patching storage claim metadata")
            .map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self, cluster, message), fields(cluster = %cluster.key()))]
    async fn record_event(&self, cluster: &StrataCluster, event_type: EventType, reason: &str, message: &str) -> Result<()> {
        let ns = RequiredMetadata::namespace(cluster);
        let now = Time(Utc::now());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", RequiredMetadata::name(cluster))),
                namespace: Some(ns.into()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some(StrataCluster::api_version(&()).into_owned()),
                kind: Some(StrataCluster::kind(&()).into_owned()),
                name: Some(RequiredMetadata::name(cluster).into()),
                namespace: Some(ns.into()),
                uid: cluster.meta().uid.clone(),
                resource_version: cluster.meta().resource_version.clone(),
                ..Default::default()
            },
            reason: Some(reason.into()),
            message: Some(message.into()),
            type_: Some(event_type.as_str().into()),
            count: Some(1),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            source: Some(EventSource {
                component: Some(APP_NAME.into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let api: Api<Event> = Api::namespaced(self.client.clone(), ns);
        timeout(API_TIMEOUT, api.create(&PostParams::default(), &event))
            .await
            .context("timeout while recording event")?
            .context("error recording event")
            .map(|_| ())
    }
}
