//! In-memory fakes of the K8s API & coordinator used by tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodCondition, PodSpec, PodStatus, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use maplit::btreemap;

use crate::k8s::resources::{EventType, MetaPatch, ResourceControl};
use crate::pdapi::{CoordinatorControl, MemberInfo, ReplicationConfig, StoreInfo, StoreLifecycleClient};
use crate::scaler::{MemberGroup, ScalerDeps, ScalerSettings};
use strata_core::crd::{MemberGroupSpec, RequiredMetadata, StoreState, StrataCluster, StrataClusterSpec, StrataClusterStatus};
use strata_core::labels::{self, ANNO_DELETE_SLOTS, LABEL_STORE_ID};
use strata_core::{FeatureGates, ReplicaSlots};

pub const NAMESPACE: &str = "default";

/// A fixed point in time used as "now" by tests.
pub fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2021-06-01T12:00:00Z").map(|ts| ts.with_timezone(&Utc)).unwrap()
}

/// Build a cluster with the given group sizes.
pub fn cluster(name: &str, pd: i32, tikv: i32) -> StrataCluster {
    let mut cluster = StrataCluster::new(
        name,
        StrataClusterSpec {
            paused: false,
            coordinator_url: None,
            pd: group_spec(pd, 1),
            tikv: group_spec(tikv, 1),
            tidb: None,
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.into());
    cluster
}

/// Build a group spec with the same scale-in & scale-out parallelism.
pub fn group_spec(replicas: i32, parallelism: i32) -> MemberGroupSpec {
    MemberGroupSpec {
        replicas,
        scale_in_parallelism: parallelism,
        scale_out_parallelism: parallelism,
        delete_slots: BTreeSet::new(),
    }
}

/// Build a StatefulSet of the given group.
pub fn statefulset(cluster: &str, group: MemberGroup, slots: &ReplicaSlots) -> StatefulSet {
    let mut annotations = BTreeMap::new();
    if let Some(val) = slots.encode_delete_slots() {
        annotations.insert(ANNO_DELETE_SLOTS.to_string(), val);
    }
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(group.statefulset_name(cluster)),
            namespace: Some(NAMESPACE.into()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(slots.replicas()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build a pod of the given group, mounting its templated claim.
pub fn pod(cluster: &str, group: MemberGroup, ordinal: i32, ready: bool, created: DateTime<Utc>, store_id: Option<u64>) -> Pod {
    let mut pod_labels = BTreeMap::new();
    labels::set_canonical_labels(&mut pod_labels, cluster, group.component());
    if let Some(id) = store_id {
        pod_labels.insert(LABEL_STORE_ID.to_string(), id.to_string());
    }
    Pod {
        metadata: ObjectMeta {
            name: Some(group.pod_name(cluster, ordinal)),
            namespace: Some(NAMESPACE.into()),
            labels: Some(pod_labels),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: Some(vec![Volume {
                name: group.component().into(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: group.claim_name(cluster, ordinal),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: if ready { "True".into() } else { "False".into() },
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Build a storage claim.
pub fn claim(name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Build a store backed by the given pod.
pub fn store(id: u64, pod_name: &str, state: StoreState, leader_count: i64) -> StoreInfo {
    StoreInfo {
        id,
        address: format!("{}.peer.{}.svc:20160", pod_name, NAMESPACE),
        state,
        leader_count,
        last_heartbeat: Some(now()),
        labels: BTreeMap::new(),
    }
}

/// Build a consensus member backed by the given pod.
pub fn member(id: u64, pod_name: &str) -> MemberInfo {
    MemberInfo {
        id,
        name: pod_name.into(),
        client_urls: vec![format!("http://{}:2379", pod_name)],
    }
}

/// Build scaler dependencies over the given fakes.
pub fn deps(resources: Arc<FakeResources>, client: Arc<FakeStoreClient>, delete_slots: bool) -> ScalerDeps {
    let gates = FeatureGates::new(&btreemap! {strata_core::features::ADVANCED_STATEFUL_SET.to_string() => delete_slots}).unwrap();
    ScalerDeps {
        resources,
        coordinators: Arc::new(FakeCoordinators(client)),
        features: Arc::new(gates),
        settings: ScalerSettings {
            evict_leader_timeout: Duration::seconds(300),
            grace_period: Duration::seconds(150),
        },
    }
}

//////////////////////////////////////////////////////////////////////////////
// Fake K8s //////////////////////////////////////////////////////////////////

/// The objects held by `FakeResources`, by name.
#[derive(Default)]
pub struct FakeK8s {
    pub clusters: BTreeMap<String, StrataCluster>,
    pub statefulsets: BTreeMap<String, StatefulSet>,
    pub pods: BTreeMap<String, Pod>,
    pub claims: BTreeMap<String, PersistentVolumeClaim>,
    /// Every status written, in order.
    pub statuses: Vec<StrataClusterStatus>,
    /// Every scale applied, in order.
    pub scales: Vec<(String, ReplicaSlots)>,
    /// Every event recorded, as `(type, reason, message)`.
    pub events: Vec<(EventType, String, String)>,
    /// Fail all calls to `scale_statefulset`.
    pub fail_scale: bool,
}

/// An in-memory `ResourceControl`.
#[derive(Default)]
pub struct FakeResources {
    state: Mutex<FakeK8s>,
}

impl FakeResources {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeK8s> {
        self.state.lock().unwrap()
    }

    pub fn add_cluster(&self, cluster: StrataCluster) {
        self.lock().clusters.insert(cluster.key(), cluster);
    }

    pub fn add_statefulset(&self, sts: StatefulSet) {
        let name = sts.metadata.name.clone().unwrap_or_default();
        self.lock().statefulsets.insert(name, sts);
    }

    pub fn add_pod(&self, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.lock().pods.insert(name, pod);
    }

    pub fn add_claim(&self, claim: PersistentVolumeClaim) {
        let name = claim.metadata.name.clone().unwrap_or_default();
        self.lock().claims.insert(name, claim);
    }

    /// The value of an annotation on a claim.
    pub fn claim_annotation(&self, name: &str, key: &str) -> Option<String> {
        let state = self.lock();
        state.claims.get(name)?.metadata.annotations.as_ref()?.get(key).cloned()
    }

    /// The value of an annotation on a pod.
    pub fn pod_annotation(&self, name: &str, key: &str) -> Option<String> {
        let state = self.lock();
        state.pods.get(name)?.metadata.annotations.as_ref()?.get(key).cloned()
    }

    /// The value of a label on a pod.
    pub fn pod_label(&self, name: &str, key: &str) -> Option<String> {
        let state = self.lock();
        state.pods.get(name)?.metadata.labels.as_ref()?.get(key).cloned()
    }

    /// The names of all claims marked for deferred deletion.
    pub fn deferred_claims(&self) -> BTreeSet<String> {
        let state = self.lock();
        state
            .claims
            .iter()
            .filter(|(_, claim)| crate::k8s::resources::claim_is_deferred(claim))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl ResourceControl for FakeResources {
    async fn get_cluster(&self, ns: &str, name: &str) -> Result<Option<StrataCluster>> {
        Ok(self.lock().clusters.get(&format!("{}/{}", ns, name)).cloned())
    }

    async fn update_cluster_status(&self, cluster: &StrataCluster, status: &StrataClusterStatus) -> Result<()> {
        let mut state = self.lock();
        state.statuses.push(status.clone());
        if let Some(stored) = state.clusters.get_mut(&cluster.key()) {
            stored.status = Some(status.clone());
        }
        Ok(())
    }

    async fn get_statefulset(&self, _ns: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.lock().statefulsets.get(name).cloned())
    }

    async fn scale_statefulset(&self, _ns: &str, name: &str, slots: &ReplicaSlots) -> Result<()> {
        let mut state = self.lock();
        if state.fail_scale {
            bail!("injected scale failure");
        }
        state.scales.push((name.into(), slots.clone()));
        let sts = match state.statefulsets.get_mut(name) {
            Some(sts) => sts,
            None => bail!("StatefulSet {} not found", name),
        };
        if let Some(spec) = sts.spec.as_mut() {
            spec.replicas = Some(slots.replicas());
        }
        let annos = sts.metadata.annotations.get_or_insert_with(BTreeMap::new);
        match slots.encode_delete_slots() {
            Some(val) => annos.insert(ANNO_DELETE_SLOTS.into(), val),
            None => annos.remove(ANNO_DELETE_SLOTS),
        };
        Ok(())
    }

    async fn get_pod(&self, _ns: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.lock().pods.get(name).cloned())
    }

    async fn list_pods(&self, _ns: &str, selector: &str) -> Result<Vec<Pod>> {
        let wanted: Vec<(&str, &str)> = selector.split(',').filter_map(|pair| pair.split_once('=')).collect();
        let state = self.lock();
        Ok(state
            .pods
            .values()
            .filter(|pod| {
                let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
                wanted.iter().all(|(key, val)| pod_labels.get(*key).map(String::as_str) == Some(*val))
            })
            .cloned()
            .collect())
    }

    async fn patch_pod_meta(&self, _ns: &str, name: &str, patch: &MetaPatch) -> Result<()> {
        let mut state = self.lock();
        match state.pods.get_mut(name) {
            Some(pod) => patch.apply_to(&mut pod.metadata),
            None => bail!("pod {} not found", name),
        }
        Ok(())
    }

    async fn get_claim(&self, _ns: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.lock().claims.get(name).cloned())
    }

    async fn patch_claim_meta(&self, _ns: &str, name: &str, patch: &MetaPatch) -> Result<()> {
        let mut state = self.lock();
        match state.claims.get_mut(name) {
            Some(claim) => patch.apply_to(&mut claim.metadata),
            None => bail!("claim {} not found", name),
        }
        Ok(())
    }

    async fn record_event(&self, _cluster: &StrataCluster, event_type: EventType, reason: &str, message: &str) -> Result<()> {
        self.lock().events.push((event_type, reason.into(), message.into()));
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Fake Coordinator //////////////////////////////////////////////////////////

/// The state held by `FakeStoreClient`.
pub struct FakeCoordinator {
    pub stores: Vec<StoreInfo>,
    pub max_replicas: u64,
    pub schedulers: BTreeSet<u64>,
    pub members: Vec<MemberInfo>,
    /// Every mutating call made, e.g. `remove_store:1`.
    pub calls: Vec<String>,
    /// Fail all calls to `list_stores`.
    pub fail_list: bool,
}

impl Default for FakeCoordinator {
    fn default() -> Self {
        Self {
            stores: vec![],
            max_replicas: 3,
            schedulers: BTreeSet::new(),
            members: vec![],
            calls: vec![],
            fail_list: false,
        }
    }
}

/// An in-memory `StoreLifecycleClient`.
#[derive(Default)]
pub struct FakeStoreClient {
    state: Mutex<FakeCoordinator>,
}

impl FakeStoreClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeCoordinator> {
        self.state.lock().unwrap()
    }

    /// All recorded calls.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Set the state of a store.
    pub fn set_store_state(&self, id: u64, state: StoreState) {
        if let Some(store) = self.lock().stores.iter_mut().find(|store| store.id == id) {
            store.state = state;
        }
    }
}

#[async_trait]
impl StoreLifecycleClient for FakeStoreClient {
    async fn list_stores(&self) -> Result<Vec<StoreInfo>> {
        let state = self.lock();
        if state.fail_list {
            bail!("connection refused");
        }
        Ok(state.stores.clone())
    }

    async fn get_replication_config(&self) -> Result<ReplicationConfig> {
        Ok(ReplicationConfig {
            max_replicas: self.lock().max_replicas,
        })
    }

    async fn get_leader_eviction_schedulers(&self, store_ids: &[u64]) -> Result<BTreeMap<u64, String>> {
        let state = self.lock();
        Ok(store_ids
            .iter()
            .filter(|id| state.schedulers.contains(*id))
            .map(|id| (*id, format!("evict-leader-scheduler-{}", id)))
            .collect())
    }

    async fn begin_leader_eviction(&self, store_id: u64) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("begin_leader_eviction:{}", store_id));
        state.schedulers.insert(store_id);
        Ok(())
    }

    async fn end_leader_eviction(&self, store_id: u64) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("end_leader_eviction:{}", store_id));
        state.schedulers.remove(&store_id);
        Ok(())
    }

    async fn remove_store(&self, store_id: u64) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("remove_store:{}", store_id));
        if let Some(store) = state.stores.iter_mut().find(|store| store.id == store_id) {
            if store.state == StoreState::Up {
                store.state = StoreState::Offline;
            }
        }
        Ok(())
    }

    async fn list_members(&self) -> Result<Vec<MemberInfo>> {
        Ok(self.lock().members.clone())
    }

    async fn remove_member(&self, member_id: u64) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("remove_member:{}", member_id));
        Ok(())
    }
}

/// Hands out the same fake client for every cluster.
pub struct FakeCoordinators(pub Arc<FakeStoreClient>);

impl CoordinatorControl for FakeCoordinators {
    fn client(&self, _cluster: &StrataCluster) -> Arc<dyn StoreLifecycleClient> {
        self.0.clone()
    }
}

/// Register the pods & claims of the given ordinals of a group.
pub fn add_replicas(resources: &FakeResources, cluster: &StrataCluster, group: MemberGroup, ordinals: impl IntoIterator<Item = i32>, store_ids: bool) {
    let name = RequiredMetadata::name(cluster);
    for ordinal in ordinals {
        let store_id = if store_ids { Some(ordinal as u64 + 1) } else { None };
        resources.add_pod(pod(name, group, ordinal, true, now() - Duration::hours(1), store_id));
        resources.add_claim(claim(&group.claim_name(name, ordinal)));
    }
}
