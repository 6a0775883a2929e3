//! Cluster control.
//!
//! Reconciles one `StrataCluster` per call: refreshes its status from the coordinator, syncs the
//! store & member IDs onto the replica pods, runs the scaler of every member group and applies
//! each scaler's decision to the group's StatefulSet.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::k8s::resources::{statefulset_slots, time_annotation, EventType, MetaPatch, ResourceControl};
use crate::pdapi::{CoordinatorControl, MemberInfo, StoreInfo};
use crate::scaler::{MemberGroup, MemberScaler, Scaler, ScalerDeps, StatelessScaler, StoreScaler};
use strata_core::crd::{FailureStore, MemberPhase, PdMember, PdStatus, RequiredMetadata, StoreState, StrataCluster, TikvStatus, TikvStore};
use strata_core::labels::{self, ANNO_NO_ACTIVE_STORE_SINCE, LABEL_MEMBER_ID, LABEL_STORE_ID};
use strata_core::{ErrorKind, FeatureGates, ReplicaSlots, SyncError, SyncResult};

/// Reconciles clusters.
pub struct ClusterControl {
    resources: Arc<dyn ResourceControl>,
    coordinators: Arc<dyn CoordinatorControl>,
    features: Arc<FeatureGates>,
    /// One scaler per member group, in the order groups are scaled.
    scalers: Vec<Box<dyn Scaler>>,
}

impl ClusterControl {
    /// Create a new instance with a scaler for every member group.
    pub fn new(deps: ScalerDeps) -> Self {
        Self {
            resources: deps.resources.clone(),
            coordinators: deps.coordinators.clone(),
            features: deps.features.clone(),
            scalers: vec![
                Box::new(MemberScaler::new(deps.clone())),
                Box::new(StoreScaler::new(deps.clone())),
                Box::new(StatelessScaler::new(deps)),
            ],
        }
    }

    /// Sync the cluster identified by the given `namespace/name` key.
    ///
    /// A cluster which no longer exists is a success. Fatal errors are also recorded as events
    /// on the cluster.
    #[tracing::instrument(level = "debug", skip(self, now))]
    pub async fn sync(&self, key: &str, now: DateTime<Utc>) -> SyncResult<()> {
        let (ns, name) = key
            .split_once('/')
            .ok_or_else(|| SyncError::fatal(format!("malformed cluster key {}", key)))?;
        let cluster = match self.resources.get_cluster(ns, name).await? {
            Some(cluster) => cluster,
            None => {
                tracing::debug!(key, "cluster no longer exists");
                return Ok(());
            }
        };

        let res = self.reconcile(&cluster, now).await;
        if let Err(err) = &res {
            for leaf in err.leaves().into_iter().filter(|leaf| leaf.kind() == ErrorKind::Fatal) {
                let msg = leaf.to_string();
                if let Err(event_err) = self.resources.record_event(&cluster, EventType::Warning, "FailedSync", &msg).await {
                    tracing::error!(error = ?event_err, key, "error recording event");
                }
            }
        }
        res
    }

    /// Reconcile the given cluster once.
    ///
    /// Every step runs regardless of the failure of others. The result takes the most severe
    /// error of all steps, so a group still waiting on its replicas never hides a failure.
    pub async fn reconcile(&self, cluster: &StrataCluster, now: DateTime<Utc>) -> SyncResult<()> {
        if cluster.spec.paused {
            tracing::info!(cluster = %cluster.key(), "cluster is paused, skipping reconciliation");
            return Ok(());
        }
        let (ns, name) = (RequiredMetadata::namespace(cluster), RequiredMetadata::name(cluster));
        let client = self.coordinators.client(cluster);
        let mut status = cluster.status.clone().unwrap_or_default();
        let mut errs = vec![];

        match client.list_stores().await {
            Ok(stores) => {
                let stores: Vec<_> = stores.into_iter().filter(|store| !store.is_tiflash()).collect();
                sync_store_status(&mut status.tikv, &stores, now);
                if let Err(err) = self.sync_store_pods(ns, name, &stores, now).await {
                    errs.push(err);
                }
            }
            Err(err) => errs.push(err.context("error listing stores").into()),
        }
        match client.list_members().await {
            Ok(members) => {
                sync_member_status(&mut status.pd, &members);
                if let Err(err) = self.sync_member_pods(ns, name, &members).await {
                    errs.push(err);
                }
            }
            Err(err) => errs.push(err.context("error listing members").into()),
        }

        let mut observed = cluster.clone();
        observed.status = Some(status.clone());
        for scaler in self.scalers.iter() {
            let group = scaler.group();
            let (phase, res) = self.scale_group(&observed, scaler.as_ref(), now).await;
            if let Some(phase) = phase {
                match group {
                    MemberGroup::Consensus => status.pd.phase = phase,
                    MemberGroup::Storage => status.tikv.phase = phase,
                    MemberGroup::Sql => status.tidb.phase = phase,
                }
            }
            if let Err(err) = res {
                errs.push(err);
            }
        }

        if cluster.status.as_ref() != Some(&status) {
            if let Err(err) = self.resources.update_cluster_status(cluster, &status).await {
                errs.push(err.into());
            }
        }
        SyncError::combine(errs)
    }

    /// Run one scaling pass for a group, applying the resulting replica slots.
    ///
    /// Returns the phase of the group, `None` if the group has nothing to scale.
    async fn scale_group(&self, cluster: &StrataCluster, scaler: &dyn Scaler, now: DateTime<Utc>) -> (Option<MemberPhase>, SyncResult<()>) {
        let group = scaler.group();
        let (ns, name) = (RequiredMetadata::namespace(cluster), RequiredMetadata::name(cluster));
        let spec = match group.spec(cluster) {
            Some(spec) => spec,
            None => return (None, Ok(())),
        };
        let sts_name = group.statefulset_name(name);
        let sts = match self.resources.get_statefulset(ns, &sts_name).await {
            Ok(Some(sts)) => sts,
            Ok(None) => {
                tracing::debug!(cluster = %cluster.key(), %group, "StatefulSet not yet created, skipping");
                return (None, Ok(()));
            }
            Err(err) => return (None, Err(err.into())),
        };

        let with_delete_slots = self.features.enabled(strata_core::features::ADVANCED_STATEFUL_SET);
        let old = match statefulset_slots(&sts, with_delete_slots) {
            Ok(old) => old,
            Err(err) => return (None, Err(err.into())),
        };
        let desired = if with_delete_slots {
            ReplicaSlots::new(spec.replicas, spec.delete_slots.iter().copied())
        } else {
            ReplicaSlots::with_replicas(spec.replicas)
        };
        let mut new = desired.clone();
        let mut res = scaler.scale(cluster, &old, &mut new, now).await;

        // Apply whatever progress was made, even if the pass as a whole failed.
        if new != old {
            tracing::info!(cluster = %cluster.key(), %group, from = %old, to = %new, "scaling StatefulSet");
            if let Err(err) = self.resources.scale_statefulset(ns, &sts_name, &new).await {
                let err = SyncError::from(err.context(format!("error scaling StatefulSet {}", sts_name)));
                res = match res {
                    Ok(()) => Err(err),
                    Err(prev) => Err(SyncError::Combined(vec![prev, err])),
                };
            }
        }
        let phase = if new.ordinals() == desired.ordinals() { MemberPhase::Normal } else { MemberPhase::Scale };
        (Some(phase), res)
    }

    /// Sync store IDs & store activity onto the storage replica pods.
    async fn sync_store_pods(&self, ns: &str, cluster: &str, stores: &[StoreInfo], now: DateTime<Utc>) -> SyncResult<()> {
        let group = MemberGroup::Storage;
        let pods = self
            .resources
            .list_pods(ns, &labels::group_selector(cluster, group.component()))
            .await?;

        // Prefer a live store over a tombstone left by a previous incarnation of the pod.
        let mut by_pod: BTreeMap<&str, &StoreInfo> = BTreeMap::new();
        for store in stores {
            let pod_name = store.pod_name();
            let replace = by_pod.get(pod_name).map(|prev| prev.state == StoreState::Tombstone).unwrap_or(true);
            if replace {
                by_pod.insert(pod_name, store);
            }
        }

        let mut errs = vec![];
        for pod in pods {
            let pod_name = match pod.metadata.name.as_deref() {
                Some(pod_name) => pod_name,
                None => continue,
            };
            let label = pod.metadata.labels.as_ref().and_then(|labels| labels.get(LABEL_STORE_ID));
            let since = time_annotation(&pod.metadata, ANNO_NO_ACTIVE_STORE_SINCE);
            let store = by_pod.get(pod_name);

            let mut patch = MetaPatch::default();
            if let Some(store) = store {
                let id = store.id.to_string();
                if label != Some(&id) {
                    patch = patch.label(LABEL_STORE_ID, id);
                }
            }
            let active = store.map(|store| store.state != StoreState::Tombstone).unwrap_or(false);
            if active && since.is_some() {
                patch = patch.remove_annotation(ANNO_NO_ACTIVE_STORE_SINCE);
            } else if !active && since.is_none() && label.is_some() {
                tracing::info!(pod = pod_name, "replica no longer has an active store");
                patch = patch.annotation(ANNO_NO_ACTIVE_STORE_SINCE, now.to_rfc3339());
            }
            if patch.is_empty() {
                continue;
            }
            if let Err(err) = self.resources.patch_pod_meta(ns, pod_name, &patch).await {
                errs.push(err.context(format!("error updating metadata of pod {}", pod_name)).into());
            }
        }
        SyncError::aggregate(errs)
    }

    /// Sync member IDs onto the consensus replica pods.
    async fn sync_member_pods(&self, ns: &str, cluster: &str, members: &[MemberInfo]) -> SyncResult<()> {
        let group = MemberGroup::Consensus;
        let pods = self
            .resources
            .list_pods(ns, &labels::group_selector(cluster, group.component()))
            .await?;
        let mut errs = vec![];
        for pod in pods {
            let pod_name = match pod.metadata.name.as_deref() {
                Some(pod_name) => pod_name,
                None => continue,
            };
            let member = match members.iter().find(|member| member.name == pod_name) {
                Some(member) => member,
                None => continue,
            };
            let id = member.id.to_string();
            if pod.metadata.labels.as_ref().and_then(|labels| labels.get(LABEL_MEMBER_ID)) == Some(&id) {
                continue;
            }
            let patch = MetaPatch::default().label(LABEL_MEMBER_ID, id);
            if let Err(err) = self.resources.patch_pod_meta(ns, pod_name, &patch).await {
                errs.push(err.context(format!("error updating metadata of pod {}", pod_name)).into());
            }
        }
        SyncError::aggregate(errs)
    }
}

/// Refresh the storage tier status from the coordinator's stores.
///
/// Down stores are tracked by pod name, keeping the time they were first seen down.
pub fn sync_store_status(tikv: &mut TikvStatus, stores: &[StoreInfo], now: DateTime<Utc>) {
    let (mut live, mut tombstones) = (BTreeMap::new(), BTreeMap::new());
    for store in stores {
        let entry = TikvStore {
            id: store.id.to_string(),
            ip: store.ip().to_string(),
            pod_name: store.pod_name().to_string(),
            state: store.state,
            leader_count: store.leader_count,
            last_heartbeat_time: store.last_heartbeat,
        };
        if store.state == StoreState::Tombstone {
            tombstones.insert(entry.id.clone(), entry);
        } else {
            live.insert(entry.id.clone(), entry);
        }
    }

    let mut failures = BTreeMap::new();
    for store in live.values().filter(|store| store.state == StoreState::Down) {
        let created_at = tikv
            .failure_stores
            .get(&store.pod_name)
            .filter(|prev| prev.store_id == store.id)
            .map(|prev| prev.created_at)
            .unwrap_or(now);
        failures.insert(
            store.pod_name.clone(),
            FailureStore {
                pod_name: store.pod_name.clone(),
                store_id: store.id.clone(),
                created_at,
            },
        );
    }

    tikv.bootstrapped = tikv.bootstrapped || live.values().any(|store| store.state == StoreState::Up);
    tikv.stores = live;
    tikv.tombstone_stores = tombstones;
    tikv.failure_stores = failures;
}

/// Refresh the consensus tier status from the coordinator's members.
pub fn sync_member_status(pd: &mut PdStatus, members: &[MemberInfo]) {
    pd.members = members
        .iter()
        .map(|member| {
            let entry = PdMember {
                name: member.name.clone(),
                id: member.id.to_string(),
                client_url: member.client_urls.first().cloned().unwrap_or_default(),
            };
            (member.name.clone(), entry)
        })
        .collect();
}
