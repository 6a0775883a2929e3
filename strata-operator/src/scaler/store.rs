//! Storage tier scaling.
//!
//! Removing a storage replica is a multi-pass protocol driven by the store's state as reported by
//! the coordinator:
//!
//! 1. `Up`/`Offline`/`Down`: stamp the scale-in start time on the pod, evict the store's leaders,
//!    then once evicted (or timed out) request removal of the store. Requeue in all cases.
//! 2. `Tombstone`: the store is gone. Release the replica's storage claims and finish.
//! 3. Unknown: the replica never joined, or its store vanished. It finishes only once a grace
//!    period has elapsed, never speculatively.
//!
//! A replica which is active again after its scale-in was abandoned has its eviction ended and
//! its start time cleared on the next scale-out or steady pass.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{apply_finished, plan_for, precondition_failed, release_claims, scale_out, MemberGroup, ScalePlan, Scaler, ScalerDeps};
use crate::k8s::resources::{pod_is_ready, time_annotation, EventType, MetaPatch};
use crate::pdapi::{StoreInfo, StoreLifecycleClient};
use strata_core::crd::{RequiredMetadata, StoreState, StrataCluster};
use strata_core::labels::{self, ANNO_NO_ACTIVE_STORE_SINCE, ANNO_SCALE_IN_TIME, LABEL_STORE_ID};
use strata_core::{ReplicaSlots, SyncError, SyncResult};

/// Scales the storage tier.
pub struct StoreScaler {
    deps: ScalerDeps,
}

impl StoreScaler {
    /// Create a new instance.
    pub fn new(deps: ScalerDeps) -> Self {
        Self { deps }
    }
}

/// Quorum bookkeeping across the ordinals of one scale-in batch.
struct Quorum {
    /// Whether the check applies at all.
    enforced: bool,
    /// The number of stores which were Up at the start of the batch.
    up_count: u64,
    /// The number of Up stores removed so far in this batch.
    deleted_up: u64,
    max_replicas: u64,
}

impl Quorum {
    /// Check if removing a store in the given state keeps enough Up stores.
    fn allows(&self, state: StoreState) -> bool {
        if !self.enforced || state != StoreState::Up {
            return true;
        }
        self.up_count.saturating_sub(self.deleted_up) > self.max_replicas
    }
}

#[async_trait]
impl Scaler for StoreScaler {
    fn group(&self) -> MemberGroup {
        MemberGroup::Storage
    }

    #[tracing::instrument(level = "debug", skip(self, cluster, old, new, now), fields(cluster = %cluster.key()))]
    async fn scale(&self, cluster: &StrataCluster, old: &ReplicaSlots, new: &mut ReplicaSlots, now: DateTime<Utc>) -> SyncResult<()> {
        let spec = &cluster.spec.tikv;
        let res = match plan_for(spec, old, new) {
            ScalePlan::Out(ordinals) => scale_out(&self.deps, self.group(), cluster, old, new, ordinals, now, true).await,
            ScalePlan::In(ordinals) => return self.scale_in(cluster, old, new, ordinals, now).await,
            ScalePlan::Noop => {
                *new = old.clone();
                Ok(())
            }
        };
        let cancelled = self.cancel_scale_in(cluster, new).await;
        SyncError::combine([res, cancelled].into_iter().filter_map(|res| res.err()).collect())
    }
}

impl StoreScaler {
    async fn scale_in(&self, cluster: &StrataCluster, old: &ReplicaSlots, new: &mut ReplicaSlots, ordinals: Vec<i32>, now: DateTime<Utc>) -> SyncResult<()> {
        let client = self.deps.coordinators.client(cluster);
        let stores: Vec<StoreInfo> = match client.list_stores().await {
            Ok(stores) => stores.into_iter().filter(|store| !store.is_tiflash()).collect(),
            Err(err) => {
                *new = old.clone();
                return Err(err.context("error listing stores").into());
            }
        };

        let bootstrapped = cluster.status.as_ref().map(|status| status.tikv.bootstrapped).unwrap_or(false) || !stores.is_empty();
        let mut quorum = Quorum {
            enforced: bootstrapped,
            up_count: stores.iter().filter(|store| store.state == StoreState::Up).count() as u64,
            deleted_up: 0,
            max_replicas: 0,
        };
        if quorum.enforced {
            match client.get_replication_config().await {
                Ok(config) => quorum.max_replicas = config.max_replicas,
                Err(err) => {
                    *new = old.clone();
                    return Err(err.context("error fetching replication config").into());
                }
            }
        }

        let plan = ScalePlan::In(ordinals.clone());
        let mut finished = BTreeSet::new();
        let mut errs = vec![];
        for ordinal in ordinals {
            match self.scale_in_one(cluster, client.as_ref(), &stores, &mut quorum, ordinal, now).await {
                Ok(()) => {
                    finished.insert(ordinal);
                }
                Err(err) => errs.push(err),
            }
        }
        *new = apply_finished(old, new, &plan, &finished, self.deps.delete_slots_enabled());
        SyncError::aggregate(errs)
    }

    /// Undo what an abandoned scale-in left on replicas which are active again.
    ///
    /// Ends the leader eviction of their stores and clears their scale-in start time, so that a
    /// later scale-in of the same ordinal evicts leaders afresh.
    async fn cancel_scale_in(&self, cluster: &StrataCluster, active: &ReplicaSlots) -> SyncResult<()> {
        let group = self.group();
        let (ns, name) = (RequiredMetadata::namespace(cluster), RequiredMetadata::name(cluster));
        let pods = self.deps.resources.list_pods(ns, &labels::group_selector(name, group.component())).await?;
        let pending: Vec<String> = pods
            .iter()
            .filter(|pod| pod.metadata.annotations.as_ref().map(|annos| annos.contains_key(ANNO_SCALE_IN_TIME)).unwrap_or(false))
            .filter_map(|pod| pod.metadata.name.clone())
            .filter(|pod_name| group.ordinal_of(name, pod_name).map(|ord| active.contains(ord)).unwrap_or(false))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let client = self.deps.coordinators.client(cluster);
        let stores = client.list_stores().await?;
        let store_ids: Vec<u64> = stores
            .iter()
            .filter(|store| store.state != StoreState::Tombstone && pending.iter().any(|pod_name| pod_name == store.pod_name()))
            .map(|store| store.id)
            .collect();
        let schedulers = client.get_leader_eviction_schedulers(&store_ids).await?;

        let mut errs = vec![];
        for store_id in schedulers.keys() {
            tracing::info!(cluster = %cluster.key(), store_id, "ending leader eviction of store which is no longer scaled in");
            if let Err(err) = client.end_leader_eviction(*store_id).await {
                errs.push(err.context(format!("error ending leader eviction of store {}", store_id)).into());
            }
        }
        if !errs.is_empty() {
            return SyncError::combine(errs);
        }
        let patch = MetaPatch::default().remove_annotation(ANNO_SCALE_IN_TIME);
        for pod_name in pending {
            tracing::info!(cluster = %cluster.key(), pod = %pod_name, "replica is active again, cancelling its scale in");
            if let Err(err) = self.deps.resources.patch_pod_meta(ns, &pod_name, &patch).await {
                errs.push(err.context(format!("error clearing scale-in time of pod {}", pod_name)).into());
                continue;
            }
            let msg = format!("{} is active again, its scale in was cancelled", pod_name);
            if let Err(err) = self.deps.resources.record_event(cluster, EventType::Normal, "CancelledScaleIn", &msg).await {
                tracing::error!(error = ?err, cluster = %cluster.key(), "error recording event");
            }
        }
        SyncError::combine(errs)
    }

    /// Drive the removal of one replica a single step forward.
    #[tracing::instrument(level = "debug", skip(self, cluster, client, stores, quorum, now), fields(cluster = %cluster.key()))]
    async fn scale_in_one(
        &self, cluster: &StrataCluster, client: &dyn StoreLifecycleClient, stores: &[StoreInfo], quorum: &mut Quorum, ordinal: i32, now: DateTime<Utc>,
    ) -> SyncResult<()> {
        let group = self.group();
        let (ns, name) = (RequiredMetadata::namespace(cluster), RequiredMetadata::name(cluster));
        let pod_name = group.pod_name(name, ordinal);

        // A pod may have a tombstone from a previous incarnation along with a live store.
        let of_pod = |store: &&StoreInfo| store.pod_name() == pod_name;
        let store = stores
            .iter()
            .filter(of_pod)
            .find(|store| store.state != StoreState::Tombstone)
            .or_else(|| stores.iter().find(of_pod));

        match store {
            Some(store) if store.state != StoreState::Tombstone => {
                if !quorum.allows(store.state) {
                    let msg = format!(
                        "can not remove store {} of {}: {} Up stores would remain, at least {} are required",
                        store.id,
                        pod_name,
                        quorum.up_count.saturating_sub(quorum.deleted_up + 1),
                        quorum.max_replicas
                    );
                    return Err(precondition_failed(&self.deps, cluster, msg).await);
                }
                let pod = self
                    .deps
                    .resources
                    .get_pod(ns, &pod_name)
                    .await?
                    .ok_or_else(|| SyncError::fatal(format!("pod {} of store {} not found", pod_name, store.id)))?;
                self.check_store_label(&pod.metadata, &pod_name, store.id)?;

                let started = match time_annotation(&pod.metadata, ANNO_SCALE_IN_TIME) {
                    Some(started) => started,
                    None => {
                        let patch = MetaPatch::default().annotation(ANNO_SCALE_IN_TIME, now.to_rfc3339());
                        self.deps.resources.patch_pod_meta(ns, &pod_name, &patch).await?;
                        now
                    }
                };
                let evicted_or_timeout = now > started + self.deps.settings.evict_leader_timeout || store.leader_count == 0;
                if !evicted_or_timeout {
                    let schedulers = client.get_leader_eviction_schedulers(&[store.id]).await?;
                    if !schedulers.contains_key(&store.id) {
                        tracing::info!(ordinal, store_id = store.id, "beginning leader eviction");
                        client.begin_leader_eviction(store.id).await?;
                    }
                    return Err(SyncError::requeue(format!(
                        "waiting for {} leaders of store {} of {} to be evicted",
                        store.leader_count, store.id, pod_name
                    )));
                }
                if store.state != StoreState::Offline {
                    tracing::info!(ordinal, store_id = store.id, state = %store.state, "removing store");
                    client.remove_store(store.id).await?;
                    if store.state == StoreState::Up {
                        quorum.deleted_up += 1;
                    }
                }
                Err(SyncError::requeue(format!(
                    "store {} of {} is still in cluster, waiting for it to become tombstone",
                    store.id, pod_name
                )))
            }
            Some(store) => {
                if let Some(pod) = self.deps.resources.get_pod(ns, &pod_name).await? {
                    self.check_store_label(&pod.metadata, &pod_name, store.id)?;
                }
                tracing::info!(ordinal, store_id = store.id, "store is tombstone, finishing scale in");
                release_claims(&self.deps, group, cluster, ordinal, now).await?;
                let schedulers = client.get_leader_eviction_schedulers(&[store.id]).await?;
                if schedulers.contains_key(&store.id) {
                    client.end_leader_eviction(store.id).await?;
                }
                Ok(())
            }
            None => {
                let pod = self
                    .deps
                    .resources
                    .get_pod(ns, &pod_name)
                    .await?
                    .ok_or_else(|| SyncError::fatal(format!("pod {} not found", pod_name)))?;
                let grace = self.deps.settings.grace_period;
                if !pod_is_ready(&pod) {
                    let created = pod.metadata.creation_timestamp.as_ref().map(|ts| ts.0).unwrap_or(now);
                    if now < created + grace {
                        return Err(SyncError::requeue(format!(
                            "{} is not ready and has no store, waiting until {} before treating it as abandoned",
                            pod_name,
                            (created + grace).to_rfc3339()
                        )));
                    }
                    tracing::info!(ordinal, "replica never joined the cluster, finishing scale in");
                    release_claims(&self.deps, group, cluster, ordinal, now).await?;
                    return Ok(());
                }
                if let Some(since) = time_annotation(&pod.metadata, ANNO_NO_ACTIVE_STORE_SINCE) {
                    if now > since + grace {
                        tracing::info!(ordinal, since = %since.to_rfc3339(), "replica has had no active store for too long, finishing scale in");
                        release_claims(&self.deps, group, cluster, ordinal, now).await?;
                        return Ok(());
                    }
                }
                Err(SyncError::fatal(format!("{} not found in cluster", pod_name)))
            }
        }
    }

    /// Ensure the pod's store label has been synced to the given store.
    fn check_store_label(&self, meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta, pod_name: &str, store_id: u64) -> SyncResult<()> {
        let label = meta.labels.as_ref().and_then(|labels| labels.get(LABEL_STORE_ID));
        match label {
            Some(id) if *id == store_id.to_string() => Ok(()),
            Some(id) => Err(SyncError::fatal(format!(
                "{} is labelled with store {} but the coordinator reports store {}",
                pod_name, id, store_id
            ))),
            None => Err(SyncError::fatal(format!("{} has no {} label yet", pod_name, LABEL_STORE_ID))),
        }
    }
}
