//! Member scaling.
//!
//! Each member group has a `Scaler` which decides, from the last applied replica slots (`old`)
//! and the desired slots (`new`), which ordinals to add or remove in this pass. A scaler writes
//! the slots which should be applied back into `new`. Only ordinals which actually finished are
//! reflected there, so that the replica set never runs ahead of the replicas which were prepared
//! or confirmed removed.
//!
//! The direction of a pass is decided by comparing the active ordinal sets of `old` & `new`.
//! Additions are handled first; removals are only started once nothing remains to be added.

mod member;
mod stateless;
mod store;
#[cfg(test)]
mod store_test;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use member::MemberScaler;
pub use stateless::StatelessScaler;
pub use store::StoreScaler;

use crate::k8s::resources::{claim_is_deferred, pod_claim_names, EventType, MetaPatch, ResourceControl};
use crate::pdapi::CoordinatorControl;
use strata_core::crd::{MemberGroupSpec, RequiredMetadata, StrataCluster};
use strata_core::labels::ANNO_DEFER_DELETING;
use strata_core::{FeatureGates, ReplicaSlots, SyncError, SyncResult};

/// The member groups of a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemberGroup {
    /// The consensus tier, `pd`.
    Consensus,
    /// The storage tier, `tikv`.
    Storage,
    /// The SQL tier, `tidb`.
    Sql,
}

impl MemberGroup {
    /// The component name of this group.
    pub fn component(&self) -> &'static str {
        match self {
            Self::Consensus => "pd",
            Self::Storage => "tikv",
            Self::Sql => "tidb",
        }
    }

    /// The name of the StatefulSet backing this group.
    pub fn statefulset_name(&self, cluster: &str) -> String {
        format!("{}-{}", cluster, self.component())
    }

    /// The name of the pod with the given ordinal.
    pub fn pod_name(&self, cluster: &str, ordinal: i32) -> String {
        format!("{}-{}", self.statefulset_name(cluster), ordinal)
    }

    /// The ordinal of the given pod of this group, `None` if the pod is not one of its replicas.
    pub fn ordinal_of(&self, cluster: &str, pod_name: &str) -> Option<i32> {
        let prefix = format!("{}-", self.statefulset_name(cluster));
        pod_name.strip_prefix(&prefix)?.parse().ok()
    }

    /// The name of the storage claim of the given ordinal, as created by the StatefulSet's claim template.
    pub fn claim_name(&self, cluster: &str, ordinal: i32) -> String {
        format!("{}-{}", self.component(), self.pod_name(cluster, ordinal))
    }

    /// The spec of this group in the given cluster, if the group is declared.
    pub fn spec<'a>(&self, cluster: &'a StrataCluster) -> Option<&'a MemberGroupSpec> {
        match self {
            Self::Consensus => Some(&cluster.spec.pd),
            Self::Storage => Some(&cluster.spec.tikv),
            Self::Sql => cluster.spec.tidb.as_ref(),
        }
    }
}

impl std::fmt::Display for MemberGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.component())
    }
}

/// Scales one member group.
#[async_trait]
pub trait Scaler: Send + Sync {
    /// The group scaled by this scaler.
    fn group(&self) -> MemberGroup;

    /// Perform one scaling pass, writing the slots to apply into `new`.
    async fn scale(&self, cluster: &StrataCluster, old: &ReplicaSlots, new: &mut ReplicaSlots, now: DateTime<Utc>) -> SyncResult<()>;
}

/// Tunables shared by the scalers.
#[derive(Clone, Debug)]
pub struct ScalerSettings {
    /// How long to wait for leaders to leave a store before removing it anyway.
    pub evict_leader_timeout: chrono::Duration,
    /// How long a replica may go without a store before it is treated as abandoned.
    pub grace_period: chrono::Duration,
}

/// The collaborators shared by all scalers.
#[derive(Clone)]
pub struct ScalerDeps {
    pub resources: Arc<dyn ResourceControl>,
    pub coordinators: Arc<dyn CoordinatorControl>,
    pub features: Arc<FeatureGates>,
    pub settings: ScalerSettings,
}

impl ScalerDeps {
    /// Check if delete slots are honoured.
    pub fn delete_slots_enabled(&self) -> bool {
        self.features.enabled(strata_core::features::ADVANCED_STATEFUL_SET)
    }
}

/// The work of one scaling pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScalePlan {
    /// Add these ordinals, lowest first.
    Out(Vec<i32>),
    /// Remove these ordinals, highest first.
    In(Vec<i32>),
    /// Nothing to do.
    Noop,
}

/// Plan a scaling pass, acting on at most `parallelism` ordinals.
pub fn plan(old: &ReplicaSlots, new: &ReplicaSlots, parallelism: i32) -> ScalePlan {
    let limit = parallelism.max(1) as usize;
    let (old_ords, new_ords) = (old.ordinals(), new.ordinals());
    let additions: Vec<i32> = new_ords.difference(&old_ords).copied().take(limit).collect();
    if !additions.is_empty() {
        return ScalePlan::Out(additions);
    }
    let mut deletions: Vec<i32> = old_ords.difference(&new_ords).copied().collect();
    deletions.reverse();
    deletions.truncate(limit);
    if !deletions.is_empty() {
        return ScalePlan::In(deletions);
    }
    ScalePlan::Noop
}

/// Pick the parallelism of the given plan from the group spec.
pub fn plan_for(spec: &MemberGroupSpec, old: &ReplicaSlots, new: &ReplicaSlots) -> ScalePlan {
    match plan(old, new, spec.scale_out_parallelism) {
        ScalePlan::Out(ords) => ScalePlan::Out(ords),
        ScalePlan::Noop => ScalePlan::Noop,
        ScalePlan::In(_) => plan(old, new, spec.scale_in_parallelism),
    }
}

/// Compute the slots to apply once the given ordinals of a plan have finished.
///
/// Without delete slots a replica set can only grow or shrink at its end, so only the leading
/// run of finished ordinals in plan order is taken into account.
pub fn apply_finished(old: &ReplicaSlots, new: &ReplicaSlots, plan: &ScalePlan, finished: &BTreeSet<i32>, with_delete_slots: bool) -> ReplicaSlots {
    let (candidates, is_out) = match plan {
        ScalePlan::Out(ords) => (ords, true),
        ScalePlan::In(ords) => (ords, false),
        ScalePlan::Noop => return old.clone(),
    };
    let done: BTreeSet<i32> = if with_delete_slots {
        candidates.iter().copied().filter(|ord| finished.contains(ord)).collect()
    } else {
        candidates.iter().copied().take_while(|ord| finished.contains(ord)).collect()
    };
    if done.is_empty() {
        return old.clone();
    }
    let mut ordinals = old.ordinals();
    if is_out {
        ordinals.extend(done);
    } else {
        ordinals.retain(|ord| !done.contains(ord));
    }
    let reserved = if with_delete_slots { new.delete_slots().clone() } else { BTreeSet::new() };
    ReplicaSlots::from_ordinals(&ordinals, &reserved)
}

/// Run a scale-out pass over the given ordinals.
///
/// With `check_claims` set, an ordinal only finishes once no stale storage claim remains for it.
pub(crate) async fn scale_out(
    deps: &ScalerDeps, group: MemberGroup, cluster: &StrataCluster, old: &ReplicaSlots, new: &mut ReplicaSlots, ordinals: Vec<i32>, now: DateTime<Utc>,
    check_claims: bool,
) -> SyncResult<()> {
    let plan = ScalePlan::Out(ordinals.clone());
    let mut finished = BTreeSet::new();
    let mut errs = vec![];
    for ordinal in ordinals {
        if check_claims {
            if let Err(err) = ensure_clean_storage(deps, group, cluster, ordinal, now).await {
                errs.push(err);
                continue;
            }
        }
        tracing::info!(cluster = %cluster.key(), %group, ordinal, "scaling out replica");
        finished.insert(ordinal);
    }
    *new = apply_finished(old, new, &plan, &finished, deps.delete_slots_enabled());
    SyncError::aggregate(errs)
}

/// Ensure no storage claim is left over from a previous replica of the given ordinal.
async fn ensure_clean_storage(deps: &ScalerDeps, group: MemberGroup, cluster: &StrataCluster, ordinal: i32, now: DateTime<Utc>) -> SyncResult<()> {
    let (ns, name) = (RequiredMetadata::namespace(cluster), RequiredMetadata::name(cluster));
    let claim_name = group.claim_name(name, ordinal);
    let claim = match deps.resources.get_claim(ns, &claim_name).await? {
        Some(claim) => claim,
        None => return Ok(()),
    };
    if !claim_is_deferred(&claim) {
        tracing::info!(cluster = %cluster.key(), %group, ordinal, claim = %claim_name, "releasing stale storage claim before scale out");
        let patch = MetaPatch::default().annotation(ANNO_DEFER_DELETING, now.to_rfc3339());
        deps.resources.patch_claim_meta(ns, &claim_name, &patch).await?;
    }
    Err(SyncError::requeue(format!(
        "{} ordinal {} has a stale storage claim {} which must be reclaimed before scaling out",
        group, ordinal, claim_name
    )))
}

/// Mark the storage claims of a removed replica for deferred deletion.
///
/// Covers every claim mounted by the pod (if it still exists) and the ordinal's templated claim.
pub(crate) async fn release_claims(deps: &ScalerDeps, group: MemberGroup, cluster: &StrataCluster, ordinal: i32, now: DateTime<Utc>) -> SyncResult<()> {
    let (ns, name) = (RequiredMetadata::namespace(cluster), RequiredMetadata::name(cluster));
    let mut claims = BTreeSet::new();
    if let Some(pod) = deps.resources.get_pod(ns, &group.pod_name(name, ordinal)).await? {
        claims.extend(pod_claim_names(&pod));
    }
    claims.insert(group.claim_name(name, ordinal));

    let patch = MetaPatch::default().annotation(ANNO_DEFER_DELETING, now.to_rfc3339());
    for claim_name in claims {
        match deps.resources.get_claim(ns, &claim_name).await? {
            Some(claim) if !claim_is_deferred(&claim) => {
                tracing::info!(cluster = %cluster.key(), %group, ordinal, claim = %claim_name, "marking storage claim for deferred deletion");
                deps.resources.patch_claim_meta(ns, &claim_name, &patch).await?;
            }
            _ => continue,
        }
    }
    Ok(())
}

/// Record a failed precondition as a warning on the cluster, returning the error.
pub(crate) async fn precondition_failed(deps: &ScalerDeps, cluster: &StrataCluster, msg: String) -> SyncError {
    tracing::warn!(cluster = %cluster.key(), "{}", msg);
    if let Err(err) = deps.resources.record_event(cluster, EventType::Warning, "FailedScaleIn", &msg).await {
        tracing::error!(error = ?err, cluster = %cluster.key(), "error recording event");
    }
    SyncError::precondition(msg)
}
