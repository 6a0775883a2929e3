//! Consensus tier scaling.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{apply_finished, plan_for, precondition_failed, release_claims, scale_out, MemberGroup, ScalePlan, Scaler, ScalerDeps};
use strata_core::crd::{RequiredMetadata, StrataCluster};
use strata_core::{ReplicaSlots, SyncError, SyncResult};

/// Scales the consensus tier.
///
/// A member is removed through the coordinator; its replica finishes once the coordinator no
/// longer lists it. The last remaining member is never removed.
pub struct MemberScaler {
    deps: ScalerDeps,
}

impl MemberScaler {
    /// Create a new instance.
    pub fn new(deps: ScalerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Scaler for MemberScaler {
    fn group(&self) -> MemberGroup {
        MemberGroup::Consensus
    }

    #[tracing::instrument(level = "debug", skip(self, cluster, old, new, now), fields(cluster = %cluster.key()))]
    async fn scale(&self, cluster: &StrataCluster, old: &ReplicaSlots, new: &mut ReplicaSlots, now: DateTime<Utc>) -> SyncResult<()> {
        match plan_for(&cluster.spec.pd, old, new) {
            ScalePlan::Out(ordinals) => scale_out(&self.deps, self.group(), cluster, old, new, ordinals, now, true).await,
            ScalePlan::In(ordinals) => self.scale_in(cluster, old, new, ordinals, now).await,
            ScalePlan::Noop => {
                *new = old.clone();
                Ok(())
            }
        }
    }
}

impl MemberScaler {
    async fn scale_in(&self, cluster: &StrataCluster, old: &ReplicaSlots, new: &mut ReplicaSlots, ordinals: Vec<i32>, now: DateTime<Utc>) -> SyncResult<()> {
        let group = self.group();
        let name = RequiredMetadata::name(cluster);
        let client = self.deps.coordinators.client(cluster);
        let members = match client.list_members().await {
            Ok(members) => members,
            Err(err) => {
                *new = old.clone();
                return Err(err.context("error listing members").into());
            }
        };

        let plan = ScalePlan::In(ordinals.clone());
        let mut remaining = members.len();
        let mut finished = BTreeSet::new();
        let mut errs = vec![];
        for ordinal in ordinals {
            let pod_name = group.pod_name(name, ordinal);
            let member = match members.iter().find(|member| member.name == pod_name) {
                Some(member) => member,
                None => {
                    match release_claims(&self.deps, group, cluster, ordinal, now).await {
                        Ok(()) => {
                            tracing::info!(ordinal, "member has left the cluster, finishing scale in");
                            finished.insert(ordinal);
                        }
                        Err(err) => errs.push(err),
                    }
                    continue;
                }
            };
            if remaining <= 1 {
                let msg = format!("can not remove member {} of {}: it is the last member of the cluster", member.id, pod_name);
                errs.push(precondition_failed(&self.deps, cluster, msg).await);
                continue;
            }
            tracing::info!(ordinal, member_id = member.id, "removing member");
            if let Err(err) = client.remove_member(member.id).await {
                errs.push(err.context(format!("error removing member {} of {}", member.id, pod_name)).into());
                continue;
            }
            remaining -= 1;
            errs.push(SyncError::requeue(format!("member {} of {} removed, waiting for it to leave the cluster", member.id, pod_name)));
        }
        *new = apply_finished(old, new, &plan, &finished, self.deps.delete_slots_enabled());
        SyncError::aggregate(errs)
    }
}
