//! SQL tier scaling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{apply_finished, plan_for, scale_out, MemberGroup, ScalePlan, Scaler, ScalerDeps};
use strata_core::crd::StrataCluster;
use strata_core::{ReplicaSlots, SyncResult};

/// Scales the stateless SQL tier, where every planned ordinal finishes immediately.
pub struct StatelessScaler {
    deps: ScalerDeps,
}

impl StatelessScaler {
    pub fn new(deps: ScalerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Scaler for StatelessScaler {
    fn group(&self) -> MemberGroup {
        MemberGroup::Sql
    }

    async fn scale(&self, cluster: &StrataCluster, old: &ReplicaSlots, new: &mut ReplicaSlots, now: DateTime<Utc>) -> SyncResult<()> {
        let spec = match cluster.spec.tidb.as_ref() {
            Some(spec) => spec,
            None => {
                *new = old.clone();
                return Ok(());
            }
        };
        match plan_for(spec, old, new) {
            ScalePlan::Out(ordinals) => scale_out(&self.deps, self.group(), cluster, old, new, ordinals, now, false).await,
            ScalePlan::In(ordinals) => {
                tracing::info!(cluster = %cluster.key(), ?ordinals, "scaling in stateless replicas");
                let finished = ordinals.iter().copied().collect();
                *new = apply_finished(old, new, &ScalePlan::In(ordinals), &finished, self.deps.delete_slots_enabled());
                Ok(())
            }
            ScalePlan::Noop => {
                *new = old.clone();
                Ok(())
            }
        }
    }
}
