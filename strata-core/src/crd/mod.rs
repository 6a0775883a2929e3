//! Strata CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod cluster;

use kube::Resource;

pub use cluster::{
    FailureStore, GroupStatus, MemberGroupSpec, MemberPhase, PdMember, PdStatus, StoreState, StrataCluster, StrataClusterSpec, StrataClusterStatus, TikvStatus,
    TikvStore,
};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for StrataCluster {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl StrataCluster {
    /// The queue key of this cluster, `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", RequiredMetadata::namespace(self), RequiredMetadata::name(self))
    }
}
