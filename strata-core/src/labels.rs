//! Canonical label & annotation keys used on objects managed by the operator.

use std::collections::BTreeMap;

/// The name the operator uses for field management and event sourcing.
pub const APP_NAME: &str = "strata-operator";

/// The canonical K8s label identifying the managing controller.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// The canonical K8s label identifying the owning cluster.
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// The canonical K8s label identifying the member group of a replica.
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// The pod label carrying the coordinator's store ID for a storage replica.
pub const LABEL_STORE_ID: &str = "strata.rs/store-id";
/// The pod label carrying the coordinator's member ID for a consensus replica.
pub const LABEL_MEMBER_ID: &str = "strata.rs/member-id";

/// StatefulSet annotation holding the JSON encoded set of deleted ordinals.
pub const ANNO_DELETE_SLOTS: &str = "strata.rs/delete-slots";
/// Pod annotation recording when scale-in of the replica began, RFC3339.
pub const ANNO_SCALE_IN_TIME: &str = "strata.rs/scale-in-time";
/// Pod annotation recording since when the replica has had no active store, RFC3339.
pub const ANNO_NO_ACTIVE_STORE_SINCE: &str = "strata.rs/no-active-store-since";
/// Storage claim annotation which releases the claim to the storage reclamation controller.
pub const ANNO_DEFER_DELETING: &str = "strata.rs/defer-deleting";

/// The store label key used by the coordinator to tag a store's engine.
pub const STORE_LABEL_ENGINE: &str = "engine";
/// Stores carrying this engine value are columnar replicas and not part of the storage group.
pub const STORE_ENGINE_TIFLASH: &str = "tiflash";

/// Set the canonical labels on an object controlled by the operator.
pub fn set_canonical_labels(labels: &mut BTreeMap<String, String>, cluster: &str, component: &str) {
    labels.insert(LABEL_MANAGED_BY.into(), APP_NAME.into());
    labels.insert(LABEL_INSTANCE.into(), cluster.into());
    labels.insert(LABEL_COMPONENT.into(), component.into());
}

/// Build a label selector matching the replicas of one member group of a cluster.
pub fn group_selector(cluster: &str, component: &str) -> String {
    format!("{}={},{}={},{}={}", LABEL_MANAGED_BY, APP_NAME, LABEL_INSTANCE, cluster, LABEL_COMPONENT, component)
}
