pub mod crd;
pub mod error;
pub mod features;
pub mod labels;
pub mod slots;

pub use error::{ErrorKind, SyncError, SyncResult};
pub use features::FeatureGates;
pub use slots::ReplicaSlots;

/// Comma-separated list of canonical label selectors which match the
/// Strata Operator's labelling scheme.
pub const STRATA_OPERATOR_LABEL_SELECTORS: &str = "app.kubernetes.io/managed-by=strata-operator";
