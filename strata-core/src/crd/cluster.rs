//! StrataCluster CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type StrataCluster = StrataClusterCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the StrataCluster resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "StrataClusterCRD",
    status = "StrataClusterStatus",
    group = "strata.rs",
    version = "v1alpha1",
    kind = "StrataCluster",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "sc",
    printcolumn = r#"{"name":"PD","type":"number","jsonPath":".spec.pd.replicas"}"#,
    printcolumn = r#"{"name":"TiKV","type":"number","jsonPath":".spec.tikv.replicas"}"#,
    printcolumn = r#"{"name":"TiDB","type":"number","jsonPath":".spec.tidb.replicas"}"#,
    printcolumn = r#"{"name":"Paused","type":"boolean","jsonPath":".spec.paused"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StrataClusterSpec {
    /// Stop reconciling this cluster.
    #[serde(default)]
    pub paused: bool,
    /// Override the URL of the cluster's coordinator.
    ///
    /// Defaults to the coordinator's in-cluster service address.
    #[serde(default)]
    pub coordinator_url: Option<String>,

    /// The consensus tier.
    pub pd: MemberGroupSpec,
    /// The storage tier.
    pub tikv: MemberGroupSpec,
    /// The SQL tier.
    #[serde(default)]
    pub tidb: Option<MemberGroupSpec>,
}

/// The desired shape of a member group.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberGroupSpec {
    /// The desired number of replicas.
    pub replicas: i32,
    /// The maximum number of replicas removed in one scaling pass.
    #[serde(default = "MemberGroupSpec::default_parallelism")]
    pub scale_in_parallelism: i32,
    /// The maximum number of replicas added in one scaling pass.
    #[serde(default = "MemberGroupSpec::default_parallelism")]
    pub scale_out_parallelism: i32,
    /// Ordinals to remove out of the usual highest-first order.
    ///
    /// Only honoured when the `AdvancedStatefulSet` feature gate is enabled.
    #[serde(default)]
    pub delete_slots: BTreeSet<i32>,
}

impl MemberGroupSpec {
    fn default_parallelism() -> i32 {
        1
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StrataClusterStatus {
    #[serde(default)]
    pub pd: PdStatus,
    #[serde(default)]
    pub tikv: TikvStatus,
    #[serde(default)]
    pub tidb: GroupStatus,
}

/// The phase of a member group.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum MemberPhase {
    /// The group has converged on its desired size.
    Normal,
    /// The group is being scaled.
    Scale,
}

impl Default for MemberPhase {
    fn default() -> Self {
        Self::Normal
    }
}

/// Status common to every group.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatus {
    #[serde(default)]
    pub phase: MemberPhase,
}

/// Status of the consensus tier.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PdStatus {
    #[serde(default)]
    pub phase: MemberPhase,
    /// Members of the consensus tier, by member name.
    #[serde(default)]
    pub members: BTreeMap<String, PdMember>,
}

/// A consensus tier member as observed by the coordinator.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PdMember {
    pub name: String,
    /// Member ID, as a string to avoid precision loss.
    pub id: String,
    #[serde(default)]
    pub client_url: String,
}

/// Status of the storage tier.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TikvStatus {
    #[serde(default)]
    pub phase: MemberPhase,
    /// Whether the storage tier has ever had a store come up.
    #[serde(default)]
    pub bootstrapped: bool,
    /// Stores which are not tombstones, by store ID.
    #[serde(default)]
    pub stores: BTreeMap<String, TikvStore>,
    /// Tombstone stores, by store ID.
    #[serde(default)]
    pub tombstone_stores: BTreeMap<String, TikvStore>,
    /// Stores observed as down, by pod name.
    #[serde(default)]
    pub failure_stores: BTreeMap<String, FailureStore>,
}

/// A storage tier store as observed by the coordinator.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TikvStore {
    /// Store ID, as a string to avoid precision loss.
    pub id: String,
    pub ip: String,
    pub pod_name: String,
    pub state: StoreState,
    #[serde(default)]
    pub leader_count: i64,
    #[serde(default)]
    pub last_heartbeat_time: Option<DateTime<Utc>>,
}

/// A store which was observed as down.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureStore {
    pub pod_name: String,
    pub store_id: String,
    /// When the store was first observed as down.
    pub created_at: DateTime<Utc>,
}

/// The lifecycle state of a store.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum StoreState {
    Up,
    Offline,
    Down,
    Tombstone,
}

impl StoreState {
    /// Parse a state name as reported by the coordinator.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Up" => Some(Self::Up),
            "Offline" => Some(Self::Offline),
            "Down" | "Disconnected" => Some(Self::Down),
            "Tombstone" => Some(Self::Tombstone),
            _ => None,
        }
    }
}

impl std::fmt::Display for StoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Up => "Up",
                Self::Offline => "Offline",
                Self::Down => "Down",
                Self::Tombstone => "Tombstone",
            }
        )
    }
}
