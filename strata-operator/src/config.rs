//! Runtime configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for metrics and healthchecks.
    pub http_port: u16,

    /// The Kubernetes namespace watched by this operator.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The number of reconciliation workers.
    #[serde(default = "Config::default_workers")]
    pub workers: usize,
    /// The interval at which all known clusters are re-enqueued.
    #[serde(default = "Config::default_resync_seconds")]
    pub resync_seconds: u64,
    /// The base delay of the per-key requeue backoff.
    #[serde(default = "Config::default_requeue_base_millis")]
    pub requeue_base_millis: u64,
    /// The ceiling of the per-key requeue backoff.
    #[serde(default = "Config::default_requeue_max_seconds")]
    pub requeue_max_seconds: u64,

    /// The timeout applied to each request made to a cluster coordinator.
    #[serde(default = "Config::default_coordinator_timeout_seconds")]
    pub coordinator_timeout_seconds: u64,
    /// How long to wait for leaders to be evicted from a store before removing it anyway.
    #[serde(default = "Config::default_evict_leader_timeout_seconds")]
    pub evict_leader_timeout_seconds: u64,
    /// The number of resync intervals to wait before an unseen replica is treated as abandoned.
    #[serde(default = "Config::default_grace_period_factor")]
    pub grace_period_factor: u32,
    /// The K8s cluster domain, used to build coordinator addresses.
    #[serde(default)]
    pub cluster_domain: Option<String>,

    /// Feature gate overrides, of the form `key1=true,key2=false`.
    #[serde(default, deserialize_with = "Config::parse_features")]
    pub features: BTreeMap<String, bool>,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    /// The periodic resync interval.
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }

    /// The window after which a replica without a store is considered abandoned.
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.resync_seconds * self.grace_period_factor as u64) as i64)
    }

    /// The leader eviction timeout.
    pub fn evict_leader_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.evict_leader_timeout_seconds as i64)
    }

    fn default_workers() -> usize {
        4
    }

    fn default_resync_seconds() -> u64 {
        30
    }

    fn default_requeue_base_millis() -> u64 {
        1000
    }

    fn default_requeue_max_seconds() -> u64 {
        100
    }

    fn default_coordinator_timeout_seconds() -> u64 {
        5
    }

    fn default_evict_leader_timeout_seconds() -> u64 {
        300
    }

    fn default_grace_period_factor() -> u32 {
        5
    }

    /// Parse the given feature gate overrides.
    fn parse_features<'de, D: Deserializer<'de>>(val: D) -> Result<BTreeMap<String, bool>, D::Error> {
        let raw: String = Deserialize::deserialize(val).map_err(|err| DeError::custom(format!("error parsing FEATURES: {}", err)))?;
        strata_core::features::parse(&raw).map_err(|err| DeError::custom(format!("error parsing FEATURES: {:#}", err)))
    }

    /// A config instance used for tests.
    #[cfg(test)]
    pub fn new_test() -> Self {
        Self {
            rust_log: "".into(),
            http_port: 7002,
            namespace: "default".into(),
            pod_name: "strata-operator-0".into(),
            workers: 2,
            resync_seconds: 30,
            requeue_base_millis: 10,
            requeue_max_seconds: 1,
            coordinator_timeout_seconds: 5,
            evict_leader_timeout_seconds: 300,
            grace_period_factor: 5,
            cluster_domain: None,
            features: BTreeMap::new(),
        }
    }
}
