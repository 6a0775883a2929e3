//! Feature gates.
//!
//! Gates are parsed once at startup and passed to every component which needs them. Reads are
//! lock free; updates go through `set`/`set_from_map`, which are serialized by a single lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;

/// Schedule replicas of a group to stable nodes across restarts.
pub const STABLE_SCHEDULING: &str = "StableScheduling";
/// Use an ordinal-aware replica set controller which honours delete slots.
pub const ADVANCED_STATEFUL_SET: &str = "AdvancedStatefulSet";
/// Allow the size of storage claims to be modified in place.
pub const VOLUME_MODIFYING: &str = "VolumeModifying";
/// Allow storage claims to be replaced.
pub const VOLUME_REPLACING: &str = "VolumeReplacing";

/// The set of known gates along with their default values.
pub fn default_gates() -> BTreeMap<String, bool> {
    [
        (STABLE_SCHEDULING, true),
        (ADVANCED_STATEFUL_SET, false),
        (VOLUME_MODIFYING, false),
        (VOLUME_REPLACING, false),
    ]
    .iter()
    .map(|(key, val)| (key.to_string(), *val))
    .collect()
}

/// A set of feature gates.
pub struct FeatureGates {
    gates: ArcSwap<BTreeMap<String, bool>>,
    write_lock: Mutex<()>,
}

impl FeatureGates {
    /// Create a new instance from the default gates along with the given overrides.
    pub fn new(overrides: &BTreeMap<String, bool>) -> Result<Self> {
        let this = Self {
            gates: ArcSwap::new(Arc::new(default_gates())),
            write_lock: Mutex::new(()),
        };
        this.set_from_map(overrides)?;
        Ok(this)
    }

    /// Check if the given gate is enabled. Unknown gates are disabled.
    pub fn enabled(&self, key: &str) -> bool {
        self.gates.load().get(key).copied().unwrap_or(false)
    }

    /// Update gates from a string of the form `key1=true,key2=false`.
    pub fn set(&self, value: &str) -> Result<()> {
        let overrides = parse(value)?;
        self.set_from_map(&overrides)
    }

    /// Update gates from the given map.
    pub fn set_from_map(&self, overrides: &BTreeMap<String, bool>) -> Result<()> {
        if overrides.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().map_err(|_| anyhow::anyhow!("feature gate lock poisoned"))?;
        let mut gates = self.gates.load().as_ref().clone();
        for (key, val) in overrides {
            if !gates.contains_key(key) {
                tracing::warn!(gate = %key, "setting unknown feature gate");
            }
            gates.insert(key.clone(), *val);
        }
        self.gates.store(Arc::new(gates));
        Ok(())
    }
}

impl fmt::Debug for FeatureGates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.gates.load().iter()).finish()
    }
}

impl fmt::Display for FeatureGates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gates = self.gates.load();
        let pairs: Vec<_> = gates.iter().map(|(key, val)| format!("{}={}", key, val)).collect();
        write!(f, "{}", pairs.join(","))
    }
}

/// Parse a gate string of the form `key1=true,key2=false`.
pub fn parse(value: &str) -> Result<BTreeMap<String, bool>> {
    let mut gates = BTreeMap::new();
    for pair in value.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let (key, val) = match pair.split_once('=') {
            Some((key, val)) => (key.trim(), val.trim()),
            None => bail!("missing bool value for feature gate `{}`", pair),
        };
        if key.is_empty() {
            bail!("missing key for feature gate `{}`", pair);
        }
        let val: bool = val.parse().with_context(|| format!("invalid bool value `{}` for feature gate `{}`", val, key))?;
        gates.insert(key.to_string(), val);
    }
    Ok(gates)
}
