//! Grouped counters reported by the execution engine.
//!
//! Workers accumulate named counters during a run; after the job reaches a
//! terminal state the engine hands the orchestrator a [`Counters`] snapshot.
//! Counters are grouped, and within a group keyed by string - output indices
//! are used as keys for the per-output groups this crate consumes.
//!
//! The orchestrator reads one group directly: [`NONZERO_GROUP`], keyed by
//! result output index, merged into the final shapes by the reconciler.

use std::collections::HashMap;

use serde_json::{json, Value};

/// Counter group holding per-output non-zero cell counts.
pub const NONZERO_GROUP: &str = "nonzero_cells";

/// A snapshot of grouped engine counters.
///
/// Missing groups and keys read as zero, matching how engines report
/// counters that were never incremented.
#[derive(Clone, Debug, Default)]
pub struct Counters {
    groups: HashMap<String, HashMap<String, u64>>,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one counter; zero when the group or key is absent.
    #[must_use]
    pub fn get(&self, group: &str, key: &str) -> u64 {
        self.groups
            .get(group)
            .and_then(|g| g.get(key))
            .copied()
            .unwrap_or(0)
    }

    /// Set one counter, creating the group as needed.
    pub fn set(&mut self, group: impl Into<String>, key: impl Into<String>, value: u64) {
        self.groups
            .entry(group.into())
            .or_default()
            .insert(key.into(), value);
    }

    /// Add to one counter, creating it at zero first.
    pub fn increment(&mut self, group: impl Into<String>, key: impl Into<String>, delta: u64) {
        let counter = self
            .groups
            .entry(group.into())
            .or_default()
            .entry(key.into())
            .or_insert(0);
        *counter += delta;
    }

    /// JSON snapshot of every group, for logs and reports.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut groups = serde_json::Map::new();
        for (name, group) in &self.groups {
            let mut obj = serde_json::Map::new();
            let mut sorted: Vec<_> = group.iter().collect();
            sorted.sort_by_key(|(k, _)| k.as_str());
            for (key, value) in sorted {
                obj.insert(key.clone(), json!(value));
            }
            groups.insert(name.clone(), Value::Object(obj));
        }
        Value::Object(groups)
    }
}
