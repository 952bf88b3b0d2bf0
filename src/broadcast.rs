//! Broadcast-input planning and the in-process snapshot cache.
//!
//! A small fixed set of mapper opcodes consumes a side input that must be
//! pre-distributed (broadcast) to every worker instead of flowing through
//! the ordinary input split. [`BroadcastPlan::scan`] walks the mapper-stage
//! instruction text, extracts the side-input slot of each such instruction
//! (by convention the second matrix operand), and collects a deduplicated,
//! first-seen-ordered list of `(index, path)` pairs ready for the engine's
//! broadcast-distribution facility.
//!
//! [`BroadcastCache`] is the explicit context object for local-mode runs:
//! workers share the driver process there, so a snapshot published by an
//! earlier job must be invalidated before the next job publishes its own.
//! Cluster workers are separate processes and need no invalidation.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::JobError;
use crate::instruction::{parse_instruction, split_instructions, INSTRUCTION_DELIM};
use crate::job::ExecMode;

/// Mapper opcodes whose second matrix operand is a broadcast side input.
pub const BROADCAST_OPCODES: [&str; 2] = ["mvmult", "mappend"];

/// Ordered, deduplicated broadcast selection for one job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastPlan {
    /// `(input index, input path)` in first-seen order.
    pub entries: Vec<(u32, String)>,
}

impl BroadcastPlan {
    /// Scan mapper-stage instructions for broadcast side inputs.
    ///
    /// `inputs` is the job's input wiring as `(index, path)` pairs;
    /// extracted slots are matched against the indices (which may differ
    /// from list positions after a record-reader rewrite).
    ///
    /// # Errors
    ///
    /// Parse failures in the mapper text, or a side-input slot that does not
    /// name a job input.
    pub fn scan(mapper_instructions: &str, inputs: &[(u32, String)]) -> Result<Self, JobError> {
        let mut entries: Vec<(u32, String)> = Vec::new();
        for text in split_instructions(mapper_instructions) {
            let parsed = parse_instruction(text)?;
            if !BROADCAST_OPCODES.contains(&parsed.opcode.as_str()) {
                continue;
            }
            let side = parsed.inputs().get(1).and_then(|op| op.slot());
            let Some(slot) = side.filter(|s| *s >= 0) else {
                return Err(JobError::BuildValidation {
                    reason: format!("`{}` has no side-input slot", parsed.opcode),
                });
            };
            let index = slot as u32;
            let Some((_, path)) = inputs.iter().find(|(i, _)| *i == index) else {
                return Err(JobError::BuildValidation {
                    reason: format!("broadcast side-input slot {index} is not a job input"),
                });
            };
            if !entries.iter().any(|(i, _)| *i == index) {
                entries.push((index, path.clone()));
            }
        }
        Ok(Self { entries })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if the given input index was selected for broadcast.
    #[must_use]
    pub fn contains(&self, index: u32) -> bool {
        self.entries.iter().any(|(i, _)| *i == index)
    }

    /// Selected indices concatenated in plan order.
    #[must_use]
    pub fn index_string(&self) -> String {
        self.entries
            .iter()
            .map(|(i, _)| i.to_string())
            .collect::<Vec<_>>()
            .join(&INSTRUCTION_DELIM.to_string())
    }

    /// Selected paths concatenated in plan order.
    #[must_use]
    pub fn path_string(&self) -> String {
        self.entries
            .iter()
            .map(|(_, p)| p.as_str())
            .collect::<Vec<_>>()
            .join(&INSTRUCTION_DELIM.to_string())
    }
}

/// In-process broadcast snapshot, shared by all workers of a local-mode job.
///
/// Scoped to one driver; pass the same cache to every submission that may
/// run locally. Published snapshots are read-only and never mutated; a new
/// local-mode publish invalidates the previous one first.
#[derive(Debug, Default)]
pub struct BroadcastCache {
    published: Mutex<Option<BroadcastPlan>>,
}

impl BroadcastCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any published snapshot. Called before a local-mode publish so a
    /// prior job's broadcast data cannot leak into this one.
    pub fn reset(&self) {
        let mut slot = self.published.lock().unwrap();
        if slot.take().is_some() {
            debug!("invalidated in-process broadcast snapshot");
        }
    }

    /// Publish a job's broadcast plan. Local mode invalidates first;
    /// cluster mode is a no-op on the cache since each worker process loads
    /// its own copy.
    pub fn publish(&self, plan: &BroadcastPlan, mode: ExecMode) {
        match mode {
            ExecMode::Local => {
                self.reset();
                *self.published.lock().unwrap() = Some(plan.clone());
            }
            ExecMode::Cluster => {}
        }
    }

    /// The currently published snapshot, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<BroadcastPlan> {
        self.published.lock().unwrap().clone()
    }
}
