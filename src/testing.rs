//! Test doubles and fixtures for exercising job orchestration without a
//! cluster.
//!
//! The orchestration path takes its engine and side channel as injected
//! collaborators, so a scripted [`MockEngine`] plus a [`MemorySideChannel`]
//! drive every build/submit/reconcile scenario in-process. Instruction
//! builders mirror the small set of non-combine opcodes the planner and
//! shape propagation understand.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::counters::Counters;
use crate::engine::{EngineReport, ExecutionEngine};
use crate::error::JobError;
use crate::instruction::{FIELD_DELIM, INSTRUCTION_DELIM};
use crate::job::{InputDesc, JobConfig, JobSpec, StorageFormat};
use crate::reconcile::{PartitionDims, SideChannel};
use crate::shape::MatrixShape;

fn instruction(opcode: &str, operands: &[String]) -> String {
    let mut fields = vec!["DIST".to_string(), opcode.to_string()];
    fields.extend_from_slice(operands);
    fields.join(&FIELD_DELIM.to_string())
}

fn matrix_operand(slot: i32) -> String {
    format!("{slot}@MATRIX:FP64")
}

/// A `mvmult` mapper instruction (broadcast side input in the second slot).
#[must_use]
pub fn prep_mvmult(in1: i32, in2: i32, out: i32) -> String {
    instruction(
        "mvmult",
        &[matrix_operand(in1), matrix_operand(in2), matrix_operand(out)],
    )
}

/// A `mappend` mapper instruction (broadcast side input in the second slot).
#[must_use]
pub fn prep_mappend(in1: i32, in2: i32, out: i32) -> String {
    instruction(
        "mappend",
        &[matrix_operand(in1), matrix_operand(in2), matrix_operand(out)],
    )
}

/// A grouped-sum aggregate instruction.
#[must_use]
pub fn prep_group_agg(in1: i32, out: i32) -> String {
    instruction("agg+", &[matrix_operand(in1), matrix_operand(out)])
}

/// A full unary-sum instruction (collapses to 1x1).
#[must_use]
pub fn prep_unary_agg(in1: i32, out: i32) -> String {
    instruction("uagg+", &[matrix_operand(in1), matrix_operand(out)])
}

/// Join instructions into one stage string.
#[must_use]
pub fn join_instructions(instructions: &[String]) -> String {
    instructions.join(&INSTRUCTION_DELIM.to_string())
}

/// A block-partitioned input descriptor with known dimensions.
#[must_use]
pub fn matrix_input(path: &str, rows: u64, cols: u64, block: u32) -> InputDesc {
    InputDesc::new(
        path,
        MatrixShape::known(rows, cols, block, block),
        StorageFormat::BinaryBlock,
    )
}

/// A [`JobConfig`] whose working and side-channel roots live in a fresh
/// temporary directory. Keep the returned guard alive for the test's
/// duration.
///
/// # Errors
///
/// Returns an error if the temporary directory cannot be created.
pub fn staging_config() -> Result<(JobConfig, TempDir)> {
    let dir = TempDir::new().context("creating staging tempdir")?;
    let cfg = JobConfig {
        staging_root: dir.path().join("staging"),
        cluster_root: dir.path().join("work"),
        side_channel_root: dir.path().join("dims"),
        ..JobConfig::default()
    };
    Ok((cfg, dir))
}

/// Write a JSON-lines dimensions record, as workers would.
///
/// # Errors
///
/// Returns an error if the file or a parent directory cannot be written.
pub fn write_dims_file(path: &Path, records: &[PartitionDims]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("creating dims file {}", path.display()))?;
    for record in records {
        serde_json::to_writer(&mut file, record)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Scripted engine double: returns a fixed report and records every
/// submitted spec.
pub struct MockEngine {
    success: bool,
    counters: Counters,
    reject: Option<String>,
    submitted: Mutex<Vec<JobSpec>>,
}

impl MockEngine {
    /// An engine whose runs succeed.
    #[must_use]
    pub fn succeeding() -> Self {
        Self {
            success: true,
            counters: Counters::new(),
            reject: None,
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// An engine whose runs fail after starting.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            success: false,
            ..Self::succeeding()
        }
    }

    /// An engine that rejects every spec at submission.
    #[must_use]
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            reject: Some(reason.into()),
            ..Self::succeeding()
        }
    }

    /// Script one counter into the terminal report.
    #[must_use]
    pub fn with_counter(mut self, group: &str, key: &str, value: u64) -> Self {
        self.counters.set(group, key, value);
        self
    }

    /// Specs submitted so far, in order.
    ///
    /// # Panics
    ///
    /// Panics if a previous holder of the lock panicked.
    #[must_use]
    pub fn submitted(&self) -> Vec<JobSpec> {
        self.submitted.lock().unwrap().clone()
    }
}

impl ExecutionEngine for MockEngine {
    fn submit_and_wait(&self, spec: &JobSpec) -> Result<EngineReport, JobError> {
        if let Some(reason) = &self.reject {
            return Err(JobError::ExecutionFailure {
                job: spec.name.clone(),
                reason: reason.clone(),
            });
        }
        self.submitted.lock().unwrap().push(spec.clone());
        Ok(EngineReport {
            counters: self.counters.clone(),
            success: self.success,
        })
    }
}

/// In-memory side channel keyed by path.
#[derive(Default)]
pub struct MemorySideChannel {
    records: Mutex<HashMap<PathBuf, Vec<PartitionDims>>>,
    fail_delete: bool,
    deleted: Mutex<Vec<PathBuf>>,
}

impl MemorySideChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel whose deletions always fail (for cleanup-path tests).
    #[must_use]
    pub fn with_failing_deletes() -> Self {
        Self {
            fail_delete: true,
            ..Self::default()
        }
    }

    /// Add one per-partition record under a path.
    ///
    /// # Panics
    ///
    /// Panics if a previous holder of the lock panicked.
    pub fn insert(&self, path: &Path, record: PartitionDims) {
        self.records
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default()
            .push(record);
    }

    /// Paths deleted so far.
    ///
    /// # Panics
    ///
    /// Panics if a previous holder of the lock panicked.
    #[must_use]
    pub fn deleted(&self) -> Vec<PathBuf> {
        self.deleted.lock().unwrap().clone()
    }
}

impl SideChannel for MemorySideChannel {
    fn read_dims(&self, path: &Path) -> Result<Vec<PartitionDims>, JobError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default())
    }

    fn delete(&self, path: &Path) -> Result<(), JobError> {
        if self.fail_delete {
            return Err(JobError::SideChannel {
                path: path.to_path_buf(),
                reason: "permission denied".to_string(),
            });
        }
        self.records.lock().unwrap().remove(path);
        self.deleted.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}
