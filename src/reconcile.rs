//! Post-execution shape reconciliation.
//!
//! Outputs whose dimensions could not be determined statically are flagged
//! on the spec; during the run each reducer partition records the maximum
//! row and column index it observed for such outputs into a side-channel
//! dimensions record. After a successful run the reconciler folds those
//! per-partition observations into final shapes, merges the non-zero-cell
//! counters, and tears the side channel down.
//!
//! Only the reconciler replaces an unknown dimension, and only after a
//! successful job; shapes already known at build time are final.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::counters::{Counters, NONZERO_GROUP};
use crate::error::JobError;
use crate::job::JobSpec;
use crate::shape::MatrixShape;

/// One reducer partition's shape observation for one output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDims {
    /// Output index the observation belongs to.
    pub output: u32,
    /// Reducer partition that wrote the record.
    pub partition: u32,
    /// Largest row index observed (1-based count).
    pub max_row: u64,
    /// Largest column index observed (1-based count).
    pub max_col: u64,
}

/// Access to the out-of-band dimensions record written by workers.
pub trait SideChannel {
    /// Read every per-partition record under the given path.
    ///
    /// # Errors
    ///
    /// Propagates read failures; a missing record reads as empty.
    fn read_dims(&self, path: &Path) -> Result<Vec<PartitionDims>, JobError>;

    /// Delete the record. Failures are the caller's to log; the record only
    /// affects cleanup, not correctness.
    ///
    /// # Errors
    ///
    /// Propagates the underlying deletion failure.
    fn delete(&self, path: &Path) -> Result<(), JobError>;
}

/// Resolve final shapes for every output of a successfully completed job.
///
/// Returns the shapes in output order plus whether side-channel cleanup
/// succeeded (cleanup failure is logged, never fatal).
///
/// # Errors
///
/// [`JobError::ReconciliationInconsistency`] when an output flagged
/// shape-unknown has no side-channel records - the engine reported success
/// but the job state disagrees - and side-channel *read* failures.
pub fn reconcile(
    spec: &JobSpec,
    counters: &Counters,
    side_channel: &dyn SideChannel,
) -> Result<(Vec<MatrixShape>, bool), JobError> {
    let records = if spec.needs_reconciliation() {
        side_channel.read_dims(&spec.side_channel)?
    } else {
        Vec::new()
    };

    let mut shapes = Vec::with_capacity(spec.outputs.len());
    for output in &spec.outputs {
        let mut shape = output.shape.clone();
        if output.dims_unknown {
            let mut max_row = 0u64;
            let mut max_col = 0u64;
            let mut seen = false;
            for record in records.iter().filter(|r| r.output == output.index) {
                seen = true;
                max_row = max_row.max(record.max_row);
                max_col = max_col.max(record.max_col);
            }
            if !seen {
                return Err(JobError::ReconciliationInconsistency {
                    output: output.index,
                });
            }
            shape.resolve(max_row, max_col);
        }
        shape.nonzeros = Some(counters.get(NONZERO_GROUP, &output.index.to_string()));
        shapes.push(shape);
    }

    // Cleanup is best-effort; distinguishable in the log, never fatal.
    let cleanup_ok = match side_channel.delete(&spec.side_channel) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                path = %spec.side_channel.display(),
                error = %e,
                "failed to delete dimension side channel"
            );
            false
        }
    };

    Ok((shapes, cleanup_ok))
}

/// Side channel backed by a JSON-lines file on a filesystem both workers
/// and the driver can reach.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonlSideChannel;

impl SideChannel for JsonlSideChannel {
    fn read_dims(&self, path: &Path) -> Result<Vec<PartitionDims>, JobError> {
        let io_err = |e: &dyn std::fmt::Display| JobError::SideChannel {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&e)),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|e| io_err(&e)))
            .collect()
    }

    fn delete(&self, path: &Path) -> Result<(), JobError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            // Already gone counts as cleaned up.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobError::SideChannel {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }
}
