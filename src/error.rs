//! Error taxonomy for lowering and job orchestration.
//!
//! Two layers, matching where failures surface:
//!
//! - [`LoweringError`] - produced while classifying an operator or encoding /
//!   parsing instruction text. These are compile-side failures: the caller
//!   rejects the operator (or the whole program) and nothing is submitted.
//! - [`JobError`] - produced while building, submitting, or reconciling a
//!   distributed job. A job that fails here yields no partial result and is
//!   never retried at this layer.
//!
//! The only condition that is deliberately *not* an error is side-channel
//! cleanup failure after a successful job; it is logged and reported on
//! [`JobResult::cleanup_ok`](crate::engine::JobResult::cleanup_ok) instead.

use std::path::PathBuf;

use thiserror::Error;

use crate::op::{DataKind, OperationKind};

/// Failures in operator classification and instruction encoding/parsing.
#[derive(Debug, Error)]
pub enum LoweringError {
    /// The first operand of a combine operator was not a matrix. The
    /// operator cannot be realized; the producing call site must reject it.
    #[error("combine operator requires a matrix first operand, got {first:?}")]
    ClassificationInvalid { first: DataKind },

    /// A positional slot argument contradicts the operation kind's expected
    /// absent pattern. This is a caller-contract violation, not a data error.
    #[error("{kind:?}: positional slot {slot} for operand {position} violates the expected layout")]
    ArityViolation {
        kind: OperationKind,
        position: usize,
        slot: i32,
    },

    /// The operation kind has no positional instruction mapping. Indicates
    /// classifier/encoder drift and should be unreachable in correct builds.
    #[error("no instruction mapping for operation kind {kind:?}")]
    UnmappedOperation { kind: OperationKind },

    /// Instruction text that does not follow the field/operand grammar.
    #[error("malformed instruction `{text}`: {reason}")]
    MalformedInstruction { text: String, reason: String },
}

/// Failures at the job granularity: build validation, execution, and
/// post-execution reconciliation.
#[derive(Debug, Error)]
pub enum JobError {
    /// Representation mismatch, malformed record-reader specialization, or
    /// another validation failure while assembling the spec. The job is
    /// never submitted.
    #[error("job build validation failed: {reason}")]
    BuildValidation { reason: String },

    /// An instruction attached to the job failed to parse. Surfaced before
    /// submission; the engine never sees it.
    #[error(transparent)]
    Lowering(#[from] LoweringError),

    /// The engine rejected the spec, or the run failed. No partial result.
    #[error("job `{job}` failed: {reason}")]
    ExecutionFailure { job: String, reason: String },

    /// The engine reported success but an output flagged shape-unknown has
    /// no side-channel records. Internal inconsistency, distinct from an
    /// ordinary job failure.
    #[error("no side-channel shape records for shape-unknown output {output}")]
    ReconciliationInconsistency { output: u32 },

    /// Reading the side-channel dimensions record failed after a reported
    /// success. (Deleting it is the one non-fatal case; see module doc.)
    #[error("side channel {path}: {reason}")]
    SideChannel { path: PathBuf, reason: String },
}
