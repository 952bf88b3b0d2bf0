//! The execution-engine boundary and the submit/await/reconcile flow.
//!
//! The engine itself - task scheduling, retries, speculative execution -
//! lives outside this crate. We consume a narrow capability interface:
//! submit a frozen [`JobSpec`], block until the run reaches a terminal
//! state, and read back counters. Injecting [`ExecutionEngine`] (and
//! [`SideChannel`](crate::reconcile::SideChannel)) keeps the orchestration
//! logic testable without a cluster.

use tracing::{debug, info, warn};

use crate::broadcast::BroadcastCache;
use crate::counters::Counters;
use crate::error::JobError;
use crate::job::JobSpec;
use crate::reconcile::{reconcile, SideChannel};
use crate::shape::MatrixShape;

/// Raw terminal report from the engine: counters plus a success flag.
#[derive(Clone, Debug, Default)]
pub struct EngineReport {
    pub counters: Counters,
    pub success: bool,
}

/// The external batch engine, reduced to its submit/await surface.
pub trait ExecutionEngine {
    /// Submit a job and block until it reaches a terminal state.
    ///
    /// # Errors
    ///
    /// An `Err` means the engine rejected the spec outright; a run that
    /// started and failed comes back as `Ok` with `success == false`. The
    /// caller treats both as job-level failure.
    fn submit_and_wait(&self, spec: &JobSpec) -> Result<EngineReport, JobError>;
}

/// Final result of one job: fully resolved per-output shapes.
#[derive(Clone, Debug)]
pub struct JobResult {
    pub shapes: Vec<MatrixShape>,
    pub success: bool,
    /// False when side-channel cleanup failed (logged, non-fatal).
    pub cleanup_ok: bool,
}

/// Submit a READY spec and drive it to a [`JobResult`].
///
/// This is the single blocking point of the orchestrator: publish the
/// broadcast plan, hand the spec to the engine, wait, then reconcile shapes
/// from counters and the dimension side channel.
///
/// # Errors
///
/// [`JobError::ExecutionFailure`] when the engine rejects the spec or the
/// run fails - no partial result is kept and nothing is retried here -
/// plus any reconciliation error after a reported success.
pub fn run_job(
    engine: &dyn ExecutionEngine,
    side_channel: &dyn SideChannel,
    cache: &BroadcastCache,
    spec: &JobSpec,
) -> Result<JobResult, JobError> {
    // Local-mode workers share this process; drop any snapshot a previous
    // job published before this one becomes visible.
    cache.publish(&spec.broadcast, spec.mode);

    info!(
        name = %spec.name,
        mode = ?spec.mode,
        reducers = spec.reducers,
        inputs = spec.inputs.len(),
        outputs = spec.outputs.len(),
        "submitting job"
    );

    let report = engine
        .submit_and_wait(spec)
        .map_err(|e| match e {
            JobError::ExecutionFailure { .. } => e,
            other => JobError::ExecutionFailure {
                job: spec.name.clone(),
                reason: other.to_string(),
            },
        })?;

    if !report.success {
        warn!(name = %spec.name, "engine reported job failure");
        return Err(JobError::ExecutionFailure {
            job: spec.name.clone(),
            reason: "run reported failure".to_string(),
        });
    }
    debug!(name = %spec.name, counters = %report.counters.to_json(), "job completed");

    let (shapes, cleanup_ok) = reconcile(spec, &report.counters, side_channel)?;
    Ok(JobResult {
        shapes,
        success: true,
        cleanup_ok,
    })
}
