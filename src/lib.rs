//! # Tabflow
//!
//! **Operator lowering and distributed batch-job orchestration** for
//! cross-tabulation matrix operators. Tabflow sits between an algebraic
//! optimizer and a cluster batch engine: it turns a logical three-input
//! combine operator into delimited instruction text, assembles complete job
//! specifications around collections of such instructions, and resolves the
//! result shapes that could not be known until the job has run.
//!
//! ## Key Features
//!
//! - **Operation classification** - map operand datatype triples to one of
//!   four combine kinds with a total decision table
//! - **Two-mode instruction encoding** - label-addressed text during
//!   lowering, positional slot text for execution, with literal vs
//!   deferred-symbol scalar rendering
//! - **Broadcast planning** - select and deduplicate side inputs that must
//!   be pre-distributed to every worker
//! - **Job assembly** - representation selection, record-reader
//!   specialization for sampling/quantile jobs, stage wiring with combiner
//!   gating, reducer-group inference, static shape propagation, and
//!   volume-driven local/cluster mode selection
//! - **Shape reconciliation** - fold per-partition worker observations and
//!   engine counters into final shapes for outputs flagged unknown
//! - **Injected collaborators** - the engine and the dimension side channel
//!   are traits, so the whole orchestration path runs under test doubles
//!
//! ## Quick Start
//!
//! ```ignore
//! use tabflow::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! // Lower a combine operator to its execution-ready instruction.
//! let node = OperatorNode::combine(
//!     [
//!         Operand::matrix(ValueKind::Fp64),
//!         Operand::matrix(ValueKind::Fp64),
//!         Operand::symbol(ValueKind::Fp64, "w"),
//!     ],
//!     Operand::matrix(ValueKind::Fp64),
//!     ExecTarget::Distributed,
//! )?;
//! let text = node.encode_positional(0, 1, ABSENT, 2)?;
//!
//! // Assemble and run a job around it.
//! let def = JobDef {
//!     inputs: vec![/* input descriptors */],
//!     mapper_instructions: text,
//!     reducers: 10,
//!     ..JobDef::default()
//! };
//! let spec = build_spec(def, &JobConfig::default())?;
//! let result = run_job(&engine, &JsonlSideChannel, &BroadcastCache::new(), &spec)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Compilation and orchestration are synchronous and single-threaded; the
//! one blocking point is [`run_job`]'s submit-and-await call into the
//! external engine. Task parallelism, retries, and speculative execution
//! belong to that engine - map tasks share nothing, combiners must be
//! associative and invocation-count independent, and reducers own disjoint
//! key partitions.
//!
//! ## Module Overview
//!
//! - [`op`] - operation kinds, classification, operator nodes
//! - [`instruction`] - the instruction text grammar: encoding and parsing
//! - [`shape`] - matrix shapes with deferred dimensions
//! - [`broadcast`] - broadcast-input planning and the local-mode cache
//! - [`job`] - job definitions, configuration, and spec assembly
//! - [`engine`] - the engine trait and the submit/await/reconcile flow
//! - [`counters`] - grouped counters reported by the engine
//! - [`reconcile`] - post-execution shape reconciliation
//! - [`error`] - the lowering and job error taxonomies
//! - [`testing`] - mock engine, memory side channel, fixtures

pub mod broadcast;
pub mod counters;
pub mod engine;
pub mod error;
pub mod instruction;
pub mod job;
pub mod op;
pub mod reconcile;
pub mod shape;
pub mod testing;

pub use broadcast::{BroadcastCache, BroadcastPlan, BROADCAST_OPCODES};
pub use counters::{Counters, NONZERO_GROUP};
pub use engine::{run_job, EngineReport, ExecutionEngine, JobResult};
pub use error::{JobError, LoweringError};
pub use instruction::{
    parse_instruction, split_instructions, Binding, Operand, ParsedInstruction, ParsedOperand,
    ABSENT,
};
pub use job::{
    build_spec, ExecMode, InputDesc, JobConfig, JobDef, JobSpec, OutputReq, PartitionFormat,
    PartitionMeta, PickMode, RecordReaderSpec, Representation, StorageFormat, ValueClass,
    WiredInput, WiredOutput,
};
pub use op::{DataKind, ExecTarget, JobKind, OperationKind, OperatorNode, ValueKind};
pub use reconcile::{reconcile, JsonlSideChannel, PartitionDims, SideChannel};
pub use shape::{Dim, MatrixShape};
