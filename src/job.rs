//! Job assembly: turn instruction stages and input descriptors into a
//! frozen, submittable [`JobSpec`].
//!
//! [`build_spec`] runs the build phases in a fixed order:
//!
//! 1. derive the input representation (block vs cell), which fixes the
//!    map-output value class
//! 2. apply the record-reader specialization, rewriting the input wiring
//! 3. validate every attached instruction against the grammar
//! 4. plan broadcast side inputs over the (possibly rewritten) wiring
//! 5. wire the stages, gating the combiner on a non-empty aggregate stage
//!    and a non-zero reducer count
//! 6. compute the map-output index set (what must cross the shuffle)
//! 7. infer the reducer-group floor and fix the reducer count
//! 8. propagate shapes to every declared output, flagging unknowns
//! 9. select the execution mode from declared input volume
//! 10. allocate the unique working directory and freeze the spec
//!
//! Any failure leaves nothing submitted; the spec is built once and is
//! immutable after submission.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broadcast::BroadcastPlan;
use crate::error::JobError;
use crate::instruction::{parse_instruction, split_instructions, ParsedInstruction};
use crate::op::{DataKind, JobKind};
use crate::shape::MatrixShape;

/// Storage format of a job input or output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageFormat {
    BinaryBlock,
    BinaryCell,
    TextCell,
    /// Sorted compact records produced by a sort job; consumed by the
    /// record-reader specialization.
    SortedRecords,
}

impl StorageFormat {
    fn representation(self) -> Representation {
        match self {
            StorageFormat::BinaryBlock => Representation::Block,
            StorageFormat::BinaryCell | StorageFormat::TextCell | StorageFormat::SortedRecords => {
                Representation::Cell
            }
        }
    }
}

/// Representation family shared by all inputs of one job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Representation {
    Block,
    Cell,
}

/// Value class of records crossing the shuffle, fixed by the representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueClass {
    TaggedBlock,
    TaggedCell,
}

/// Where the job executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecMode {
    /// Single process; workers share the driver's memory.
    Local,
    /// One process per worker across the cluster.
    Cluster,
}

/// Physical partitioning of an input, when pre-partitioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionFormat {
    None,
    Row,
    Column,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub format: PartitionFormat,
    pub size: Option<u64>,
}

/// One input matrix as handed to the builder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputDesc {
    pub path: String,
    pub shape: MatrixShape,
    pub format: StorageFormat,
    pub partition: Option<PartitionMeta>,
    /// Per-partition item counts from the producing sort job; required by
    /// the record-reader specialization.
    pub item_counts: Option<Vec<u64>>,
}

impl InputDesc {
    #[must_use]
    pub fn new(path: impl Into<String>, shape: MatrixShape, format: StorageFormat) -> Self {
        Self {
            path: path.into(),
            shape,
            format,
            partition: None,
            item_counts: None,
        }
    }
}

/// One result matrix to materialize.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputReq {
    /// Working-set index the result is produced under.
    pub index: u32,
    pub path: String,
    pub format: StorageFormat,
}

/// Everything the caller supplies to build one job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobDef {
    pub name: Option<String>,
    pub inputs: Vec<InputDesc>,
    /// Record-reader specialization instruction (`valuepick`/`rangepick`),
    /// for sampling and quantile jobs.
    pub record_reader: Option<String>,
    pub mapper_instructions: String,
    pub aggregate_instructions: String,
    pub other_instructions: String,
    pub reducers: u32,
    pub replication: u32,
    /// Let the engine keep worker processes (and their loaded broadcast
    /// snapshots) alive across tasks.
    pub worker_reuse: bool,
    pub outputs: Vec<OutputReq>,
}

/// Build-time knobs, scoped to one driver.
#[derive(Clone, Debug)]
pub struct JobConfig {
    /// Declared input volume below which a job runs locally.
    pub local_volume_threshold: u64,
    /// Working-directory root for local-mode jobs.
    pub staging_root: PathBuf,
    /// Working-directory root on the shared filesystem for cluster jobs.
    pub cluster_root: PathBuf,
    /// Root under which per-job dimension side channels are written.
    pub side_channel_root: PathBuf,
    /// Worker parallelism hint for local-mode execution.
    pub local_parallelism: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            local_volume_threshold: 128 * 1024 * 1024,
            staging_root: std::env::temp_dir().join("tabflow-staging"),
            cluster_root: PathBuf::from("tabflow-work"),
            side_channel_root: PathBuf::from("tabflow-dims"),
            local_parallelism: num_cpus::get().max(2),
        }
    }
}

/// Sampling mode of the record-reader specialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PickMode {
    /// Pick records at positions seeded from a probability vector input.
    ByValue { probs_input: u32 },
    /// Pick the inter-quantile range implied by a constant fraction.
    ByRange { fraction: f64 },
}

/// Parsed record-reader specialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordReaderSpec {
    pub compact_input: u32,
    pub mode: PickMode,
    pub output: u32,
}

impl RecordReaderSpec {
    /// Parse a `valuepick`/`rangepick` instruction.
    fn parse(text: &str) -> Result<Self, JobError> {
        let invalid = |reason: &str| JobError::BuildValidation {
            reason: format!("record reader `{text}`: {reason}"),
        };
        let parsed = parse_instruction(text)?;
        let slot = |op: &crate::instruction::ParsedOperand| op.slot().filter(|s| *s >= 0);
        let output = slot(parsed.output()).ok_or_else(|| invalid("missing output index"))? as u32;
        match parsed.opcode.as_str() {
            "valuepick" => {
                let [compact, probs] = parsed.inputs() else {
                    return Err(invalid("valuepick takes two inputs"));
                };
                let compact = slot(compact).ok_or_else(|| invalid("bad compact input"))? as u32;
                let probs = slot(probs).ok_or_else(|| invalid("bad probability input"))? as u32;
                Ok(Self {
                    compact_input: compact,
                    mode: PickMode::ByValue { probs_input: probs },
                    output,
                })
            }
            "rangepick" => {
                let [compact, fraction] = parsed.inputs() else {
                    return Err(invalid("rangepick takes two inputs"));
                };
                let compact = slot(compact).ok_or_else(|| invalid("bad compact input"))? as u32;
                if fraction.data != DataKind::Scalar || fraction.is_deferred() {
                    return Err(invalid("fraction must be a compile-time scalar constant"));
                }
                let fraction: f64 = fraction
                    .token
                    .parse()
                    .map_err(|_| invalid("fraction is not a number"))?;
                Ok(Self {
                    compact_input: compact,
                    mode: PickMode::ByRange { fraction },
                    output,
                })
            }
            other => Err(invalid(&format!("unknown record-reader opcode `{other}`"))),
        }
    }
}

/// One wired job input: the working-set index it is mounted under plus its
/// (possibly rewritten) descriptor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WiredInput {
    pub index: u32,
    pub path: String,
    pub shape: MatrixShape,
    pub format: StorageFormat,
    pub partition: Option<PartitionMeta>,
}

/// One wired job output with its statically propagated shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WiredOutput {
    pub index: u32,
    pub path: String,
    pub format: StorageFormat,
    pub shape: MatrixShape,
    /// Set when static propagation could not determine the row or column
    /// count; the reconciler resolves these after the run.
    pub dims_unknown: bool,
}

/// A fully assembled, frozen job specification. Built once; immutable once
/// submitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub kind: JobKind,
    pub representation: Representation,
    pub map_output_value: ValueClass,
    pub inputs: Vec<WiredInput>,
    pub record_reader: Option<RecordReaderSpec>,
    pub broadcast: BroadcastPlan,
    pub mapper_instructions: String,
    pub aggregate_instructions: String,
    pub other_instructions: String,
    pub combiner_enabled: bool,
    pub reducers: u32,
    pub replication: u32,
    pub worker_reuse: bool,
    pub local_parallelism: usize,
    /// Indices that must flow from mappers through the shuffle.
    pub map_output_indexes: BTreeSet<u32>,
    pub outputs: Vec<WiredOutput>,
    pub mode: ExecMode,
    pub working_dir: PathBuf,
    /// Path of this job's dimension side-channel record.
    pub side_channel: PathBuf,
}

impl JobSpec {
    /// True when any output needs post-run shape reconciliation.
    #[must_use]
    pub fn needs_reconciliation(&self) -> bool {
        self.outputs.iter().any(|o| o.dims_unknown)
    }
}

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Assemble a [`JobSpec`] from a [`JobDef`]. See the module doc for the
/// phase order.
///
/// # Errors
///
/// [`JobError::BuildValidation`] for representation mismatches, malformed
/// specializations, and unresolvable wiring; [`JobError::Lowering`] for
/// instruction text that fails to parse. In every case the job is not built
/// and nothing was submitted.
pub fn build_spec(def: JobDef, cfg: &JobConfig) -> Result<JobSpec, JobError> {
    // 1. representation family, shared by all inputs
    let representation = derive_representation(&def.inputs)?;
    let map_output_value = match representation {
        Representation::Block => ValueClass::TaggedBlock,
        Representation::Cell => ValueClass::TaggedCell,
    };

    // 2. record-reader rewrite
    let (inputs, record_reader) = match &def.record_reader {
        Some(text) if !text.is_empty() => {
            let spec = RecordReaderSpec::parse(text)?;
            let wired = apply_record_reader(&def.inputs, &spec)?;
            (wired, Some(spec))
        }
        _ => (wire_inputs_in_place(&def.inputs), None),
    };

    // 3. every attached instruction must parse before submission
    for stage in [
        &def.mapper_instructions,
        &def.aggregate_instructions,
        &def.other_instructions,
    ] {
        for text in split_instructions(stage) {
            parse_instruction(text)?;
        }
    }

    // 4. broadcast side inputs
    let index_paths: Vec<(u32, String)> =
        inputs.iter().map(|i| (i.index, i.path.clone())).collect();
    let broadcast = BroadcastPlan::scan(&def.mapper_instructions, &index_paths)?;

    // 5. stage wiring; a zero-reducer job is map-only and skips aggregation
    let aggregate_instructions = if def.reducers == 0 {
        String::new()
    } else {
        def.aggregate_instructions.clone()
    };
    let combiner_enabled = !aggregate_instructions.is_empty() && def.reducers != 0;

    // 6. what must cross the shuffle
    let result_indexes: BTreeSet<u32> = def.outputs.iter().map(|o| o.index).collect();
    let map_output_indexes = map_output_indexes(
        &def.mapper_instructions,
        &aggregate_instructions,
        &def.other_instructions,
        &result_indexes,
        &inputs,
    )?;

    // 7. reducer-group floor
    let inferred = reducer_groups(&aggregate_instructions)?;
    let reducers = if inferred > 0 {
        def.reducers.max(inferred)
    } else {
        def.reducers
    };

    // 8. static shape propagation
    let outputs = propagate_shapes(
        &inputs,
        &def.mapper_instructions,
        &aggregate_instructions,
        &def.other_instructions,
        &def.outputs,
    )?;

    // 9. execution mode from declared volume of non-broadcast inputs
    let mode = select_mode(&inputs, &broadcast, cfg.local_volume_threshold);

    // 10. unique working directory, then freeze
    let name = def.name.unwrap_or_else(|| "generic-batch".to_string());
    let unique = format!(
        "{name}-{pid}-{seq}",
        pid = std::process::id(),
        seq = JOB_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let root = match mode {
        ExecMode::Local => &cfg.staging_root,
        ExecMode::Cluster => &cfg.cluster_root,
    };
    let working_dir = root.join(&unique);
    std::fs::create_dir_all(&working_dir).map_err(|e| JobError::BuildValidation {
        reason: format!("allocating working dir {}: {e}", working_dir.display()),
    })?;
    let side_channel = cfg.side_channel_root.join(format!("{unique}_dims"));

    debug!(
        name = %name,
        ?mode,
        reducers,
        combiner = combiner_enabled,
        broadcast = broadcast.entries.len(),
        "job spec assembled"
    );

    Ok(JobSpec {
        name,
        kind: JobKind::Generic,
        representation,
        map_output_value,
        inputs,
        record_reader,
        broadcast,
        mapper_instructions: def.mapper_instructions,
        aggregate_instructions,
        other_instructions: def.other_instructions,
        combiner_enabled,
        reducers,
        replication: def.replication,
        worker_reuse: def.worker_reuse,
        local_parallelism: cfg.local_parallelism,
        map_output_indexes,
        outputs,
        mode,
        working_dir,
        side_channel,
    })
}

fn derive_representation(inputs: &[InputDesc]) -> Result<Representation, JobError> {
    let mut derived = None;
    for input in inputs {
        let family = input.format.representation();
        match derived {
            None => derived = Some(family),
            Some(prev) if prev != family => {
                return Err(JobError::BuildValidation {
                    reason: "inputs mix block and cell representations".to_string(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(derived.unwrap_or(Representation::Block))
}

fn wire_inputs_in_place(inputs: &[InputDesc]) -> Vec<WiredInput> {
    inputs
        .iter()
        .enumerate()
        .map(|(i, input)| WiredInput {
            index: i as u32,
            path: input.path.clone(),
            shape: input.shape.clone(),
            format: input.format,
            partition: input.partition,
        })
        .collect()
}

/// Rewrite the input wiring for a sampling/quantile job.
///
/// The probability input (value-pick) is consumed directly to seed the
/// record reader's sampling ranges and is removed from the ordinary inputs;
/// the compact input's declared shape becomes the length implied by the
/// sampling parameters, re-tagged with the specialization's output index.
fn apply_record_reader(
    inputs: &[InputDesc],
    spec: &RecordReaderSpec,
) -> Result<Vec<WiredInput>, JobError> {
    let invalid = |reason: String| JobError::BuildValidation { reason };
    if inputs.len() > 2 {
        return Err(invalid(format!(
            "record-reader specialization admits at most two inputs, got {}",
            inputs.len()
        )));
    }
    let compact = inputs
        .get(spec.compact_input as usize)
        .ok_or_else(|| invalid("record reader names a missing compact input".to_string()))?;
    let counts = compact.item_counts.as_deref().ok_or_else(|| {
        invalid("compact input lacks per-partition item counts".to_string())
    })?;

    let picked_shape = |rows: crate::shape::Dim, cols: crate::shape::Dim| MatrixShape {
        rows,
        cols,
        block_rows: 1,
        block_cols: 1,
        nonzeros: None,
    };

    match spec.mode {
        PickMode::ByValue { probs_input } => {
            let probs = inputs
                .get(probs_input as usize)
                .ok_or_else(|| invalid("record reader names a missing probability input".to_string()))?;
            let mut wired = Vec::new();
            for (i, input) in inputs.iter().enumerate() {
                if i as u32 == probs_input {
                    continue;
                }
                if i as u32 == spec.compact_input {
                    wired.push(WiredInput {
                        index: spec.output,
                        path: input.path.clone(),
                        shape: picked_shape(probs.shape.rows, probs.shape.cols),
                        format: input.format,
                        partition: input.partition,
                    });
                } else {
                    wired.push(WiredInput {
                        index: i as u32,
                        path: input.path.clone(),
                        shape: input.shape.clone(),
                        format: input.format,
                        partition: input.partition,
                    });
                }
            }
            Ok(wired)
        }
        PickMode::ByRange { fraction } => {
            if !(0.0..0.5).contains(&fraction) {
                return Err(invalid(format!(
                    "range-pick fraction {fraction} outside [0, 0.5)"
                )));
            }
            let rows = inter_quantile_len(counts, fraction);
            let mut wired = wire_inputs_in_place(inputs);
            let slot = &mut wired[spec.compact_input as usize];
            slot.index = spec.output;
            slot.shape = picked_shape(rows.into(), compact.shape.cols);
            Ok(wired)
        }
    }
}

/// Length of the inter-quantile range `[fraction, 1 - fraction]` over the
/// total item count reported by the producing sort job.
fn inter_quantile_len(counts: &[u64], fraction: f64) -> u64 {
    let total: u64 = counts.iter().sum();
    let lo = (total as f64 * fraction).ceil() as u64;
    let hi = (total as f64 * (1.0 - fraction)).floor() as u64;
    if hi >= lo {
        hi - lo + 1
    } else {
        0
    }
}

fn matrix_input_slots(parsed: &ParsedInstruction) -> impl Iterator<Item = u32> + '_ {
    parsed
        .inputs()
        .iter()
        .filter(|op| op.data == DataKind::Matrix)
        .filter_map(|op| op.slot())
        .filter(|s| *s >= 0)
        .map(|s| s as u32)
}

fn output_slot(parsed: &ParsedInstruction, text: &str) -> Result<u32, JobError> {
    parsed
        .output()
        .slot()
        .filter(|s| *s >= 0)
        .map(|s| s as u32)
        .ok_or_else(|| JobError::BuildValidation {
            reason: format!("instruction `{text}` has no positional output index"),
        })
}

/// Indices the mappers must emit: everything available after the map stage
/// that downstream stages (or the declared results) still consume.
fn map_output_indexes(
    mapper: &str,
    aggregate: &str,
    other: &str,
    result_indexes: &BTreeSet<u32>,
    inputs: &[WiredInput],
) -> Result<BTreeSet<u32>, JobError> {
    let mut available: BTreeSet<u32> = inputs.iter().map(|i| i.index).collect();
    for text in split_instructions(mapper) {
        let parsed = parse_instruction(text)?;
        available.insert(output_slot(&parsed, text)?);
    }

    let mut produced_downstream = BTreeSet::new();
    let mut consumed = BTreeSet::new();
    for stage in [aggregate, other] {
        for text in split_instructions(stage) {
            let parsed = parse_instruction(text)?;
            consumed.extend(matrix_input_slots(&parsed));
            produced_downstream.insert(output_slot(&parsed, text)?);
        }
    }
    for index in result_indexes {
        if !produced_downstream.contains(index) {
            consumed.insert(*index);
        }
    }

    Ok(available.intersection(&consumed).copied().collect())
}

/// Distinct aggregate-stage output indices; each needs its own co-located
/// reducer key group, so their count is the reducer floor.
fn reducer_groups(aggregate: &str) -> Result<u32, JobError> {
    let mut groups = BTreeSet::new();
    for text in split_instructions(aggregate) {
        let parsed = parse_instruction(text)?;
        groups.insert(output_slot(&parsed, text)?);
    }
    Ok(groups.len() as u32)
}

/// Per-opcode static shape rules.
fn propagate_shapes(
    inputs: &[WiredInput],
    mapper: &str,
    aggregate: &str,
    other: &str,
    outputs: &[OutputReq],
) -> Result<Vec<WiredOutput>, JobError> {
    use crate::shape::Dim;
    use std::collections::BTreeMap;

    let mut shapes: BTreeMap<u32, MatrixShape> = inputs
        .iter()
        .map(|i| (i.index, i.shape.clone()))
        .collect();

    let resolve = |shapes: &BTreeMap<u32, MatrixShape>, slot: u32, text: &str| {
        shapes
            .get(&slot)
            .cloned()
            .ok_or_else(|| JobError::BuildValidation {
                reason: format!("instruction `{text}` references undefined index {slot}"),
            })
    };

    for stage in [mapper, aggregate, other] {
        for text in split_instructions(stage) {
            let parsed = parse_instruction(text)?;
            let slots: Vec<u32> = matrix_input_slots(&parsed).collect();
            let out = output_slot(&parsed, text)?;
            let shape = match parsed.opcode.as_str() {
                // Normal-equations product A'(Av): result takes the vector
                // operand's shape.
                "mvmult" => {
                    let [_, vector] = slots.as_slice() else {
                        return Err(JobError::BuildValidation {
                            reason: format!("`{text}` needs two matrix operands"),
                        });
                    };
                    let mut s = resolve(&shapes, *vector, text)?;
                    s.nonzeros = None;
                    s
                }
                "mappend" => {
                    let [left, right] = slots.as_slice() else {
                        return Err(JobError::BuildValidation {
                            reason: format!("`{text}` needs two matrix operands"),
                        });
                    };
                    let left = resolve(&shapes, *left, text)?;
                    let right = resolve(&shapes, *right, text)?;
                    let cols = match (left.cols.get(), right.cols.get()) {
                        (Some(a), Some(b)) => Dim::Known(a + b),
                        _ => Dim::Unknown,
                    };
                    MatrixShape {
                        rows: left.rows,
                        cols,
                        block_rows: left.block_rows,
                        block_cols: left.block_cols,
                        nonzeros: None,
                    }
                }
                // Grouped sum: shape preserving.
                "agg+" => {
                    let [input] = slots.as_slice() else {
                        return Err(JobError::BuildValidation {
                            reason: format!("`{text}` needs one matrix operand"),
                        });
                    };
                    let mut s = resolve(&shapes, *input, text)?;
                    s.nonzeros = None;
                    s
                }
                // Full unary sum collapses to a 1x1 cell.
                "uagg+" => {
                    let first = slots.first().copied().unwrap_or(0);
                    let base = shapes.get(&first).cloned();
                    let (br, bc) = base.map_or((1, 1), |s| (s.block_rows, s.block_cols));
                    MatrixShape::known(1, 1, br, bc)
                }
                // Cross-tabulation dimensions depend on cell values; deferred
                // to reconciliation. Anything unrecognized is handled the
                // same conservative way.
                _ => {
                    let (br, bc) = slots
                        .first()
                        .and_then(|s| shapes.get(s))
                        .map_or((1, 1), |s| (s.block_rows, s.block_cols));
                    MatrixShape::unknown(br, bc)
                }
            };
            shapes.insert(out, shape);
        }
    }

    outputs
        .iter()
        .map(|req| {
            let shape = shapes
                .get(&req.index)
                .cloned()
                .ok_or_else(|| JobError::BuildValidation {
                    reason: format!("result index {} is not produced by any stage", req.index),
                })?;
            let dims_unknown = shape.dims_unknown();
            Ok(WiredOutput {
                index: req.index,
                path: req.path.clone(),
                format: req.format,
                shape,
                dims_unknown,
            })
        })
        .collect()
}

/// Declared volume of non-broadcast inputs decides local vs cluster. An
/// unknown input dimension counts as unbounded, so growth can only ever move
/// the decision toward cluster.
fn select_mode(inputs: &[WiredInput], broadcast: &BroadcastPlan, threshold: u64) -> ExecMode {
    let mut volume: u64 = 0;
    for input in inputs {
        if broadcast.contains(input.index) {
            continue;
        }
        match input.shape.volume_bytes() {
            Some(bytes) => volume = volume.saturating_add(bytes),
            None => return ExecMode::Cluster,
        }
    }
    let mode = if volume < threshold {
        ExecMode::Local
    } else {
        ExecMode::Cluster
    };
    debug!(volume, threshold, ?mode, "execution mode selected");
    mode
}
