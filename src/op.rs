//! Combine (cross-tabulation) operator nodes and their classification.
//!
//! An [`OperatorNode`] is a plain tagged record: three ordered operands, an
//! output operand, an [`OperationKind`] derived from the operand datatypes,
//! and execution properties (target, compatible job kinds). Dispatch happens
//! on the kind, not on a type hierarchy.

use serde::{Deserialize, Serialize};

use crate::error::LoweringError;
use crate::instruction::Operand;

/// Datatype tag of one operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    Matrix,
    Scalar,
}

impl DataKind {
    /// Tag text used inside operand strings.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            DataKind::Matrix => "MATRIX",
            DataKind::Scalar => "SCALAR",
        }
    }

    pub(crate) fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "MATRIX" => Some(DataKind::Matrix),
            "SCALAR" => Some(DataKind::Scalar),
            _ => None,
        }
    }
}

/// Value-type tag of one operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Fp64,
    Int64,
    Bool,
    Str,
}

impl ValueKind {
    /// Tag text used inside operand strings.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            ValueKind::Fp64 => "FP64",
            ValueKind::Int64 => "INT64",
            ValueKind::Bool => "BOOL",
            ValueKind::Str => "STR",
        }
    }

    pub(crate) fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "FP64" => Some(ValueKind::Fp64),
            "INT64" => Some(ValueKind::Int64),
            "BOOL" => Some(ValueKind::Bool),
            "STR" => Some(ValueKind::Str),
            _ => None,
        }
    }
}

/// The four realizable combine operations, plus the unrealizable case.
///
/// Determined solely by the datatype triple of the three operands; the first
/// operand must be a matrix or the kind is [`Invalid`](OperationKind::Invalid).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// `combine(A, B, W)` - all three operands are matrices.
    CombineGeneric,
    /// `combine(A, B)` / `combine(A, B, w)` - matrix pair, scalar weight.
    CombineScalarWeight,
    /// `combine(A, s)` / `combine(A, s, w)` - one matrix, two scalars.
    CombineHistogram,
    /// `combine(A, s, W)` - matrix, scalar, weight matrix.
    CombineWeightedHistogram,
    Invalid,
}

impl OperationKind {
    /// Classify by the operand datatype triple. Total over the input space:
    /// every triple maps to exactly one kind, and a non-matrix first operand
    /// always maps to `Invalid`.
    #[must_use]
    pub fn classify(op1: DataKind, op2: DataKind, op3: DataKind) -> Self {
        if op1 != DataKind::Matrix {
            return OperationKind::Invalid;
        }
        match (op2, op3) {
            (DataKind::Matrix, DataKind::Scalar) => OperationKind::CombineScalarWeight,
            (DataKind::Scalar, DataKind::Scalar) => OperationKind::CombineHistogram,
            (DataKind::Scalar, DataKind::Matrix) => OperationKind::CombineWeightedHistogram,
            (DataKind::Matrix, DataKind::Matrix) => OperationKind::CombineGeneric,
        }
    }

    /// Opcode of the execution-ready (positional) instruction form, or
    /// `None` for kinds with no mapping.
    #[must_use]
    pub fn opcode(self) -> Option<&'static str> {
        match self {
            OperationKind::CombineGeneric => Some("xtab"),
            OperationKind::CombineScalarWeight => Some("xtabscalarweight"),
            OperationKind::CombineHistogram => Some("xtabhistogram"),
            OperationKind::CombineWeightedHistogram => Some("xtabweightedhistogram"),
            OperationKind::Invalid => None,
        }
    }
}

/// Where the lowered instruction executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecTarget {
    /// Shipped to distributed workers as part of a batch job.
    Distributed,
    /// Evaluated in the driver process.
    DriverLocal,
}

impl ExecTarget {
    /// Execution-target tag, the first field of every instruction.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            ExecTarget::Distributed => "DIST",
            ExecTarget::DriverLocal => "LOCAL",
        }
    }
}

/// Job kinds a distributed operator may be scheduled into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Generic,
    DataGen,
    Reblock,
    Invalid,
}

/// A lowered combine operator: three ordered inputs, one output, and the
/// execution properties the job builder needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatorNode {
    pub inputs: [Operand; 3],
    pub output: Operand,
    pub kind: OperationKind,
    pub target: ExecTarget,
    /// Job kinds this node may be assigned to.
    pub compatible_jobs: Vec<JobKind>,
}

impl OperatorNode {
    /// Build a combine node from its operands, classifying by their declared
    /// datatypes.
    ///
    /// # Errors
    ///
    /// [`LoweringError::ClassificationInvalid`] if the first operand is not
    /// a matrix - the operator cannot be realized.
    pub fn combine(
        inputs: [Operand; 3],
        output: Operand,
        target: ExecTarget,
    ) -> Result<Self, LoweringError> {
        let kind = OperationKind::classify(inputs[0].data, inputs[1].data, inputs[2].data);
        if kind == OperationKind::Invalid {
            return Err(LoweringError::ClassificationInvalid {
                first: inputs[0].data,
            });
        }
        let compatible_jobs = match target {
            ExecTarget::Distributed => vec![JobKind::Generic, JobKind::DataGen, JobKind::Reblock],
            ExecTarget::DriverLocal => vec![JobKind::Invalid],
        };
        Ok(Self {
            inputs,
            output,
            kind,
            target,
            compatible_jobs,
        })
    }

    /// True if this node may run inside a job of the given kind.
    #[must_use]
    pub fn compatible_with(&self, job: JobKind) -> bool {
        self.compatible_jobs.contains(&job)
    }
}
