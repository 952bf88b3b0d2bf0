//! Instruction text grammar: encoding and parsing.
//!
//! An instruction is a single line of delimited text, stable across this
//! crate and the execution engine:
//!
//! ```text
//! <target> <opcode> <operand>... <output-operand>
//! ```
//!
//! Fields are separated by [`FIELD_DELIM`]; instructions within one stage
//! string are joined by [`INSTRUCTION_DELIM`]. An operand is self-describing:
//!
//! ```text
//! <index-or-literal>@<datatype>:<valuetype>      e.g.  0@MATRIX:FP64
//! ```
//!
//! Scalar operands come in two flavors. A compile-time constant embeds its
//! literal value directly (`1@SCALAR:FP64`); a runtime-resolved scalar embeds
//! its symbol wrapped in [`SYMBOL_MARKER`] pairs (`##w##@SCALAR:FP64`),
//! substituted from the runtime symbol table just before execution.
//!
//! Two addressing modes exist for the combine operator:
//!
//! - **label-addressed** ([`OperatorNode::encode_labeled`]) - used while a
//!   program is still being lowered; matrix operands reference producing
//!   steps by name.
//! - **positional** ([`OperatorNode::encode_positional`]) - the final,
//!   execution-ready form; matrix operands are integer slot indices with a
//!   fixed-arity layout per [`OperationKind`]. Slots not applicable to a
//!   kind must be passed as [`ABSENT`].
//!
//! These delimiters are load-bearing: every consumer parses by splitting on
//! the field delimiter and sub-parsing operands by the datatype/valuetype
//! markers, exactly as [`parse_instruction`] does.

use serde::{Deserialize, Serialize};

use crate::error::LoweringError;
use crate::op::{DataKind, ExecTarget, OperationKind, OperatorNode, ValueKind};

/// Joins instructions within one stage string.
pub const INSTRUCTION_DELIM: char = ',';
/// Separates top-level fields within one instruction.
pub const FIELD_DELIM: char = ' ';
/// Separates the index/literal token from the datatype tag.
pub const DATATYPE_MARKER: char = '@';
/// Separates the datatype tag from the valuetype tag.
pub const VALUETYPE_MARKER: char = ':';
/// Wraps a deferred scalar symbol on both sides.
pub const SYMBOL_MARKER: &str = "##";
/// Sentinel for positional slots not applicable to an operation kind.
pub const ABSENT: i32 = -1;

/// How an operand is addressed in instruction text.
///
/// Exactly one form applies to a rendered operand: scalars are either
/// compile-time literals or deferred symbols, and matrix operands become
/// labels or positional slots at encode time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Binding {
    /// Compile-time constant, embedded as its literal text.
    Literal(String),
    /// Runtime-resolved symbol, rendered inside `##` markers.
    Symbol(String),
    /// Positional slot in a task's working set; [`ABSENT`] until assigned.
    Slot(i32),
}

/// One operand of an operator node: declared datatype, value type, and how
/// it is addressed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub data: DataKind,
    pub value: ValueKind,
    pub binding: Binding,
}

impl Operand {
    /// A matrix operand; its label or slot is supplied at encode time.
    #[must_use]
    pub fn matrix(value: ValueKind) -> Self {
        Self {
            data: DataKind::Matrix,
            value,
            binding: Binding::Slot(ABSENT),
        }
    }

    /// A scalar operand bound to a compile-time constant.
    pub fn literal(value: ValueKind, text: impl Into<String>) -> Self {
        Self {
            data: DataKind::Scalar,
            value,
            binding: Binding::Literal(text.into()),
        }
    }

    /// A scalar operand bound to a runtime symbol.
    pub fn symbol(value: ValueKind, name: impl Into<String>) -> Self {
        Self {
            data: DataKind::Scalar,
            value,
            binding: Binding::Symbol(name.into()),
        }
    }

    /// Render through the scalar renderer: literal text for constants, a
    /// `##`-wrapped placeholder for deferred symbols.
    fn render_scalar(&self) -> String {
        let token = match &self.binding {
            Binding::Literal(text) => text.clone(),
            Binding::Symbol(name) => format!("{SYMBOL_MARKER}{name}{SYMBOL_MARKER}"),
            Binding::Slot(slot) => slot.to_string(),
        };
        render(&token, self.data, self.value)
    }
}

fn render(token: &str, data: DataKind, value: ValueKind) -> String {
    format!(
        "{token}{DATATYPE_MARKER}{dt}{VALUETYPE_MARKER}{vt}",
        dt = data.tag(),
        vt = value.tag()
    )
}

fn render_matrix_slot(slot: i32, value: ValueKind) -> String {
    render(&slot.to_string(), DataKind::Matrix, value)
}

impl OperatorNode {
    /// Encode in label-addressed mode, referencing producing steps by name.
    ///
    /// Matrix operands render through the standard matrix renderer with the
    /// caller-supplied label; scalar operands render through the scalar
    /// renderer (literal or deferred placeholder, per their binding).
    ///
    /// # Errors
    ///
    /// [`LoweringError::UnmappedOperation`] for a node whose kind has no
    /// instruction mapping.
    pub fn encode_labeled(
        &self,
        labels: [&str; 3],
        output_label: &str,
    ) -> Result<String, LoweringError> {
        if self.kind == OperationKind::Invalid {
            return Err(LoweringError::UnmappedOperation { kind: self.kind });
        }
        let mut fields = vec![self.target.tag().to_string(), "xtab".to_string()];
        for (input, label) in self.inputs.iter().zip(labels) {
            if input.data == DataKind::Scalar {
                fields.push(input.render_scalar());
            } else {
                fields.push(render(label, input.data, input.value));
            }
        }
        fields.push(render(output_label, self.output.data, self.output.value));
        Ok(fields.join(&FIELD_DELIM.to_string()))
    }

    /// Encode in positional mode, the execution-ready form.
    ///
    /// Each kind has a fixed-arity layout; slot arguments for operands the
    /// kind takes as scalars must be [`ABSENT`], and slots for matrix
    /// operands must not be. Violations are caller-contract errors, not
    /// reachable through correct classification.
    ///
    /// # Errors
    ///
    /// [`LoweringError::ArityViolation`] when a slot argument contradicts
    /// the kind's layout, [`LoweringError::UnmappedOperation`] when the kind
    /// has no mapping.
    pub fn encode_positional(
        &self,
        slot1: i32,
        slot2: i32,
        slot3: i32,
        output_slot: i32,
    ) -> Result<String, LoweringError> {
        let opcode = self
            .kind
            .opcode()
            .ok_or(LoweringError::UnmappedOperation { kind: self.kind })?;

        let arity_check = |position: usize, slot: i32, expect_absent: bool| {
            let violated = if expect_absent {
                slot != ABSENT
            } else {
                slot == ABSENT
            };
            if violated {
                Err(LoweringError::ArityViolation {
                    kind: self.kind,
                    position,
                    slot,
                })
            } else {
                Ok(())
            }
        };

        let mut fields = vec![self.target.tag().to_string(), opcode.to_string()];
        match self.kind {
            OperationKind::CombineGeneric => {
                arity_check(1, slot1, false)?;
                arity_check(2, slot2, false)?;
                arity_check(3, slot3, false)?;
                fields.push(render_matrix_slot(slot1, self.inputs[0].value));
                fields.push(render_matrix_slot(slot2, self.inputs[1].value));
                fields.push(render_matrix_slot(slot3, self.inputs[2].value));
            }
            OperationKind::CombineScalarWeight => {
                // Third operand is the scalar weight; its slot must be absent.
                arity_check(3, slot3, true)?;
                fields.push(render_matrix_slot(slot1, self.inputs[0].value));
                fields.push(render_matrix_slot(slot2, self.inputs[1].value));
                fields.push(self.inputs[2].render_scalar());
            }
            OperationKind::CombineHistogram => {
                arity_check(2, slot2, true)?;
                arity_check(3, slot3, true)?;
                fields.push(render_matrix_slot(slot1, self.inputs[0].value));
                fields.push(self.inputs[1].render_scalar());
                fields.push(self.inputs[2].render_scalar());
            }
            OperationKind::CombineWeightedHistogram => {
                arity_check(2, slot2, true)?;
                fields.push(render_matrix_slot(slot1, self.inputs[0].value));
                fields.push(self.inputs[1].render_scalar());
                fields.push(render_matrix_slot(slot3, self.inputs[2].value));
            }
            OperationKind::Invalid => unreachable!("opcode() returned Some for Invalid"),
        }
        fields.push(render(
            &output_slot.to_string(),
            self.output.data,
            self.output.value,
        ));
        Ok(fields.join(&FIELD_DELIM.to_string()))
    }
}

/// One parsed operand: the raw index/literal token plus its type tags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedOperand {
    pub token: String,
    pub data: DataKind,
    pub value: ValueKind,
}

impl ParsedOperand {
    /// The positional slot index, when the token is one.
    #[must_use]
    pub fn slot(&self) -> Option<i32> {
        self.token.parse().ok()
    }

    /// True for a `##`-wrapped deferred scalar placeholder.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.token.len() > 2 * SYMBOL_MARKER.len()
            && self.token.starts_with(SYMBOL_MARKER)
            && self.token.ends_with(SYMBOL_MARKER)
    }
}

/// One parsed instruction: target tag, opcode, operands (output last).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedInstruction {
    pub target: ExecTarget,
    pub opcode: String,
    pub operands: Vec<ParsedOperand>,
}

impl ParsedInstruction {
    /// All operands except the output.
    #[must_use]
    pub fn inputs(&self) -> &[ParsedOperand] {
        &self.operands[..self.operands.len() - 1]
    }

    /// The output operand (always the last field).
    #[must_use]
    pub fn output(&self) -> &ParsedOperand {
        &self.operands[self.operands.len() - 1]
    }
}

/// Split a stage string into its non-empty instruction texts.
pub fn split_instructions(stage: &str) -> impl Iterator<Item = &str> {
    stage
        .split(INSTRUCTION_DELIM)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Parse one instruction by the stable grammar.
///
/// # Errors
///
/// [`LoweringError::MalformedInstruction`] when any field or operand does
/// not follow the grammar.
pub fn parse_instruction(text: &str) -> Result<ParsedInstruction, LoweringError> {
    let malformed = |reason: &str| LoweringError::MalformedInstruction {
        text: text.to_string(),
        reason: reason.to_string(),
    };

    let mut fields = text.split(FIELD_DELIM).filter(|f| !f.is_empty());
    let target = match fields.next() {
        Some("DIST") => ExecTarget::Distributed,
        Some("LOCAL") => ExecTarget::DriverLocal,
        Some(_) => return Err(malformed("unknown execution-target tag")),
        None => return Err(malformed("empty instruction")),
    };
    let opcode = fields
        .next()
        .ok_or_else(|| malformed("missing opcode"))?
        .to_string();

    let mut operands = Vec::new();
    for field in fields {
        // Split from the right so literal tokens containing marker
        // characters still parse.
        let (lhs, vt_tag) = field
            .rsplit_once(VALUETYPE_MARKER)
            .ok_or_else(|| malformed("operand missing valuetype marker"))?;
        let (token, dt_tag) = lhs
            .rsplit_once(DATATYPE_MARKER)
            .ok_or_else(|| malformed("operand missing datatype marker"))?;
        if token.is_empty() {
            return Err(malformed("operand missing index or literal"));
        }
        let data =
            DataKind::from_tag(dt_tag).ok_or_else(|| malformed("unknown datatype tag"))?;
        let value =
            ValueKind::from_tag(vt_tag).ok_or_else(|| malformed("unknown valuetype tag"))?;
        operands.push(ParsedOperand {
            token: token.to_string(),
            data,
            value,
        });
    }
    if operands.is_empty() {
        return Err(malformed("instruction has no operands"));
    }
    Ok(ParsedInstruction {
        target,
        opcode,
        operands,
    })
}
