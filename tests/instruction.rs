use anyhow::Result;
use tabflow::{
    parse_instruction, split_instructions, DataKind, ExecTarget, LoweringError, Operand,
    OperationKind, OperatorNode, ValueKind, ABSENT,
};

fn all_matrix_node() -> OperatorNode {
    OperatorNode::combine(
        [
            Operand::matrix(ValueKind::Fp64),
            Operand::matrix(ValueKind::Fp64),
            Operand::matrix(ValueKind::Fp64),
        ],
        Operand::matrix(ValueKind::Fp64),
        ExecTarget::Distributed,
    )
    .unwrap()
}

fn scalar_weight_node(weight: Operand) -> OperatorNode {
    OperatorNode::combine(
        [
            Operand::matrix(ValueKind::Fp64),
            Operand::matrix(ValueKind::Fp64),
            weight,
        ],
        Operand::matrix(ValueKind::Fp64),
        ExecTarget::Distributed,
    )
    .unwrap()
}

#[test]
fn generic_combine_round_trips_through_the_grammar() -> Result<()> {
    let text = all_matrix_node().encode_positional(1, 2, 3, 4)?;
    assert_eq!(
        text,
        "DIST xtab 1@MATRIX:FP64 2@MATRIX:FP64 3@MATRIX:FP64 4@MATRIX:FP64"
    );

    let parsed = parse_instruction(&text)?;
    assert_eq!(parsed.target, ExecTarget::Distributed);
    assert_eq!(parsed.opcode, "xtab");
    assert_eq!(parsed.inputs().len(), 3);
    let slots: Vec<i32> = parsed.inputs().iter().filter_map(|op| op.slot()).collect();
    assert_eq!(slots, vec![1, 2, 3]);
    assert!(parsed.inputs().iter().all(|op| op.data == DataKind::Matrix));
    assert_eq!(parsed.output().slot(), Some(4));
    Ok(())
}

#[test]
fn generic_combine_requires_every_slot() {
    let err = all_matrix_node()
        .encode_positional(1, ABSENT, 3, 4)
        .unwrap_err();
    assert!(matches!(
        err,
        LoweringError::ArityViolation {
            kind: OperationKind::CombineGeneric,
            position: 2,
            ..
        }
    ));
}

#[test]
fn scalar_weight_guards_its_third_slot() -> Result<()> {
    let node = scalar_weight_node(Operand::literal(ValueKind::Fp64, "1"));

    // Absent third slot is the contract; anything else is a caller error.
    let ok = node.encode_positional(0, 1, ABSENT, 2)?;
    assert_eq!(
        ok,
        "DIST xtabscalarweight 0@MATRIX:FP64 1@MATRIX:FP64 1@SCALAR:FP64 2@MATRIX:FP64"
    );

    let err = node.encode_positional(0, 1, 5, 2).unwrap_err();
    assert!(matches!(
        err,
        LoweringError::ArityViolation {
            kind: OperationKind::CombineScalarWeight,
            position: 3,
            slot: 5,
        }
    ));
    Ok(())
}

#[test]
fn histogram_takes_two_scalar_operands() -> Result<()> {
    let node = OperatorNode::combine(
        [
            Operand::matrix(ValueKind::Fp64),
            Operand::literal(ValueKind::Fp64, "1"),
            Operand::symbol(ValueKind::Fp64, "w"),
        ],
        Operand::matrix(ValueKind::Fp64),
        ExecTarget::Distributed,
    )?;
    assert_eq!(node.kind, OperationKind::CombineHistogram);

    let text = node.encode_positional(0, ABSENT, ABSENT, 1)?;
    assert_eq!(
        text,
        "DIST xtabhistogram 0@MATRIX:FP64 1@SCALAR:FP64 ##w##@SCALAR:FP64 1@MATRIX:FP64"
    );

    assert!(node.encode_positional(0, 3, ABSENT, 1).is_err());
    assert!(node.encode_positional(0, ABSENT, 3, 1).is_err());
    Ok(())
}

#[test]
fn weighted_histogram_keeps_the_weight_matrix_positional() -> Result<()> {
    let node = OperatorNode::combine(
        [
            Operand::matrix(ValueKind::Fp64),
            Operand::literal(ValueKind::Fp64, "1"),
            Operand::matrix(ValueKind::Fp64),
        ],
        Operand::matrix(ValueKind::Fp64),
        ExecTarget::Distributed,
    )?;
    assert_eq!(node.kind, OperationKind::CombineWeightedHistogram);

    let text = node.encode_positional(0, ABSENT, 2, 3)?;
    assert_eq!(
        text,
        "DIST xtabweightedhistogram 0@MATRIX:FP64 1@SCALAR:FP64 2@MATRIX:FP64 3@MATRIX:FP64"
    );

    let err = node.encode_positional(0, 7, 2, 3).unwrap_err();
    assert!(matches!(err, LoweringError::ArityViolation { slot: 7, .. }));
    Ok(())
}

#[test]
fn constant_scalars_embed_literally_and_symbols_defer() -> Result<()> {
    let literal = scalar_weight_node(Operand::literal(ValueKind::Fp64, "1"))
        .encode_positional(0, 1, ABSENT, 2)?;
    assert!(literal.contains(" 1@SCALAR:FP64 "));
    assert!(!literal.contains("##"));

    let deferred = scalar_weight_node(Operand::symbol(ValueKind::Fp64, "w"))
        .encode_positional(0, 1, ABSENT, 2)?;
    assert!(deferred.contains(" ##w##@SCALAR:FP64 "));

    let parsed = parse_instruction(&deferred)?;
    assert!(parsed.inputs()[2].is_deferred());
    assert_eq!(parsed.inputs()[2].slot(), None);
    Ok(())
}

#[test]
fn labeled_mode_references_producing_steps_by_name() -> Result<()> {
    let node = scalar_weight_node(Operand::symbol(ValueKind::Fp64, "w"));
    let text = node.encode_labeled(["stepA", "stepB", "unused"], "stepOut")?;
    assert_eq!(
        text,
        "DIST xtab stepA@MATRIX:FP64 stepB@MATRIX:FP64 ##w##@SCALAR:FP64 stepOut@MATRIX:FP64"
    );
    Ok(())
}

#[test]
fn unmapped_operations_are_a_defect_not_a_fallback() {
    let mut node = all_matrix_node();
    node.kind = OperationKind::Invalid;
    let err = node.encode_positional(0, 1, 2, 3).unwrap_err();
    assert!(matches!(
        err,
        LoweringError::UnmappedOperation {
            kind: OperationKind::Invalid
        }
    ));
}

#[test]
fn malformed_instructions_fail_to_parse() {
    for bad in [
        "",
        "DIST",
        "WRONG xtab 0@MATRIX:FP64 1@MATRIX:FP64",
        "DIST xtab 0@MATRIX 1@MATRIX:FP64",
        "DIST xtab 0:FP64 1@MATRIX:FP64",
        "DIST xtab 0@GRID:FP64 1@MATRIX:FP64",
        "DIST xtab 0@MATRIX:FP128 1@MATRIX:FP64",
        "DIST xtab",
    ] {
        assert!(
            matches!(
                parse_instruction(bad),
                Err(LoweringError::MalformedInstruction { .. })
            ),
            "`{bad}` should not parse"
        );
    }
}

#[test]
fn stage_strings_split_on_the_instruction_delimiter() {
    let stage = "DIST uagg+ 0@MATRIX:FP64 1@MATRIX:FP64,DIST uagg+ 1@MATRIX:FP64 2@MATRIX:FP64";
    let parts: Vec<&str> = split_instructions(stage).collect();
    assert_eq!(parts.len(), 2);
    assert!(split_instructions("").next().is_none());
    assert!(split_instructions(" , ,").next().is_none());
}
