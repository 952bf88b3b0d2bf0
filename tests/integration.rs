//! End-to-end submit/await/reconcile flows against scripted collaborators.

use anyhow::Result;
use tabflow::testing::{
    join_instructions, matrix_input, prep_group_agg, prep_mvmult, staging_config, MemorySideChannel,
    MockEngine,
};
use tabflow::{
    build_spec, run_job, BroadcastCache, Dim, ExecMode, JobDef, JobError, JobSpec, OutputReq,
    PartitionDims, StorageFormat, NONZERO_GROUP,
};

/// The classic two-output scenario: multiply a 4000x2500 matrix against a
/// 2500x1 vector twice in the map stage, then sum each intermediate into its
/// own final output in the aggregate stage.
fn two_output_def() -> JobDef {
    JobDef {
        name: Some("mvmult-sum".to_string()),
        inputs: vec![
            matrix_input("data/mvmult/X.mtx", 4000, 2500, 1000),
            matrix_input("data/mvmult/ones.mtx", 2500, 1, 1000),
        ],
        mapper_instructions: join_instructions(&[prep_mvmult(0, 1, 2), prep_mvmult(0, 1, 3)]),
        aggregate_instructions: join_instructions(&[prep_group_agg(2, 4), prep_group_agg(3, 5)]),
        other_instructions: String::new(),
        reducers: 10,
        replication: 1,
        worker_reuse: false,
        outputs: vec![
            OutputReq {
                index: 4,
                path: "data/mvmult/out1.mtx".to_string(),
                format: StorageFormat::TextCell,
            },
            OutputReq {
                index: 5,
                path: "data/mvmult/out2.mtx".to_string(),
                format: StorageFormat::TextCell,
            },
        ],
        record_reader: None,
    }
}

fn build_two_output_spec() -> Result<(JobSpec, tempfile::TempDir)> {
    let (cfg, guard) = staging_config()?;
    Ok((build_spec(two_output_def(), &cfg)?, guard))
}

#[test]
fn the_two_output_job_is_fully_shape_known() -> Result<()> {
    let (spec, _guard) = build_two_output_spec()?;

    // Both finals take the vector operand's shape; nothing to reconcile.
    for out in &spec.outputs {
        assert!(!out.dims_unknown);
        assert_eq!(out.shape.rows, Dim::Known(2500));
        assert_eq!(out.shape.cols, Dim::Known(1));
    }
    assert!(!spec.needs_reconciliation());

    assert!(spec.combiner_enabled);
    assert_eq!(spec.reducers, 10);
    assert_eq!(spec.replication, 1);

    // The vector is referenced twice but broadcast once.
    assert_eq!(spec.broadcast.index_string(), "1");

    // 4000x2500 doubles = 80 MB of non-broadcast input, under the default
    // 128 MB local threshold.
    assert_eq!(spec.mode, ExecMode::Local);
    Ok(())
}

#[test]
fn a_successful_run_yields_resolved_results() -> Result<()> {
    let (spec, _guard) = build_two_output_spec()?;
    let engine = MockEngine::succeeding()
        .with_counter(NONZERO_GROUP, "4", 2500)
        .with_counter(NONZERO_GROUP, "5", 2400);
    let side = MemorySideChannel::new();
    let cache = BroadcastCache::new();

    let result = run_job(&engine, &side, &cache, &spec)?;
    assert!(result.success);
    assert!(result.cleanup_ok);
    assert_eq!(result.shapes.len(), 2);
    assert_eq!(result.shapes[0].rows, Dim::Known(2500));
    assert_eq!(result.shapes[0].nonzeros, Some(2500));
    assert_eq!(result.shapes[1].nonzeros, Some(2400));

    // Exactly one submission reached the engine.
    assert_eq!(engine.submitted().len(), 1);

    // Local mode published the broadcast snapshot in-process.
    assert_eq!(cache.snapshot(), Some(spec.broadcast.clone()));
    Ok(())
}

#[test]
fn a_failed_run_yields_no_partial_result() -> Result<()> {
    let (spec, _guard) = build_two_output_spec()?;
    let side = MemorySideChannel::new();
    let cache = BroadcastCache::new();

    let err = run_job(&MockEngine::failing(), &side, &cache, &spec).unwrap_err();
    assert!(matches!(err, JobError::ExecutionFailure { .. }));
    // Nothing was reconciled, nothing was cleaned up.
    assert!(side.deleted().is_empty());
    Ok(())
}

#[test]
fn a_rejected_submission_fails_the_same_way() -> Result<()> {
    let (spec, _guard) = build_two_output_spec()?;
    let engine = MockEngine::rejecting("spec refused");
    let err = run_job(
        &engine,
        &MemorySideChannel::new(),
        &BroadcastCache::new(),
        &spec,
    )
    .unwrap_err();
    match err {
        JobError::ExecutionFailure { job, reason } => {
            assert_eq!(job, "mvmult-sum");
            assert!(reason.contains("spec refused"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(engine.submitted().is_empty());
    Ok(())
}

#[test]
fn unknown_outputs_are_reconciled_after_a_successful_run() -> Result<()> {
    let (cfg, _guard) = staging_config()?;
    let def = JobDef {
        name: Some("xtab".to_string()),
        inputs: vec![
            matrix_input("data/keys.mtx", 1000, 1, 1000),
            matrix_input("data/vals.mtx", 1000, 1, 1000),
        ],
        mapper_instructions:
            "DIST xtab 0@MATRIX:FP64 1@MATRIX:FP64 0@MATRIX:FP64 2@MATRIX:FP64".to_string(),
        aggregate_instructions: prep_group_agg(2, 3),
        reducers: 2,
        outputs: vec![OutputReq {
            index: 3,
            path: "data/tab.mtx".to_string(),
            format: StorageFormat::TextCell,
        }],
        ..JobDef::default()
    };
    let spec = build_spec(def, &cfg)?;
    assert!(spec.outputs[0].dims_unknown);

    let side = MemorySideChannel::new();
    for (partition, row, col) in [(0u32, 120u64, 50u64), (1, 80, 70)] {
        side.insert(
            &spec.side_channel,
            PartitionDims {
                output: 3,
                partition,
                max_row: row,
                max_col: col,
            },
        );
    }
    let engine = MockEngine::succeeding().with_counter(NONZERO_GROUP, "3", 961);

    let result = run_job(&engine, &side, &BroadcastCache::new(), &spec)?;
    assert_eq!(result.shapes[0].rows, Dim::Known(120));
    assert_eq!(result.shapes[0].cols, Dim::Known(70));
    assert_eq!(result.shapes[0].nonzeros, Some(961));
    assert_eq!(side.deleted(), vec![spec.side_channel.clone()]);
    Ok(())
}

#[test]
fn back_to_back_local_jobs_do_not_share_broadcast_state() -> Result<()> {
    let (cfg, _guard) = staging_config()?;
    let cache = BroadcastCache::new();
    let engine = MockEngine::succeeding().with_counter(NONZERO_GROUP, "3", 1);
    let side = MemorySideChannel::new();

    let def_with_side = |side_input: i32| JobDef {
        inputs: vec![
            matrix_input("data/a.mtx", 100, 100, 10),
            matrix_input("data/u.mtx", 100, 1, 10),
            matrix_input("data/v.mtx", 100, 1, 10),
        ],
        mapper_instructions: prep_mvmult(0, side_input, 3),
        outputs: vec![OutputReq {
            index: 3,
            path: "data/out3.mtx".to_string(),
            format: StorageFormat::TextCell,
        }],
        ..JobDef::default()
    };

    let first = build_spec(def_with_side(1), &cfg)?;
    run_job(&engine, &side, &cache, &first)?;
    assert_eq!(cache.snapshot(), Some(first.broadcast.clone()));

    // The second submission replaces the first job's snapshot wholesale.
    let second = build_spec(def_with_side(2), &cfg)?;
    run_job(&engine, &side, &cache, &second)?;
    let snapshot = cache.snapshot().unwrap();
    assert_eq!(snapshot, second.broadcast);
    assert!(!snapshot.contains(1));
    Ok(())
}
