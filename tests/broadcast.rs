use anyhow::Result;
use tabflow::testing::{join_instructions, prep_mappend, prep_mvmult, prep_unary_agg};
use tabflow::{BroadcastCache, BroadcastPlan, ExecMode, JobError};

fn paths(n: u32) -> Vec<(u32, String)> {
    (0..n).map(|i| (i, format!("data/in{i}.mtx"))).collect()
}

#[test]
fn side_inputs_are_deduplicated_across_opcodes() -> Result<()> {
    // Both instructions reference input 3 as their side input; the plan
    // must carry it exactly once.
    let mapper = join_instructions(&[prep_mvmult(0, 3, 4), prep_mappend(1, 3, 5)]);
    let plan = BroadcastPlan::scan(&mapper, &paths(4))?;
    assert_eq!(plan.entries, vec![(3, "data/in3.mtx".to_string())]);
    assert_eq!(plan.index_string(), "3");
    assert_eq!(plan.path_string(), "data/in3.mtx");
    Ok(())
}

#[test]
fn selection_preserves_first_seen_order() -> Result<()> {
    let mapper = join_instructions(&[
        prep_mvmult(0, 2, 4),
        prep_mvmult(1, 3, 5),
        prep_mappend(0, 2, 6),
    ]);
    let plan = BroadcastPlan::scan(&mapper, &paths(4))?;
    assert_eq!(
        plan.entries,
        vec![(2, "data/in2.mtx".to_string()), (3, "data/in3.mtx".to_string())]
    );
    assert_eq!(plan.index_string(), "2,3");
    assert_eq!(plan.path_string(), "data/in2.mtx,data/in3.mtx");
    assert!(plan.contains(2) && plan.contains(3) && !plan.contains(0));
    Ok(())
}

#[test]
fn non_broadcast_opcodes_are_ignored() -> Result<()> {
    let mapper = prep_unary_agg(0, 1);
    let plan = BroadcastPlan::scan(&mapper, &paths(1))?;
    assert!(plan.is_empty());

    let empty = BroadcastPlan::scan("", &paths(1))?;
    assert!(empty.is_empty());
    Ok(())
}

#[test]
fn a_side_input_slot_must_name_a_job_input() {
    let mapper = prep_mvmult(0, 9, 4);
    let err = BroadcastPlan::scan(&mapper, &paths(2)).unwrap_err();
    assert!(matches!(err, JobError::BuildValidation { .. }));
}

#[test]
fn unparseable_mapper_text_is_surfaced() {
    let err = BroadcastPlan::scan("DIST mvmult nonsense", &paths(2)).unwrap_err();
    assert!(matches!(err, JobError::Lowering(_)));
}

#[test]
fn local_publish_invalidates_the_previous_snapshot() -> Result<()> {
    let cache = BroadcastCache::new();
    let first = BroadcastPlan::scan(&prep_mvmult(0, 1, 2), &paths(2))?;
    let second = BroadcastPlan::scan(&prep_mvmult(1, 0, 3), &paths(2))?;

    cache.publish(&first, ExecMode::Local);
    assert_eq!(cache.snapshot(), Some(first));

    // A later local job must never observe the earlier job's snapshot.
    cache.publish(&second, ExecMode::Local);
    assert_eq!(cache.snapshot(), Some(second));

    cache.reset();
    assert_eq!(cache.snapshot(), None);
    Ok(())
}

#[test]
fn cluster_publish_leaves_the_cache_untouched() -> Result<()> {
    let cache = BroadcastCache::new();
    let plan = BroadcastPlan::scan(&prep_mvmult(0, 1, 2), &paths(2))?;
    cache.publish(&plan, ExecMode::Cluster);
    assert_eq!(cache.snapshot(), None);
    Ok(())
}
