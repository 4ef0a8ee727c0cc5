//! Two engines, same seed, same operations.
//! They must produce byte-identical event logs and identical worlds.
//! Queued commands carry random ids, so these runs use the direct API only.

use timespine_core::{
    branch::BranchPriority,
    engine::SpineEngine,
    merge::BranchMergeRequest,
    modification::{EntityRef, WhatIfModification},
    sandbox::GOLD,
    scenario::WhatIfRequest,
    types::MAIN_BRANCH_ID,
};

const RUN_ID: &str = "det-test";

fn collect_event_log(engine: &SpineEngine) -> Vec<String> {
    (0..=engine.clock.current_tick)
        .flat_map(|tick| {
            engine
                .store_events_for_tick(RUN_ID, tick)
                .expect("read events")
                .into_iter()
                .map(|e| e.payload)
        })
        .collect()
}

/// A busy year: scenarios that merge and get pruned, a manual branch
/// merged mid-run, and a preserved scenario left frozen at the end.
fn scripted_run(seed: u64) -> SpineEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut engine = SpineEngine::build_test(RUN_ID.into(), seed).expect("build");
    engine.run_ticks(30).expect("warm-up");

    let mut windfall = WhatIfRequest::new("windfall", 30, 40);
    windfall.auto_merge_if_better = true;
    engine
        .submit_scenario(windfall, &[WhatIfModification::set_resource(EntityRef::Origin(1), GOLD, 50_000.0)])
        .expect("windfall");
    engine
        .submit_scenario(
            WhatIfRequest::new("background", 30, 60),
            &[WhatIfModification::remove(EntityRef::Origin(2))],
        )
        .expect("background");

    let manual = engine.create_branch(MAIN_BRANCH_ID, 30, BranchPriority::Normal).expect("branch");
    engine.run_ticks(45).expect("mid-run");
    engine.freeze_branch(&manual).expect("freeze");
    engine.request_merge(&BranchMergeRequest::full(&manual, MAIN_BRANCH_ID)).expect("merge");

    let mut austerity = WhatIfRequest::new("austerity", 75, 90);
    austerity.preserve_after_complete = true;
    engine
        .submit_scenario(austerity, &[WhatIfModification::set_resource(EntityRef::Origin(1), GOLD, 0.0)])
        .expect("austerity");

    engine.run_ticks(290).expect("rest of year");
    engine
}

#[test]
fn same_seed_produces_identical_event_logs() {
    const SEED: u64 = 0xDEAD_BEEF_CAFE_1234;

    let engine_a = scripted_run(SEED);
    let engine_b = scripted_run(SEED);

    let log_a = collect_event_log(&engine_a);
    let log_b = collect_event_log(&engine_b);
    assert!(!log_a.is_empty());
    assert_eq!(
        log_a.len(), log_b.len(),
        "Event log lengths differ: {} vs {}",
        log_a.len(), log_b.len()
    );
    for (i, (a, b)) in log_a.iter().zip(log_b.iter()).enumerate() {
        assert_eq!(a, b, "Event log diverged at entry {i}:\n  A: {a}\n  B: {b}");
    }

    let ids_a: Vec<_> = engine_a.registry().branches().map(|b| b.id.clone()).collect();
    let ids_b: Vec<_> = engine_b.registry().branches().map(|b| b.id.clone()).collect();
    assert_eq!(ids_a, ids_b);
    assert_eq!(
        engine_a.arena(MAIN_BRANCH_ID).unwrap().entities(),
        engine_b.arena(MAIN_BRANCH_ID).unwrap().entities()
    );
}

#[test]
fn different_seeds_produce_different_worlds() {
    let mut engine_a = SpineEngine::build_test(RUN_ID.into(), 42).expect("build a");
    let mut engine_b = SpineEngine::build_test(RUN_ID.into(), 99).expect("build b");

    engine_a.run_ticks(90).expect("run a");
    engine_b.run_ticks(90).expect("run b");

    let metrics_a = engine_a.snapshot(MAIN_BRANCH_ID).unwrap().metrics;
    let metrics_b = engine_b.snapshot(MAIN_BRANCH_ID).unwrap().metrics;
    assert_ne!(metrics_a, metrics_b, "Different seeds produced identical worlds; seed is not being used");
}
