//! Lifecycle tests: lock-step advancement, freeze conditions, GC.

use timespine_core::{
    arena::{BranchArena, OriginAllocator},
    branch::{BranchPriority, FreezeReason},
    command::ComparisonRequest,
    config::TimeSpineConfig,
    engine::SpineEngine,
    error::{SpineError, SpineResult},
    host::HostSimulation,
    merge::BranchMergeRequest,
    rng::BranchRng,
    sandbox::{SandboxSimulation, GOLD, KIND_TREASURY},
    snapshot::AggregateMetrics,
    store::SpineStore,
    types::{Tick, MAIN_BRANCH_ID},
};

/// BranchPointTick <= CurrentTick <= MaxTick for every branch after every tick.
#[test]
fn tick_ordering_invariant_holds_every_tick() {
    let mut engine = SpineEngine::build_test("tick-order".into(), 42).unwrap();
    engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::High).unwrap();
    engine.run_ticks(10).unwrap();
    engine.create_branch(MAIN_BRANCH_ID, 10, BranchPriority::Low).unwrap();

    for _ in 0..40 {
        engine.run_ticks(1).unwrap();
        for branch in engine.registry().branches() {
            assert!(
                branch.branch_point_tick <= branch.current_tick()
                    && branch.current_tick() <= branch.max_tick(),
                "{} broke tick ordering: {} / {} / {}",
                branch.id,
                branch.branch_point_tick,
                branch.current_tick(),
                branch.max_tick()
            );
        }
        engine.check_invariants().unwrap();
    }
}

#[test]
fn branches_advance_in_lockstep_with_main() {
    let mut engine = SpineEngine::build_test("lockstep".into(), 42).unwrap();
    let branch = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();
    engine.run_ticks(25).unwrap();

    assert_eq!(engine.main_branch().current_tick(), 25);
    assert_eq!(engine.branch(&branch).unwrap().current_tick(), 25);
    assert_eq!(engine.branch(&branch).unwrap().elapsed(), 25);
    assert_eq!(engine.snapshot(&branch).unwrap().tick, 25);
}

/// An untouched fork replays its parent: same entities, same numbers,
/// including everything born after the fork.
#[test]
fn untouched_fork_tracks_its_parent() {
    let mut engine = SpineEngine::build_test("untouched-fork".into(), 42).unwrap();
    let branch = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();
    engine.run_ticks(300).unwrap();

    let main = engine.arena(MAIN_BRANCH_ID).unwrap();
    let fork = engine.arena(&branch).unwrap();
    assert!(main.iter().any(|e| e.membership.created_at_tick > 0), "no births in 300 ticks");
    assert_eq!(main.len(), fork.len());
    for entity in main.iter() {
        let twin = fork.get(entity.origin_id).expect("entity missing from fork");
        assert_eq!(entity.kind, twin.kind);
        assert_eq!(entity.resources, twin.resources, "entity {} drifted", entity.origin_id);
    }

    let comparison = engine
        .request_comparison(&ComparisonRequest::new(MAIN_BRANCH_ID, &branch, true))
        .unwrap();
    assert_eq!((comparison.only_in_a, comparison.only_in_b, comparison.diverged), (0, 0, 0));
    assert_eq!(comparison.divergence, 0.0);
    assert_eq!(engine.branch(&branch).unwrap().divergence_score(), 0.0);
}

/// A branch past MaxBranchDuration is frozen on the next pass and stops.
#[test]
fn duration_freeze_stops_advancement() {
    let config = TimeSpineConfig {
        max_branch_duration:  5,
        divergence_threshold: 1.0,
        ..TimeSpineConfig::default_test()
    };
    let mut engine = SpineEngine::build_test_with("duration-freeze".into(), 42, config).unwrap();
    let id = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();

    engine.run_ticks(6).unwrap();
    assert!(!engine.branch(&id).unwrap().is_frozen(), "elapsed == max is still allowed");
    assert_eq!(engine.branch(&id).unwrap().current_tick(), 6);

    engine.run_ticks(1).unwrap();
    let branch = engine.branch(&id).unwrap();
    assert!(branch.is_frozen());
    assert_eq!(branch.freeze_reason, Some(FreezeReason::DurationExceeded));
    assert_eq!(branch.current_tick(), 6);

    engine.run_ticks(5).unwrap();
    assert_eq!(engine.branch(&id).unwrap().current_tick(), 6, "frozen branch advanced");
    assert_eq!(engine.main_branch().current_tick(), 12);
    assert_eq!(engine.store_event_count("branch_frozen").unwrap(), 1);
}

/// Gutting a branch's world pushes divergence over the threshold.
#[test]
fn divergence_threshold_freezes_branch() {
    let config = TimeSpineConfig { divergence_threshold: 0.3, ..TimeSpineConfig::default_test() };
    let mut engine = SpineEngine::build_test_with("divergence-freeze".into(), 42, config).unwrap();
    let id = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();

    engine
        .edit_arena(&id, |arena, _| {
            let doomed: Vec<_> = arena
                .iter()
                .filter(|e| e.kind != KIND_TREASURY)
                .map(|e| e.origin_id)
                .collect();
            for origin_id in doomed {
                arena.remove(origin_id).unwrap();
            }
            arena.set_resource(1, GOLD, 0.0).unwrap();
        })
        .unwrap();

    // Pass 1 advances and scores; pass 2 sees the score and freezes.
    engine.run_ticks(2).unwrap();
    let branch = engine.branch(&id).unwrap();
    assert!(branch.is_frozen());
    assert_eq!(branch.freeze_reason, Some(FreezeReason::DivergenceThreshold));
    assert!(branch.divergence_score() >= 0.3, "divergence {}", branch.divergence_score());
    assert!(branch.divergence_score() <= 1.0);
    assert_eq!(branch.current_tick(), 1);
}

/// GC only destroys frozen branches nothing needs any more.
#[test]
fn gc_prunes_merged_branches_and_keeps_the_rest() {
    let mut engine = SpineEngine::build_test("gc-merged".into(), 42).unwrap();
    let merged = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();
    let kept = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Low).unwrap();
    let active = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();
    engine.run_ticks(3).unwrap();
    engine.freeze_branch(&merged).unwrap();
    engine.freeze_branch(&kept).unwrap();

    engine.request_merge(&BranchMergeRequest::full(&merged, MAIN_BRANCH_ID)).unwrap();
    assert!(engine.registry().contains(&merged), "merged branch lingers until the sweep");

    engine.run_ticks(7).unwrap(); // tick 10: GC
    assert!(engine.registry().get_branch(&merged).is_none());
    assert!(engine.registry().contains(&kept), "frozen but not prune-eligible");
    assert!(engine.registry().contains(&active));
    assert_eq!(engine.store_event_count("branch_pruned").unwrap(), 1);
}

/// Under pressure with auto-prune, frozen Low branches go at the sweep.
#[test]
fn gc_prunes_frozen_low_priority_under_pressure() {
    let config = TimeSpineConfig {
        max_concurrent_branches: 2,
        auto_prune_low_priority: true,
        ..TimeSpineConfig::default_test()
    };
    let mut engine = SpineEngine::build_test_with("gc-pressure".into(), 42, config).unwrap();
    let low = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Low).unwrap();
    let high = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::High).unwrap();
    engine.freeze_branch(&low).unwrap();
    engine.freeze_branch(&high).unwrap();

    engine.run_ticks(10).unwrap();
    assert!(engine.registry().get_branch(&low).is_none());
    assert!(engine.registry().contains(&high));
}

/// Host that fails every speculative step from `fail_from` on.
struct FlakyHost {
    inner:     SandboxSimulation,
    fail_from: Tick,
}

impl HostSimulation for FlakyHost {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn step(
        &mut self,
        branch_id: &str,
        tick: Tick,
        arena: &mut BranchArena,
        origins: &mut OriginAllocator,
        rng: &mut BranchRng,
    ) -> SpineResult<()> {
        if branch_id != MAIN_BRANCH_ID && tick >= self.fail_from {
            return Err(SpineError::validation("host refused to step"));
        }
        self.inner.step(branch_id, tick, arena, origins, rng)
    }

    fn measure(&self, branch_id: &str, arena: &BranchArena) -> AggregateMetrics {
        self.inner.measure(branch_id, arena)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A failing host step freezes that branch only; main keeps going.
#[test]
fn host_failure_freezes_only_the_failing_branch() {
    let run_id = "host-failure";
    let store = SpineStore::in_memory().unwrap();
    store.migrate().unwrap();
    store.insert_run(run_id, 42, "0.1.0-test").unwrap();
    let host = FlakyHost { inner: SandboxSimulation::default(), fail_from: 3 };
    let mut engine =
        SpineEngine::new(run_id.into(), 42, TimeSpineConfig::default_test(), Box::new(host), store);

    let id = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();
    engine.run_ticks(5).unwrap();

    let branch = engine.branch(&id).unwrap();
    assert!(branch.is_frozen());
    assert_eq!(branch.freeze_reason, Some(FreezeReason::HostFailure));
    assert_eq!(branch.current_tick(), 3);
    assert_eq!(engine.main_branch().current_tick(), 5);
    assert_eq!(engine.store_event_count("host_step_failed").unwrap(), 1);
    assert_eq!(engine.host().name(), "flaky");
}
