//! Timeline registry tests: branch creation, limits, ids and teardown.

use timespine_core::{
    branch::BranchPriority,
    command::ComparisonRequest,
    config::TimeSpineConfig,
    engine::SpineEngine,
    error::{ErrorKind, SpineError},
    types::MAIN_BRANCH_ID,
};

fn engine_with(run_id: &str, config: TimeSpineConfig) -> SpineEngine {
    SpineEngine::build_test_with(run_id.into(), 42, config).unwrap()
}

fn limited(max: usize, auto_prune: bool) -> TimeSpineConfig {
    TimeSpineConfig {
        max_concurrent_branches: max,
        auto_prune_low_priority: auto_prune,
        ..TimeSpineConfig::default_test()
    }
}

/// Exactly one main timeline exists and it refuses every terminal operation.
#[test]
fn main_timeline_is_unique_and_protected() {
    let mut engine = SpineEngine::build_test("main-protected".into(), 42).unwrap();

    let mains = engine.registry().branches().filter(|b| b.is_main_timeline).count();
    assert_eq!(mains, 1);

    let err = engine.destroy_branch(MAIN_BRANCH_ID).unwrap_err();
    assert!(matches!(err, SpineError::MainTimelineProtected { .. }), "got {err:?}");
    assert_eq!(err.kind(), ErrorKind::PolicyViolation);

    let err = engine.freeze_branch(MAIN_BRANCH_ID).unwrap_err();
    assert!(matches!(err, SpineError::MainTimelineProtected { .. }), "got {err:?}");

    engine.run_ticks(5).unwrap();
    let main = engine.main_branch();
    assert!(!main.is_frozen());
    assert!(main.is_active);
    engine.check_invariants().unwrap();
}

/// MaxConcurrentBranches=2 without auto-prune: the third create fails.
#[test]
fn third_branch_fails_at_limit_of_two() {
    let mut engine = engine_with("limit-two", limited(2, false));

    engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();
    engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();
    let err = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap_err();

    assert!(
        matches!(err, SpineError::BranchLimitExceeded { limit: 2, eviction_attempted: false }),
        "got {err:?}"
    );
    assert_eq!(err.kind(), ErrorKind::PolicyViolation);
    assert_eq!(engine.registry().speculative_count(), 2);
    assert_eq!(engine.store_event_count("request_rejected").unwrap(), 1);
}

/// With auto-prune on, a frozen Low-priority branch is evicted to make room.
#[test]
fn auto_prune_evicts_frozen_low_priority_branch() {
    let mut engine = engine_with("auto-prune-evict", limited(2, true));

    let low = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Low).unwrap();
    let normal = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();
    engine.freeze_branch(&low).unwrap();

    let third = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();

    assert!(engine.registry().get_branch(&low).is_none());
    assert!(engine.registry().contains(&normal));
    assert!(engine.registry().contains(&third));
    assert!(engine.arena(&low).is_err());
    assert_eq!(engine.store_event_count("branch_evicted").unwrap(), 1);
    engine.check_invariants().unwrap();
}

/// Auto-prune never evicts active or higher-priority branches.
#[test]
fn auto_prune_without_candidate_is_resource_exhaustion() {
    let mut engine = engine_with("auto-prune-none", limited(1, true));

    let only = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Low).unwrap();
    let err = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::High).unwrap_err();

    assert!(
        matches!(err, SpineError::BranchLimitExceeded { limit: 1, eviction_attempted: true }),
        "got {err:?}"
    );
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    assert!(engine.registry().contains(&only), "active branch must survive");
}

#[test]
fn nested_branches_follow_config() {
    let mut engine = SpineEngine::build_test("nested-off".into(), 42).unwrap();
    let child = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();
    let err = engine.create_branch(&child, 0, BranchPriority::Normal).unwrap_err();
    assert!(matches!(err, SpineError::NestedBranchNotAllowed { .. }), "got {err:?}");
    assert_eq!(err.reason_code(), "nested_branch_not_allowed");

    let config = TimeSpineConfig { allow_nested_branches: true, ..TimeSpineConfig::default_test() };
    let mut engine = engine_with("nested-on", config);
    let child = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();
    let grandchild = engine.create_branch(&child, 0, BranchPriority::Normal).unwrap();

    let registry = engine.registry();
    assert_eq!(registry.lineage(&grandchild), vec![child.clone(), MAIN_BRANCH_ID.to_string()]);
    assert_eq!(registry.children(&child), vec![grandchild.clone()]);
    assert!(registry.is_descendant(&grandchild, MAIN_BRANCH_ID));
    assert!(!registry.is_descendant(&child, &grandchild));
}

/// Same config, same calls: same ids. Ids never repeat, even after destroy.
#[test]
fn branch_ids_are_deterministic_and_never_reused() {
    let ids = |run_id: &str| {
        let mut engine = SpineEngine::build_test(run_id.into(), 42).unwrap();
        (0..3)
            .map(|_| engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap())
            .collect::<Vec<_>>()
    };
    let a = ids("ids-a");
    let b = ids("ids-b");
    assert_eq!(a, b);
    assert!(a.iter().all(|id| id.starts_with("branch_0_")), "ids: {a:?}");
    assert!(a[0] != a[1] && a[1] != a[2] && a[0] != a[2], "ids collided: {a:?}");

    let mut engine = SpineEngine::build_test("ids-reuse".into(), 42).unwrap();
    let first = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();
    engine.freeze_branch(&first).unwrap();
    engine.destroy_branch(&first).unwrap();
    let second = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();
    assert_ne!(first, second);
}

#[test]
fn destroy_requires_a_frozen_branch() {
    let mut engine = SpineEngine::build_test("destroy-frozen".into(), 42).unwrap();
    let branch = engine.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal).unwrap();

    let err = engine.destroy_branch(&branch).unwrap_err();
    assert!(matches!(err, SpineError::BranchNotFrozen { .. }), "got {err:?}");

    assert!(engine.freeze_branch(&branch).unwrap());
    assert!(!engine.freeze_branch(&branch).unwrap(), "second freeze is a no-op");
    engine.destroy_branch(&branch).unwrap();
    assert!(engine.registry().get_branch(&branch).is_none());

    let err = engine.destroy_branch(&branch).unwrap_err();
    assert!(matches!(err, SpineError::BranchNotFound { .. }), "got {err:?}");
    assert_eq!(err.kind(), ErrorKind::Validation);
    engine.check_invariants().unwrap();
}

#[test]
fn unknown_parent_is_rejected_without_side_effects() {
    let mut engine = SpineEngine::build_test("unknown-parent".into(), 42).unwrap();
    let err = engine.create_branch("branch_nope", 0, BranchPriority::Normal).unwrap_err();
    assert!(matches!(err, SpineError::BranchNotFound { .. }), "got {err:?}");
    assert_eq!(engine.registry().len(), 1);
}

/// A fork must start where its parent stands: neither in its past nor its future.
#[test]
fn fork_point_must_equal_parent_tick() {
    let mut engine = SpineEngine::build_test("registry-fork-point".into(), 42).unwrap();
    engine.run_ticks(50).unwrap();

    for tick in [0, 49, 51, 10_000] {
        let err = engine.create_branch(MAIN_BRANCH_ID, tick, BranchPriority::Normal).unwrap_err();
        assert!(matches!(err, SpineError::Validation { .. }), "tick {tick}: got {err:?}");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    assert_eq!(engine.registry().speculative_count(), 0);

    let id = engine.create_branch(MAIN_BRANCH_ID, 50, BranchPriority::Normal).unwrap();
    engine.run_ticks(5).unwrap();
    let comparison = engine
        .request_comparison(&ComparisonRequest::new(MAIN_BRANCH_ID, &id, true))
        .unwrap();
    assert_eq!(comparison.divergence, 0.0);
}
