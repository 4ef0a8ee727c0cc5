//! The boundary to the host simulation.
//!
//! RULE: The engine never computes world metrics or entity behaviour
//! itself. Everything that happens *inside* a branch's world goes
//! through this trait; the engine only decides which branch advances,
//! when it stops, and how branches are compared and merged.

use crate::{
    arena::{BranchArena, OriginAllocator},
    error::SpineResult,
    modification::{apply_to_arena, SpawnLabels, WhatIfModification},
    rng::BranchRng,
    snapshot::AggregateMetrics,
    types::{OriginId, Tick},
};
use std::any::Any;

/// The contract every host simulation must fulfill.
pub trait HostSimulation: Send {
    /// Unique stable name, recorded in the event log.
    fn name(&self) -> &'static str;

    /// Advance one branch's world by one tick.
    ///
    /// - `branch_id`: the branch being stepped
    /// - `tick`:      the branch-local tick just reached
    /// - `arena`:     this branch's entities, exclusively borrowed
    /// - `origins`:   allocator for spawns with no natural parent; births
    ///                that should line up across forks use
    ///                `BranchArena::spawn_derived` instead
    /// - `rng`:       this branch's deterministic RNG for this tick
    fn step(
        &mut self,
        branch_id: &str,
        tick: Tick,
        arena: &mut BranchArena,
        origins: &mut OriginAllocator,
        rng: &mut BranchRng,
    ) -> SpineResult<()>;

    /// Aggregate figures for a branch's current state. Must be pure.
    fn measure(&self, branch_id: &str, arena: &BranchArena) -> AggregateMetrics;

    /// Produce an isolated copy of `parent` for a new branch.
    fn fork_arena(&self, parent: &BranchArena, branch_id: &str, tick: Tick) -> BranchArena {
        parent.fork(branch_id, tick)
    }

    /// Apply one what-if modification to a branch's arena.
    fn apply_modification(
        &mut self,
        arena: &mut BranchArena,
        origins: &mut OriginAllocator,
        labels: &mut SpawnLabels,
        modification: &WhatIfModification,
        tick: Tick,
    ) -> SpineResult<Option<OriginId>> {
        apply_to_arena(arena, origins, labels, modification, tick)
    }

    /// For downcasting in tests and tooling only.
    fn as_any(&self) -> &dyn Any;
}
