//! SpineState: the registry plus everything keyed by branch id.
//!
//! Components never own branch data. They receive `&mut SpineState`
//! (or `&SpineState` for reads) from the engine. Arenas and snapshots
//! live and die with their registry record: every path that creates or
//! destroys a branch goes through here so the three maps stay in step.

use crate::{
    arena::{BranchArena, OriginAllocator},
    branch::{BranchPriority, TimelineBranch},
    comparator::{BranchComparator, BranchComparison, BranchView},
    config::{DivergenceWeights, TimeSpineConfig},
    divergence::calculate_divergence,
    error::{SpineError, SpineResult},
    host::HostSimulation,
    registry::{BranchCreation, TimelineRegistry},
    snapshot::BranchSnapshot,
    types::{BranchId, Tick, MAIN_BRANCH_ID},
};
use std::collections::BTreeMap;

pub struct SpineState {
    pub registry: TimelineRegistry,
    pub origins:  OriginAllocator,
    arenas:       BTreeMap<BranchId, BranchArena>,
    snapshots:    BTreeMap<BranchId, BranchSnapshot>,
}

impl SpineState {
    pub fn new(config: TimeSpineConfig, tick: Tick, host: &dyn HostSimulation) -> Self {
        let main_arena = BranchArena::new(MAIN_BRANCH_ID.to_string(), tick);
        let main_snapshot =
            BranchSnapshot::capture(&main_arena, tick, host.measure(MAIN_BRANCH_ID, &main_arena));
        Self {
            registry:  TimelineRegistry::new(config, tick),
            origins:   OriginAllocator::new(),
            arenas:    BTreeMap::from([(MAIN_BRANCH_ID.to_string(), main_arena)]),
            snapshots: BTreeMap::from([(MAIN_BRANCH_ID.to_string(), main_snapshot)]),
        }
    }

    pub fn branch(&self, branch_id: &str) -> SpineResult<&TimelineBranch> {
        self.registry.branch(branch_id)
    }

    pub fn arena(&self, branch_id: &str) -> SpineResult<&BranchArena> {
        self.arenas.get(branch_id).ok_or_else(|| SpineError::BranchNotFound {
            branch_id: branch_id.to_string(),
        })
    }

    pub fn arena_mut(&mut self, branch_id: &str) -> SpineResult<&mut BranchArena> {
        self.arenas.get_mut(branch_id).ok_or_else(|| SpineError::BranchNotFound {
            branch_id: branch_id.to_string(),
        })
    }

    /// Arena and origin allocator together, for host calls that spawn.
    pub fn arena_and_origins(
        &mut self,
        branch_id: &str,
    ) -> SpineResult<(&mut BranchArena, &mut OriginAllocator)> {
        let arena = self.arenas.get_mut(branch_id).ok_or_else(|| SpineError::BranchNotFound {
            branch_id: branch_id.to_string(),
        })?;
        Ok((arena, &mut self.origins))
    }

    pub fn snapshot(&self, branch_id: &str) -> SpineResult<&BranchSnapshot> {
        self.snapshots.get(branch_id).ok_or_else(|| SpineError::BranchNotFound {
            branch_id: branch_id.to_string(),
        })
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &BranchSnapshot> {
        self.snapshots.values()
    }

    pub fn view(&self, branch_id: &str) -> SpineResult<BranchView<'_>> {
        Ok(BranchView {
            snapshot: self.snapshot(branch_id)?,
            entities: self.arena(branch_id)?.entities(),
        })
    }

    /// Re-measure a branch and replace its snapshot.
    pub fn refresh_snapshot(&mut self, host: &dyn HostSimulation, branch_id: &str) -> SpineResult<()> {
        let tick = self.registry.branch(branch_id)?.current_tick();
        let arena = self.arena(branch_id)?;
        let snapshot = BranchSnapshot::capture(arena, tick, host.measure(branch_id, arena));
        self.snapshots.insert(branch_id.to_string(), snapshot);
        Ok(())
    }

    /// Register a branch under `parent_id` and fork the parent's arena into it.
    pub fn fork_branch(
        &mut self,
        host: &dyn HostSimulation,
        parent_id: &str,
        branch_point_tick: Tick,
        priority: BranchPriority,
        now: Tick,
    ) -> SpineResult<BranchCreation> {
        // Fail before the registry is touched if the parent has no arena.
        self.arena(parent_id)?;

        let watermark = self.origins.peek();
        let creation =
            self.registry.create_branch(parent_id, branch_point_tick, priority, watermark, now)?;
        for victim in &creation.evicted {
            self.arenas.remove(victim);
            self.snapshots.remove(victim);
        }

        let forked = host.fork_arena(self.arena(parent_id)?, &creation.branch_id, branch_point_tick);
        self.arenas.insert(creation.branch_id.clone(), forked);
        self.refresh_snapshot(host, &creation.branch_id)?;
        Ok(creation)
    }

    pub fn destroy_branch(&mut self, branch_id: &str) -> SpineResult<TimelineBranch> {
        let removed = self.registry.destroy_branch(branch_id)?;
        self.arenas.remove(branch_id);
        self.snapshots.remove(branch_id);
        Ok(removed)
    }

    /// Compare two live branches and attach their divergence score.
    pub fn compare(
        &self,
        comparator: &BranchComparator,
        weights: &DivergenceWeights,
        branch_a: &str,
        branch_b: &str,
        detailed: bool,
    ) -> SpineResult<BranchComparison> {
        let a = self.view(branch_a)?;
        let b = self.view(branch_b)?;
        let mut comparison = comparator.compare(&a, &b, detailed);
        comparison.divergence = calculate_divergence(&comparison, weights);
        Ok(comparison)
    }

    pub fn check_invariants(&self) -> SpineResult<()> {
        self.registry.check_invariants()?;
        for branch in self.registry.branches() {
            if !self.arenas.contains_key(&branch.id) || !self.snapshots.contains_key(&branch.id) {
                return Err(anyhow::anyhow!("branch {} has no arena or snapshot", branch.id).into());
            }
        }
        if self.arenas.len() != self.registry.len() {
            return Err(anyhow::anyhow!("orphaned arenas left behind").into());
        }
        Ok(())
    }
}
