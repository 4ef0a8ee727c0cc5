//! Branch lifecycle: the per-tick policy pass.
//!
//! STATE MACHINE (per branch):
//!   Active --(divergence >= threshold | elapsed > max duration)--> Frozen
//!   Frozen --(GC sweep, eligible)--> Pruned
//!   Active/Frozen --(merge coordinator)--> Merged --(GC sweep)--> Pruned
//!
//! PASS ORDER (fixed):
//!   1. Schedulable branches in descending priority, ties by id.
//!      Each speculative branch first has its freeze conditions checked;
//!      if it survives, it advances one tick and the host steps it.
//!   2. Divergence of every branch that advanced is re-scored against
//!      its parent's fresh snapshot.
//!
//! The GC sweep is a separate call so the scenario runner can finalize
//! freshly frozen branches before anything is destroyed.

use crate::{
    branch::{BranchPriority, FreezeReason, TimelineBranch},
    comparator::BranchComparator,
    config::TimeSpineConfig,
    error::SpineResult,
    event::SpineEvent,
    host::HostSimulation,
    rng::RngBank,
    state::SpineState,
    types::{BranchId, Tick},
};

pub struct BranchLifecycleManager {
    config:     TimeSpineConfig,
    comparator: BranchComparator,
}

impl BranchLifecycleManager {
    pub fn new(config: TimeSpineConfig) -> Self {
        let comparator = BranchComparator::new(config.entity_epsilon);
        Self { config, comparator }
    }

    /// The freeze condition for a branch as it stands now, if any.
    pub fn freeze_condition(&self, branch: &TimelineBranch) -> Option<FreezeReason> {
        if branch.is_main_timeline || branch.is_frozen() {
            return None;
        }
        if branch.divergence_score() >= self.config.divergence_threshold {
            Some(FreezeReason::DivergenceThreshold)
        } else if branch.elapsed() > self.config.max_branch_duration {
            Some(FreezeReason::DurationExceeded)
        } else {
            None
        }
    }

    /// Freeze a branch and report it. No-op for an already frozen branch.
    pub fn freeze(
        &self,
        state: &mut SpineState,
        branch_id: &str,
        reason: FreezeReason,
        tick: Tick,
    ) -> SpineResult<Option<SpineEvent>> {
        let branch = state.registry.branch_mut(branch_id)?;
        if !branch.freeze(reason)? {
            return Ok(None);
        }
        log::info!(
            "tick={tick} froze {branch_id} at branch tick {} ({reason:?}, divergence {:.3})",
            branch.current_tick(),
            branch.divergence_score()
        );
        Ok(Some(SpineEvent::BranchFrozen {
            tick,
            branch_id:   branch_id.to_string(),
            reason,
            branch_tick: branch.current_tick(),
            divergence:  branch.divergence_score(),
        }))
    }

    /// One global advance pass.
    pub fn advance_pass(
        &self,
        state: &mut SpineState,
        host: &mut dyn HostSimulation,
        rng_bank: &RngBank,
        tick: Tick,
    ) -> SpineResult<Vec<SpineEvent>> {
        let mut events = Vec::new();
        let mut advanced: Vec<BranchId> = Vec::new();

        for branch_id in state.registry.schedule_order() {
            let branch = state.registry.branch(&branch_id)?;
            let is_main = branch.is_main_timeline;
            if let Some(reason) = self.freeze_condition(branch) {
                events.extend(self.freeze(state, &branch_id, reason, tick)?);
                continue;
            }

            let branch = state.registry.branch_mut(&branch_id)?;
            if !branch.advance() {
                continue;
            }
            let branch_tick = branch.current_tick();

            let mut rng = rng_bank.for_branch(&branch_id, branch_tick);
            let (arena, origins) = state.arena_and_origins(&branch_id)?;
            match host.step(&branch_id, branch_tick, arena, origins, &mut rng) {
                Ok(()) => {}
                // The main timeline's failure is the host's failure; surface it.
                Err(e) if is_main => return Err(e),
                Err(e) => {
                    log::warn!("tick={tick} host step failed on {branch_id}: {e}");
                    events.push(SpineEvent::HostStepFailed {
                        tick,
                        branch_id: branch_id.clone(),
                        reason:    e.to_string(),
                    });
                    events.extend(self.freeze(state, &branch_id, FreezeReason::HostFailure, tick)?);
                }
            }
            state.refresh_snapshot(host, &branch_id)?;
            advanced.push(branch_id);
        }

        for branch_id in &advanced {
            self.rescore(state, branch_id)?;
        }

        log::debug!("tick={tick} lifecycle pass advanced {} branches", advanced.len());
        Ok(events)
    }

    /// Recompute a branch's divergence against its parent, if the parent is live.
    pub fn rescore(&self, state: &mut SpineState, branch_id: &str) -> SpineResult<()> {
        let branch = state.registry.branch(branch_id)?;
        let Some(parent_id) = branch.parent_id.clone() else {
            return Ok(());
        };
        if !state.registry.contains(&parent_id) {
            return Ok(());
        }
        let comparison = state.compare(
            &self.comparator,
            &self.config.divergence_weights,
            &parent_id,
            branch_id,
            true,
        )?;
        state.registry.branch_mut(branch_id)?.set_divergence(comparison.divergence);
        Ok(())
    }

    pub fn is_gc_tick(&self, tick: Tick) -> bool {
        tick > 0 && tick % self.config.branch_gc_interval == 0
    }

    /// Whether the GC sweep may destroy this branch right now.
    pub fn prune_eligible(&self, branch: &TimelineBranch, under_pressure: bool) -> bool {
        if branch.is_main_timeline || !branch.is_frozen() || branch.is_marked_for_merge {
            return false;
        }
        if branch.prune_eligible || branch.merged {
            return true;
        }
        under_pressure && branch.priority == BranchPriority::Low
    }

    /// Destroy every eligible branch. Only runs on GC ticks.
    pub fn gc_sweep(&self, state: &mut SpineState, tick: Tick) -> SpineResult<Vec<SpineEvent>> {
        if !self.is_gc_tick(tick) {
            return Ok(Vec::new());
        }
        let under_pressure = self.config.auto_prune_low_priority
            && state.registry.speculative_count() >= self.config.max_concurrent_branches;

        let victims: Vec<BranchId> = state
            .registry
            .branches()
            .filter(|b| self.prune_eligible(b, under_pressure))
            .map(|b| b.id.clone())
            .collect();

        let mut events = Vec::with_capacity(victims.len());
        for branch_id in victims {
            state.destroy_branch(&branch_id)?;
            log::info!("tick={tick} pruned {branch_id}");
            events.push(SpineEvent::BranchPruned { tick, branch_id });
        }
        Ok(events)
    }
}
