//! What-if scenarios: a branch off the main timeline with a list of
//! modifications applied at the fork, run for a fixed number of ticks and
//! scored against its parent.
//!
//! RULES:
//!   - Validation happens before anything is created. A rejected request
//!     leaves no branch behind.
//!   - Modifications apply in list order. One that cannot be applied is
//!     recorded and skipped; it never aborts the scenario.
//!   - Completion is checked after the lifecycle pass: a scenario is done
//!     once its branch is frozen or has run `duration` ticks.
//!   - Results outlive the branch. Polling a pruned scenario still returns
//!     its result.

use crate::{
    branch::FreezeReason,
    comparator::BranchComparator,
    config::TimeSpineConfig,
    divergence::calculate_overall_score,
    error::{SpineError, SpineResult},
    event::SpineEvent,
    host::HostSimulation,
    lifecycle::BranchLifecycleManager,
    merge::{BranchMergeRequest, MergeCoordinator, MergeOutcome},
    modification::{ModificationFailure, SpawnLabels, WhatIfModification},
    snapshot::{AggregateMetrics, MetricDeltas},
    state::SpineState,
    types::{BranchId, Tick, MAIN_BRANCH_ID},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhatIfRequest {
    pub scenario_name:           String,
    pub start_tick:              Tick,
    pub duration:                Tick,
    #[serde(default)]
    pub auto_merge_if_better:    bool,
    #[serde(default)]
    pub preserve_after_complete: bool,
}

impl WhatIfRequest {
    pub fn new(scenario_name: &str, start_tick: Tick, duration: Tick) -> Self {
        Self {
            scenario_name: scenario_name.to_string(),
            start_tick,
            duration,
            auto_merge_if_better: false,
            preserve_after_complete: false,
        }
    }

    fn validate(&self, main_tick: Tick) -> SpineResult<()> {
        if self.scenario_name.trim().is_empty() {
            return Err(SpineError::validation("scenario_name must not be empty"));
        }
        if self.duration == 0 {
            return Err(SpineError::validation("duration must be greater than zero"));
        }
        if self.start_tick != main_tick {
            return Err(SpineError::validation(format!(
                "start_tick {} does not match the main timeline's current tick {main_tick}",
                self.start_tick
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhatIfResult {
    pub branch_id:               BranchId,
    pub scenario_name:           String,
    pub final_metrics:           AggregateMetrics,
    pub baseline_metrics:        AggregateMetrics,
    /// final - baseline
    pub deltas:                  MetricDeltas,
    pub overall_score:           f64,
    pub is_better_than_baseline: bool,
    pub is_complete:             bool,
    pub divergence:              f64,
    /// Branch-local tick the scenario stopped at.
    pub final_tick:              Tick,
    pub completed_at_tick:       Tick,
    pub modification_failures:   Vec<ModificationFailure>,
    /// Set when the result was auto-merged into the parent.
    pub merge:                   Option<MergeOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioPoll {
    Pending,
    Complete(Box<WhatIfResult>),
    /// The branch was destroyed before the scenario finished.
    Abandoned,
}

impl ScenarioPoll {
    pub fn is_complete(&self) -> bool {
        matches!(self, ScenarioPoll::Complete(_))
    }

    pub fn result(&self) -> Option<&WhatIfResult> {
        match self {
            ScenarioPoll::Complete(result) => Some(result),
            _ => None,
        }
    }
}

/// What `submit` did, for the engine to report.
#[derive(Debug, Clone)]
pub struct ScenarioSubmission {
    pub branch_id: BranchId,
    pub evicted:   Vec<BranchId>,
    pub failures:  Vec<ModificationFailure>,
}

#[derive(Debug, Clone)]
struct RunningScenario {
    request:  WhatIfRequest,
    failures: Vec<ModificationFailure>,
}

pub struct WhatIfScenarioRunner {
    config:     TimeSpineConfig,
    comparator: BranchComparator,
    running:    BTreeMap<BranchId, RunningScenario>,
    results:    BTreeMap<BranchId, WhatIfResult>,
    abandoned:  BTreeSet<BranchId>,
}

impl WhatIfScenarioRunner {
    pub fn new(config: TimeSpineConfig) -> Self {
        let comparator = BranchComparator::new(config.entity_epsilon);
        Self {
            config,
            comparator,
            running: BTreeMap::new(),
            results: BTreeMap::new(),
            abandoned: BTreeSet::new(),
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn results(&self) -> impl Iterator<Item = &WhatIfResult> {
        self.results.values()
    }

    pub fn result(&self, branch_id: &str) -> Option<&WhatIfResult> {
        self.results.get(branch_id)
    }

    /// Fork the main timeline and apply the modifications to the new branch.
    pub fn submit(
        &mut self,
        state: &mut SpineState,
        host: &mut dyn HostSimulation,
        request: WhatIfRequest,
        modifications: &[WhatIfModification],
        tick: Tick,
    ) -> SpineResult<ScenarioSubmission> {
        request.validate(state.registry.main().current_tick())?;

        let priority = self.config.scenario_priority(&request.scenario_name);
        let creation = state.fork_branch(&*host, MAIN_BRANCH_ID, request.start_tick, priority, tick)?;
        let branch_id = creation.branch_id;

        let mut failures = Vec::new();
        let mut labels = SpawnLabels::new();
        {
            let (arena, origins) = state.arena_and_origins(&branch_id)?;
            for (index, modification) in modifications.iter().enumerate() {
                if let Err(e) =
                    host.apply_modification(arena, origins, &mut labels, modification, request.start_tick)
                {
                    log::warn!(
                        "tick={tick} {branch_id}: modification {index} ({}) skipped: {e}",
                        modification.op_name()
                    );
                    failures.push(ModificationFailure {
                        index,
                        op:     modification.op_name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        state.refresh_snapshot(&*host, &branch_id)?;

        log::info!(
            "tick={tick} scenario '{}' started on {branch_id} ({} modifications, {} failed)",
            request.scenario_name,
            modifications.len(),
            failures.len()
        );
        self.running.insert(
            branch_id.clone(),
            RunningScenario { request, failures: failures.clone() },
        );
        Ok(ScenarioSubmission { branch_id, evicted: creation.evicted, failures })
    }

    pub fn poll(&self, branch_id: &str) -> SpineResult<ScenarioPoll> {
        if let Some(result) = self.results.get(branch_id) {
            return Ok(ScenarioPoll::Complete(Box::new(result.clone())));
        }
        if self.running.contains_key(branch_id) {
            return Ok(ScenarioPoll::Pending);
        }
        if self.abandoned.contains(branch_id) {
            return Ok(ScenarioPoll::Abandoned);
        }
        Err(SpineError::BranchNotFound { branch_id: branch_id.to_string() })
    }

    /// Finalize every scenario whose branch is frozen or out of time.
    pub fn complete_ready(
        &mut self,
        state: &mut SpineState,
        host: &dyn HostSimulation,
        lifecycle: &BranchLifecycleManager,
        merges: &mut MergeCoordinator,
        tick: Tick,
    ) -> SpineResult<Vec<SpineEvent>> {
        let mut events = Vec::new();
        let ids: Vec<BranchId> = self.running.keys().cloned().collect();

        for branch_id in ids {
            let Some(branch) = state.registry.get_branch(&branch_id) else {
                log::warn!("tick={tick} scenario branch {branch_id} was destroyed before completion");
                self.running.remove(&branch_id);
                self.abandoned.insert(branch_id);
                continue;
            };
            let duration = self.running[&branch_id].request.duration;
            if !branch.is_frozen() && branch.elapsed() < duration {
                continue;
            }

            let Some(running) = self.running.remove(&branch_id) else {
                continue;
            };
            events.extend(lifecycle.freeze(state, &branch_id, FreezeReason::ScenarioComplete, tick)?);
            let (result, mut merge_events) = self.finalize(state, host, merges, &branch_id, running, tick)?;

            events.push(SpineEvent::ScenarioCompleted {
                tick,
                branch_id:               branch_id.clone(),
                scenario_name:           result.scenario_name.clone(),
                overall_score:           result.overall_score,
                is_better_than_baseline: result.is_better_than_baseline,
            });
            events.append(&mut merge_events);
            self.results.insert(branch_id, result);
        }
        Ok(events)
    }

    fn finalize(
        &self,
        state: &mut SpineState,
        host: &dyn HostSimulation,
        merges: &mut MergeCoordinator,
        branch_id: &str,
        running: RunningScenario,
        tick: Tick,
    ) -> SpineResult<(WhatIfResult, Vec<SpineEvent>)> {
        let branch = state.branch(branch_id)?;
        let parent_id = branch.parent_id.clone().unwrap_or_else(|| MAIN_BRANCH_ID.to_string());
        let final_tick = branch.current_tick();

        let comparison = state.compare(
            &self.comparator,
            &self.config.divergence_weights,
            &parent_id,
            branch_id,
            true,
        )?;
        let deltas = comparison.metrics_b.delta_from(&comparison.metrics_a);
        let overall_score = calculate_overall_score(&deltas, &self.config.score_weights);
        let is_better = overall_score > 0.0;

        let mut result = WhatIfResult {
            branch_id:               branch_id.to_string(),
            scenario_name:           running.request.scenario_name.clone(),
            final_metrics:           comparison.metrics_b,
            baseline_metrics:        comparison.metrics_a,
            deltas,
            overall_score,
            is_better_than_baseline: is_better,
            is_complete:             true,
            divergence:              comparison.divergence,
            final_tick,
            completed_at_tick:       tick,
            modification_failures:   running.failures,
            merge:                   None,
        };

        let mut events = Vec::new();
        if running.request.auto_merge_if_better && is_better {
            let request = BranchMergeRequest::full(branch_id, &parent_id);
            match merges.merge_branch(state, host, &request, tick) {
                Ok(outcome) => {
                    events.push(SpineEvent::MergeCompleted {
                        tick,
                        source:     outcome.source.clone(),
                        target:     outcome.target.clone(),
                        full_merge: true,
                        created:    outcome.created,
                        updated:    outcome.updated,
                        removed:    outcome.removed,
                    });
                    result.merge = Some(outcome);
                }
                Err(e) => {
                    log::warn!("tick={tick} auto-merge of {branch_id} into {parent_id} rejected: {e}");
                    if !running.request.preserve_after_complete {
                        state.registry.branch_mut(branch_id)?.prune_eligible = true;
                    }
                    events.push(SpineEvent::RequestRejected {
                        tick,
                        request:     "auto_merge".to_string(),
                        kind:        e.kind(),
                        reason_code: e.reason_code().to_string(),
                        message:     e.to_string(),
                    });
                }
            }
        } else if !running.request.preserve_after_complete {
            state.registry.branch_mut(branch_id)?.prune_eligible = true;
        }

        log::info!(
            "tick={tick} scenario '{}' on {branch_id} complete: score {:.3}, better={is_better}",
            result.scenario_name,
            overall_score
        );
        Ok((result, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arena::Position,
        modification::EntityRef,
        sandbox::{SandboxSimulation, GOLD, KIND_TREASURY},
    };

    /// Main holds a single treasury; a windfall scenario is submitted on it
    /// and frozen so the next completion pass finalizes it.
    fn frozen_windfall(preserve: bool) -> (SpineState, SandboxSimulation, WhatIfScenarioRunner, BranchId) {
        let mut host = SandboxSimulation::default();
        let config = TimeSpineConfig::default_test();
        let mut state = SpineState::new(config.clone(), 0, &host);
        let (main, origins) = state.arena_and_origins(MAIN_BRANCH_ID).unwrap();
        let treasury = main.spawn(origins, KIND_TREASURY, Position::default(), 0);
        main.set_resource(treasury, GOLD, 1_000.0).unwrap();
        state.refresh_snapshot(&host, MAIN_BRANCH_ID).unwrap();

        let mut runner = WhatIfScenarioRunner::new(config);
        let mut request = WhatIfRequest::new("windfall", 0, 20);
        request.auto_merge_if_better = true;
        request.preserve_after_complete = preserve;
        let modifications = [WhatIfModification::set_resource(EntityRef::Origin(treasury), GOLD, 50_000.0)];
        let branch_id = runner.submit(&mut state, &mut host, request, &modifications, 0).unwrap().branch_id;
        state.registry.branch_mut(&branch_id).unwrap().freeze(FreezeReason::Explicit).unwrap();
        (state, host, runner, branch_id)
    }

    /// The merge target is busy, so the auto-merge is refused. The branch is
    /// still released for GC unless the request asked to keep it.
    #[test]
    fn refused_auto_merge_still_releases_the_branch() {
        let (mut state, host, mut runner, branch_id) = frozen_windfall(false);
        let lifecycle = BranchLifecycleManager::new(TimeSpineConfig::default_test());
        let mut merges = MergeCoordinator::new();
        merges.hold_target(MAIN_BRANCH_ID);

        let events = runner.complete_ready(&mut state, &host, &lifecycle, &mut merges, 1).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            SpineEvent::RequestRejected { request, reason_code, .. }
                if request == "auto_merge" && reason_code == "merge_in_flight"
        )));

        let result = runner.result(&branch_id).unwrap();
        assert!(result.is_better_than_baseline);
        assert!(result.merge.is_none());
        let branch = state.branch(&branch_id).unwrap();
        assert!(!branch.merged);
        assert!(branch.prune_eligible);
    }

    #[test]
    fn refused_auto_merge_keeps_a_preserved_branch() {
        let (mut state, host, mut runner, branch_id) = frozen_windfall(true);
        let lifecycle = BranchLifecycleManager::new(TimeSpineConfig::default_test());
        let mut merges = MergeCoordinator::new();
        merges.hold_target(MAIN_BRANCH_ID);

        runner.complete_ready(&mut state, &host, &lifecycle, &mut merges, 1).unwrap();
        assert!(runner.result(&branch_id).unwrap().merge.is_none());
        assert!(!state.branch(&branch_id).unwrap().prune_eligible);
    }
}
