//! The TimeSpine engine: owns the clock, the branch state, the host
//! simulation and every component, and drives them one tick at a time.
//!
//! EXECUTION ORDER PER TICK (fixed, documented, never reordered):
//!   1. Queued commands, in submission order
//!   2. Lifecycle pass: freeze checks, advance, host step, re-score
//!   3. Scenario completion (and any auto-merge it triggers)
//!   4. GC sweep, on GC ticks only
//!   5. Snapshot persistence, every `snapshot_interval` ticks
//!
//! RULES:
//!   - All branch state lives in one SpineState owned here. Components
//!     are handed `&mut SpineState` and never keep references across calls.
//!   - All randomness flows through the RngBank.
//!   - Every state change is recorded in the event log.
//!   - Direct API calls between ticks act at the current global tick.

use crate::{
    arena::{BranchArena, OriginAllocator},
    branch::{BranchPriority, FreezeReason, TimelineBranch},
    clock::SpineClock,
    command::{CommandOutcome, ComparisonRequest, QueuedCommand, SpineCommand},
    comparator::{BranchComparator, BranchComparison},
    config::TimeSpineConfig,
    error::{SpineError, SpineResult},
    event::{EventLogEntry, SpineEvent},
    host::HostSimulation,
    lifecycle::BranchLifecycleManager,
    merge::{BranchMergeRequest, MergeCoordinator, MergeOutcome},
    modification::WhatIfModification,
    registry::{BranchCreation, TimelineRegistry},
    rng::RngBank,
    sandbox::SandboxSimulation,
    scenario::{ScenarioPoll, WhatIfRequest, WhatIfResult, WhatIfScenarioRunner},
    snapshot::BranchSnapshot,
    state::SpineState,
    store::SpineStore,
    types::{BranchId, RunId, Tick, MAIN_BRANCH_ID},
};
use std::collections::{BTreeMap, VecDeque};

pub struct SpineEngine {
    pub run_id:    RunId,
    pub clock:     SpineClock,
    pub rng_bank:  RngBank,
    pub store:     SpineStore,
    seed:          u64,
    config:        TimeSpineConfig,
    state:         SpineState,
    host:          Box<dyn HostSimulation>,
    lifecycle:     BranchLifecycleManager,
    comparator:    BranchComparator,
    scenarios:     WhatIfScenarioRunner,
    merges:        MergeCoordinator,
    commands:      VecDeque<QueuedCommand>,
    outcomes:      BTreeMap<String, CommandOutcome>,
    run_logged:    bool,
}

impl SpineEngine {
    pub fn new(
        run_id: RunId,
        seed: u64,
        config: TimeSpineConfig,
        host: Box<dyn HostSimulation>,
        store: SpineStore,
    ) -> Self {
        let state = SpineState::new(config.clone(), 0, host.as_ref());
        Self {
            clock:      SpineClock::new(run_id.clone()),
            rng_bank:   RngBank::new(seed),
            store,
            seed,
            lifecycle:  BranchLifecycleManager::new(config.clone()),
            comparator: BranchComparator::new(config.entity_epsilon),
            scenarios:  WhatIfScenarioRunner::new(config.clone()),
            merges:     MergeCoordinator::new(),
            commands:   VecDeque::new(),
            outcomes:   BTreeMap::new(),
            run_logged: false,
            config,
            state,
            host,
            run_id,
        }
    }

    /// Build an engine around the sandbox host with its starting world
    /// seeded into the main timeline. Config is read from `data_dir`.
    pub fn build(run_id: RunId, seed: u64, store: SpineStore, data_dir: &str) -> SpineResult<Self> {
        let config = TimeSpineConfig::load(data_dir)?;
        Self::build_sandbox(run_id, seed, config, store)
    }

    /// Sandbox engine over a caller-supplied config and store.
    pub fn build_sandbox(
        run_id: RunId,
        seed: u64,
        config: TimeSpineConfig,
        store: SpineStore,
    ) -> SpineResult<Self> {
        let sandbox = SandboxSimulation::default();
        let rng_bank = RngBank::new(seed);
        let mut state = SpineState::new(config.clone(), 0, &sandbox);
        {
            let mut rng = rng_bank.for_branch(MAIN_BRANCH_ID, 0);
            let (arena, origins) = state.arena_and_origins(MAIN_BRANCH_ID)?;
            sandbox.seed_world(arena, origins, &mut rng, 0)?;
        }
        state.refresh_snapshot(&sandbox, MAIN_BRANCH_ID)?;

        let mut engine = Self::new(run_id, seed, config, Box::new(sandbox), store);
        engine.state = state;
        Ok(engine)
    }

    /// In-memory engine with test config and the seeded sandbox world.
    pub fn build_test(run_id: RunId, seed: u64) -> SpineResult<Self> {
        Self::build_test_with(run_id, seed, TimeSpineConfig::default_test())
    }

    pub fn build_test_with(run_id: RunId, seed: u64, config: TimeSpineConfig) -> SpineResult<Self> {
        config.validate()?;
        let store = SpineStore::in_memory()?;
        store.migrate()?;
        store.insert_run(&run_id, seed, "0.1.0-test")?;
        Self::build_sandbox(run_id, seed, config, store)
    }

    // ── Tick loop ──────────────────────────────────────────────

    /// Advance one tick. This is the core engine step.
    pub fn tick(&mut self) -> SpineResult<Vec<SpineEvent>> {
        assert!(!self.clock.paused, "tick() called on paused engine");

        let tick = self.clock.advance();
        let mut tick_events = vec![SpineEvent::TickStarted { tick }];

        let events = self.drain_commands(tick)?;
        self.persist(tick, "commands", &events)?;
        tick_events.extend(events);

        let events = self.lifecycle.advance_pass(
            &mut self.state,
            self.host.as_mut(),
            &self.rng_bank,
            tick,
        )?;
        self.persist(tick, "lifecycle", &events)?;
        tick_events.extend(events);

        let events = self.scenarios.complete_ready(
            &mut self.state,
            self.host.as_ref(),
            &self.lifecycle,
            &mut self.merges,
            tick,
        )?;
        for event in &events {
            if let SpineEvent::ScenarioCompleted { branch_id, .. } = event {
                if let Some(result) = self.scenarios.result(branch_id) {
                    self.store.save_what_if_result(&self.run_id, result)?;
                }
            }
        }
        self.persist(tick, "scenarios", &events)?;
        tick_events.extend(events);

        let events = self.lifecycle.gc_sweep(&mut self.state, tick)?;
        self.persist(tick, "gc", &events)?;
        tick_events.extend(events);

        if tick % self.config.snapshot_interval == 0 {
            self.save_snapshots(tick)?;
        }

        tick_events.push(SpineEvent::TickCompleted { tick });
        log::debug!(
            "tick={tick} complete: {} branches live, {} scenarios running",
            self.state.registry.len(),
            self.scenarios.running_count()
        );
        Ok(tick_events)
    }

    /// Run n ticks in a loop. Used for testing and fast-forward.
    pub fn run_ticks(&mut self, n: u64) -> SpineResult<()> {
        self.log_run_initialized()?;
        self.clock.resume();
        for _ in 0..n {
            if let Err(e) = self.tick() {
                self.clock.pause();
                return Err(e);
            }
        }
        self.clock.pause();
        Ok(())
    }

    pub fn current_tick(&self) -> Tick {
        self.clock.current_tick
    }

    // ── Host-facing requests ───────────────────────────────────

    /// Fork `parent_id` into a new speculative branch.
    pub fn create_branch(
        &mut self,
        parent_id: &str,
        branch_point_tick: Tick,
        priority: BranchPriority,
    ) -> SpineResult<BranchId> {
        self.log_run_initialized()?;
        let tick = self.clock.current_tick;
        match self.state.fork_branch(self.host.as_ref(), parent_id, branch_point_tick, priority, tick) {
            Ok(creation) => {
                let events = created_events(&creation, parent_id, branch_point_tick, priority, tick);
                self.persist(tick, "registry", &events)?;
                Ok(creation.branch_id)
            }
            Err(e) => self.rejected("create_branch", e),
        }
    }

    /// Destroy a frozen speculative branch now, outside the GC sweep.
    pub fn destroy_branch(&mut self, branch_id: &str) -> SpineResult<()> {
        let tick = self.clock.current_tick;
        match self.state.destroy_branch(branch_id) {
            Ok(_) => {
                log::info!("tick={tick} destroyed {branch_id} on request");
                let event = SpineEvent::BranchPruned { tick, branch_id: branch_id.to_string() };
                self.persist(tick, "registry", std::slice::from_ref(&event))
            }
            Err(e) => self.rejected("destroy_branch", e),
        }
    }

    /// Freeze a speculative branch. Returns false if it was already frozen.
    pub fn freeze_branch(&mut self, branch_id: &str) -> SpineResult<bool> {
        let tick = self.clock.current_tick;
        match self.lifecycle.freeze(&mut self.state, branch_id, FreezeReason::Explicit, tick) {
            Ok(Some(event)) => {
                self.persist(tick, "lifecycle", std::slice::from_ref(&event))?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => self.rejected("freeze_branch", e),
        }
    }

    /// Start a what-if scenario off the main timeline.
    pub fn submit_scenario(
        &mut self,
        request: WhatIfRequest,
        modifications: &[WhatIfModification],
    ) -> SpineResult<BranchId> {
        self.log_run_initialized()?;
        let tick = self.clock.current_tick;
        let scenario_name = request.scenario_name.clone();
        let start_tick = request.start_tick;
        let priority = self.config.scenario_priority(&scenario_name);

        let submission = match self.scenarios.submit(
            &mut self.state,
            self.host.as_mut(),
            request,
            modifications,
            tick,
        ) {
            Ok(submission) => submission,
            Err(e) => return self.rejected("submit_scenario", e),
        };

        let creation = BranchCreation {
            branch_id: submission.branch_id.clone(),
            evicted:   submission.evicted.clone(),
        };
        let mut events = created_events(&creation, MAIN_BRANCH_ID, start_tick, priority, tick);
        events.extend(submission.failures.iter().map(|failure| SpineEvent::ModificationFailed {
            tick,
            branch_id: submission.branch_id.clone(),
            index:     failure.index,
            op:        failure.op.clone(),
            reason:    failure.reason.clone(),
        }));
        events.push(SpineEvent::ScenarioSubmitted {
            tick,
            branch_id: submission.branch_id.clone(),
            scenario_name,
            modification_count: modifications.len(),
        });
        self.persist(tick, "scenarios", &events)?;
        Ok(submission.branch_id)
    }

    pub fn poll_result(&self, branch_id: &str) -> SpineResult<ScenarioPoll> {
        self.scenarios.poll(branch_id)
    }

    /// Compare two live branches. Read-only apart from the event log.
    pub fn request_comparison(&mut self, request: &ComparisonRequest) -> SpineResult<BranchComparison> {
        let tick = self.clock.current_tick;
        match self.compare(request) {
            Ok(comparison) => {
                let event = SpineEvent::ComparisonCompleted {
                    tick,
                    branch_a:   comparison.branch_a.clone(),
                    branch_b:   comparison.branch_b.clone(),
                    divergence: comparison.divergence,
                };
                self.persist(tick, "comparator", std::slice::from_ref(&event))?;
                Ok(comparison)
            }
            Err(e) => self.rejected("request_comparison", e),
        }
    }

    pub fn request_merge(&mut self, request: &BranchMergeRequest) -> SpineResult<MergeOutcome> {
        let tick = self.clock.current_tick;
        match self.merges.merge_branch(&mut self.state, self.host.as_ref(), request, tick) {
            Ok(outcome) => {
                let event = merged_event(&outcome, tick);
                self.persist(tick, "merge", std::slice::from_ref(&event))?;
                Ok(outcome)
            }
            Err(e) => self.rejected("request_merge", e),
        }
    }

    /// Queue a command for the next tick. Returns its id.
    pub fn submit_command(&mut self, command: SpineCommand) -> SpineResult<String> {
        let command_id = uuid::Uuid::new_v4().to_string();
        if let SpineCommand::Merge(request) = &command {
            // Keep the source out of GC's reach until the merge runs.
            if let Err(e) = self.merges.mark_pending(&mut self.state, request) {
                log::debug!("tick={} merge source not marked: {e}", self.clock.current_tick);
            }
        }
        self.outcomes.insert(command_id.clone(), CommandOutcome::Pending);
        self.commands.push_back(QueuedCommand {
            run_id:     self.run_id.clone(),
            queued_at:  self.clock.current_tick,
            command_id: command_id.clone(),
            command,
        });
        Ok(command_id)
    }

    pub fn command_outcome(&self, command_id: &str) -> Option<&CommandOutcome> {
        self.outcomes.get(command_id)
    }

    /// Edit a branch's world directly, as the host would between ticks.
    /// The branch snapshot is refreshed afterwards.
    pub fn edit_arena<R>(
        &mut self,
        branch_id: &str,
        edit: impl FnOnce(&mut BranchArena, &mut OriginAllocator) -> R,
    ) -> SpineResult<R> {
        let (arena, origins) = self.state.arena_and_origins(branch_id)?;
        let out = edit(arena, origins);
        self.state.refresh_snapshot(self.host.as_ref(), branch_id)?;
        Ok(out)
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn config(&self) -> &TimeSpineConfig {
        &self.config
    }

    pub fn registry(&self) -> &TimelineRegistry {
        &self.state.registry
    }

    pub fn state(&self) -> &SpineState {
        &self.state
    }

    pub fn host(&self) -> &dyn HostSimulation {
        self.host.as_ref()
    }

    pub fn branch(&self, branch_id: &str) -> SpineResult<&TimelineBranch> {
        self.state.branch(branch_id)
    }

    pub fn main_branch(&self) -> &TimelineBranch {
        self.state.registry.main()
    }

    pub fn arena(&self, branch_id: &str) -> SpineResult<&BranchArena> {
        self.state.arena(branch_id)
    }

    pub fn snapshot(&self, branch_id: &str) -> SpineResult<&BranchSnapshot> {
        self.state.snapshot(branch_id)
    }

    pub fn check_invariants(&self) -> SpineResult<()> {
        self.state.check_invariants()
    }

    /// Query events for a specific tick from the store.
    /// Used by the determinism test and replay tooling.
    pub fn store_events_for_tick(&self, run_id: &str, tick: Tick) -> SpineResult<Vec<EventLogEntry>> {
        self.store.events_for_tick(run_id, tick)
    }

    pub fn store_event_count(&self, event_type: &str) -> SpineResult<i64> {
        self.store.event_count(&self.run_id, event_type)
    }

    pub fn store_what_if_result(&self, branch_id: &str) -> SpineResult<Option<WhatIfResult>> {
        self.store.what_if_result(&self.run_id, branch_id)
    }

    // ── Internals ──────────────────────────────────────────────

    fn compare(&self, request: &ComparisonRequest) -> SpineResult<BranchComparison> {
        self.state.compare(
            &self.comparator,
            &self.config.divergence_weights,
            &request.branch_a,
            &request.branch_b,
            request.detailed,
        )
    }

    fn drain_commands(&mut self, tick: Tick) -> SpineResult<Vec<SpineEvent>> {
        let mut events = Vec::new();
        while let Some(queued) = self.commands.pop_front() {
            events.push(SpineEvent::CommandReceived {
                tick,
                command_id:   queued.command_id.clone(),
                command_type: queued.command.type_name().to_string(),
            });
            let result = self.execute_command(&queued.command, tick, &mut events);
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::warn!(
                        "tick={tick} command {} ({}) rejected: {e}",
                        queued.command_id,
                        queued.command.type_name()
                    );
                    events.push(rejection_event(queued.command.type_name(), &e, tick));
                    CommandOutcome::Rejected {
                        kind:        e.kind(),
                        reason_code: e.reason_code().to_string(),
                        message:     e.to_string(),
                    }
                }
            };
            self.outcomes.insert(queued.command_id, outcome);
        }
        Ok(events)
    }

    fn execute_command(
        &mut self,
        command: &SpineCommand,
        tick: Tick,
        events: &mut Vec<SpineEvent>,
    ) -> SpineResult<CommandOutcome> {
        match command {
            SpineCommand::Compare(request) => {
                let comparison = self.compare(request)?;
                events.push(SpineEvent::ComparisonCompleted {
                    tick,
                    branch_a:   comparison.branch_a.clone(),
                    branch_b:   comparison.branch_b.clone(),
                    divergence: comparison.divergence,
                });
                Ok(CommandOutcome::Compared { comparison: Box::new(comparison) })
            }
            SpineCommand::Merge(request) => {
                let outcome = self.merges.merge_branch(&mut self.state, self.host.as_ref(), request, tick)?;
                events.push(merged_event(&outcome, tick));
                Ok(CommandOutcome::Merged { outcome })
            }
            SpineCommand::Destroy { branch_id } => {
                self.state.destroy_branch(branch_id)?;
                events.push(SpineEvent::BranchPruned { tick, branch_id: branch_id.clone() });
                Ok(CommandOutcome::Destroyed { branch_id: branch_id.clone() })
            }
            SpineCommand::Freeze { branch_id } => {
                let event = self.lifecycle.freeze(&mut self.state, branch_id, FreezeReason::Explicit, tick)?;
                events.extend(event);
                Ok(CommandOutcome::Frozen { branch_id: branch_id.clone() })
            }
        }
    }

    fn rejected<T>(&self, request: &str, err: SpineError) -> SpineResult<T> {
        let tick = self.clock.current_tick;
        log::warn!("tick={tick} {request} rejected ({}): {err}", err.reason_code());
        // A storage failure is reported as itself; logging it would fail too.
        if !matches!(err, SpineError::Database(_) | SpineError::Serialization(_)) {
            let event = rejection_event(request, &err, tick);
            self.persist(tick, "engine", std::slice::from_ref(&event))?;
        }
        Err(err)
    }

    fn persist(&self, tick: Tick, component: &str, events: &[SpineEvent]) -> SpineResult<()> {
        for event in events {
            let entry = EventLogEntry {
                id:         None,
                run_id:     self.run_id.clone(),
                tick,
                component:  component.to_string(),
                event_type: event.type_name().to_string(),
                payload:    serde_json::to_string(event)?,
            };
            self.store.append_event(&entry)?;
        }
        Ok(())
    }

    /// Emit RunInitialized once, before anything else is logged.
    fn log_run_initialized(&mut self) -> SpineResult<()> {
        if self.run_logged {
            return Ok(());
        }
        let init_event = SpineEvent::RunInitialized { run_id: self.run_id.clone(), seed: self.seed };
        self.persist(self.clock.current_tick, "engine", std::slice::from_ref(&init_event))?;
        self.run_logged = true;
        Ok(())
    }

    fn save_snapshots(&self, tick: Tick) -> SpineResult<()> {
        for snapshot in self.state.snapshots() {
            self.store.save_branch_snapshot(&self.run_id, tick, snapshot)?;
        }
        log::debug!("tick={tick} saved {} branch snapshots", self.state.registry.len());
        Ok(())
    }
}

fn created_events(
    creation: &BranchCreation,
    parent_id: &str,
    branch_point_tick: Tick,
    priority: BranchPriority,
    tick: Tick,
) -> Vec<SpineEvent> {
    let mut events: Vec<SpineEvent> = creation
        .evicted
        .iter()
        .map(|victim| SpineEvent::BranchEvicted { tick, branch_id: victim.clone() })
        .collect();
    events.push(SpineEvent::BranchCreated {
        tick,
        branch_id: creation.branch_id.clone(),
        parent_id: parent_id.to_string(),
        branch_point_tick,
        priority,
    });
    events
}

fn merged_event(outcome: &MergeOutcome, tick: Tick) -> SpineEvent {
    SpineEvent::MergeCompleted {
        tick,
        source:     outcome.source.clone(),
        target:     outcome.target.clone(),
        full_merge: outcome.full_merge,
        created:    outcome.created,
        updated:    outcome.updated,
        removed:    outcome.removed,
    }
}

fn rejection_event(request: &str, err: &SpineError, tick: Tick) -> SpineEvent {
    SpineEvent::RequestRejected {
        tick,
        request:     request.to_string(),
        kind:        err.kind(),
        reason_code: err.reason_code().to_string(),
        message:     err.to_string(),
    }
}
