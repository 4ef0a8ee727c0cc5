//! Sandbox settlement: the reference host simulation.
//!
//! A deliberately small world used by the runner binary and the tests:
//!   - one or more `treasury` entities hold `gold` and `food`
//!   - `citizen` entities carry `happiness` in [0, 1]
//!   - `soldier` entities carry `strength`
//!
//! Each tick, citizens pay tax and eat, soldiers draw upkeep, happiness
//! drifts with the treasury's health, and the treasury may spawn a new
//! citizen. Every draw comes from the per-entity BranchRng stream, so
//! an untouched fork replays its parent exactly.
//!
//! Metrics: population = citizen count, resources = gold + food across
//! all entities, happiness = mean citizen happiness, military = total
//! soldier strength.

use crate::{
    arena::{BranchArena, OriginAllocator, Position},
    error::SpineResult,
    host::HostSimulation,
    rng::BranchRng,
    snapshot::AggregateMetrics,
    types::Tick,
};
use serde::{Deserialize, Serialize};

pub const KIND_TREASURY: &str = "treasury";
pub const KIND_CITIZEN: &str = "citizen";
pub const KIND_SOLDIER: &str = "soldier";

pub const GOLD: &str = "gold";
pub const FOOD: &str = "food";
pub const HAPPINESS: &str = "happiness";
pub const STRENGTH: &str = "strength";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    pub initial_citizens:  usize,
    pub initial_soldiers:  usize,
    pub initial_gold:      f64,
    pub initial_food:      f64,
    pub tax_per_citizen:   f64,
    pub food_per_citizen:  f64,
    pub harvest_per_citizen: f64,
    pub soldier_upkeep:    f64,
    /// Per-tick probability that each treasury spawns a citizen.
    pub birth_chance:      f64,
    /// Max absolute random happiness change per tick.
    pub happiness_drift:   f64,
    /// Gold per citizen above which happiness trends up.
    pub prosperity_line:   f64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            initial_citizens:    20,
            initial_soldiers:    4,
            initial_gold:        1_000.0,
            initial_food:        200.0,
            tax_per_citizen:     0.5,
            food_per_citizen:    0.10,
            harvest_per_citizen: 0.12,
            soldier_upkeep:      0.75,
            birth_chance:        0.02,
            happiness_drift:     0.02,
            prosperity_line:     25.0,
        }
    }
}

pub struct SandboxSimulation {
    pub settings: SandboxSettings,
}

impl SandboxSimulation {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }

    /// Populate a fresh arena (normally the main timeline) with the
    /// starting settlement.
    pub fn seed_world(
        &self,
        arena: &mut BranchArena,
        origins: &mut OriginAllocator,
        rng: &mut BranchRng,
        tick: Tick,
    ) -> SpineResult<()> {
        let s = &self.settings;
        let treasury = arena.spawn(origins, KIND_TREASURY, Position::default(), tick);
        arena.set_resource(treasury, GOLD, s.initial_gold)?;
        arena.set_resource(treasury, FOOD, s.initial_food)?;

        for _ in 0..s.initial_citizens {
            let position = Position { x: rng.range_f64(-50.0, 50.0), y: rng.range_f64(-50.0, 50.0) };
            let citizen = arena.spawn(origins, KIND_CITIZEN, position, tick);
            arena.set_resource(citizen, HAPPINESS, rng.range_f64(0.4, 0.8))?;
        }
        for _ in 0..s.initial_soldiers {
            let position = Position { x: rng.range_f64(-10.0, 10.0), y: rng.range_f64(-10.0, 10.0) };
            let soldier = arena.spawn(origins, KIND_SOLDIER, position, tick);
            arena.set_resource(soldier, STRENGTH, 5.0)?;
        }
        log::debug!(
            "tick={tick} sandbox seeded {}: {} citizens, {} soldiers",
            arena.branch_id, s.initial_citizens, s.initial_soldiers
        );
        Ok(())
    }
}

impl Default for SandboxSimulation {
    fn default() -> Self {
        Self::new(SandboxSettings::default())
    }
}

impl HostSimulation for SandboxSimulation {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn step(
        &mut self,
        branch_id: &str,
        tick: Tick,
        arena: &mut BranchArena,
        _origins: &mut OriginAllocator,
        rng: &mut BranchRng,
    ) -> SpineResult<()> {
        let s = &self.settings;

        // Read phase: headcounts and treasury health from last tick's state.
        let citizens = arena.iter().filter(|e| e.kind == KIND_CITIZEN).count() as f64;
        let soldiers = arena.iter().filter(|e| e.kind == KIND_SOLDIER).count() as f64;
        let treasuries = arena.iter().filter(|e| e.kind == KIND_TREASURY).count().max(1) as f64;
        let gold: f64 = arena.iter().map(|e| e.resource(GOLD)).sum();
        let prosperous = citizens > 0.0 && gold / citizens >= s.prosperity_line;

        // Write phase, in origin-id order.
        let mut births = Vec::new();
        for entity in arena.iter_mut() {
            let mut local = rng.for_entity(entity.origin_id);
            match entity.kind.as_str() {
                KIND_TREASURY => {
                    let income = (citizens * s.tax_per_citizen - soldiers * s.soldier_upkeep) / treasuries;
                    let harvest = citizens * (s.harvest_per_citizen - s.food_per_citizen) / treasuries;
                    let gold = (entity.resource(GOLD) + income).max(0.0);
                    let food = (entity.resource(FOOD) + harvest).max(0.0);
                    entity.resources.insert(GOLD.to_string(), gold);
                    entity.resources.insert(FOOD.to_string(), food);
                    if local.chance(s.birth_chance) {
                        births.push((entity.origin_id, entity.position));
                    }
                }
                KIND_CITIZEN => {
                    let trend = if prosperous { 0.005 } else { -0.005 };
                    let drift = local.range_f64(-s.happiness_drift, s.happiness_drift);
                    let happiness = (entity.resource(HAPPINESS) + trend + drift).clamp(0.0, 1.0);
                    entity.resources.insert(HAPPINESS.to_string(), happiness);
                }
                KIND_SOLDIER => {
                    let strength = (entity.resource(STRENGTH) + local.range_f64(-0.1, 0.15)).max(0.0);
                    entity.resources.insert(STRENGTH.to_string(), strength);
                }
                _ => {}
            }
        }

        // Births take ids derived from the treasury and tick, so a fork
        // stepping in lock-step with its parent grows the same citizens.
        for (parent, position) in births {
            let citizen = arena.spawn_derived(parent, 0, KIND_CITIZEN, position, tick);
            arena.set_resource(citizen, HAPPINESS, 0.5)?;
        }

        log::trace!("tick={tick} sandbox stepped {branch_id}: {} entities", arena.len());
        Ok(())
    }

    fn measure(&self, _branch_id: &str, arena: &BranchArena) -> AggregateMetrics {
        let mut metrics = AggregateMetrics::default();
        let mut happiness_total = 0.0;
        for entity in arena.iter() {
            metrics.resources += entity.resource(GOLD) + entity.resource(FOOD);
            match entity.kind.as_str() {
                KIND_CITIZEN => {
                    metrics.population += 1.0;
                    happiness_total += entity.resource(HAPPINESS);
                }
                KIND_SOLDIER => metrics.military += entity.resource(STRENGTH),
                _ => {}
            }
        }
        if metrics.population > 0.0 {
            metrics.happiness = happiness_total / metrics.population;
        }
        metrics
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
