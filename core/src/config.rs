use crate::{branch::BranchPriority, types::Tick};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Weights applied to the normalized per-metric differences when scoring
/// divergence. Expected to be non-negative and to sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DivergenceWeights {
    pub resource:   f64,
    pub population: f64,
    pub military:   f64,
    pub happiness:  f64,
}

impl Default for DivergenceWeights {
    fn default() -> Self {
        Self { resource: 0.25, population: 0.25, military: 0.25, happiness: 0.25 }
    }
}

impl DivergenceWeights {
    pub fn total(&self) -> f64 {
        self.resource + self.population + self.military + self.happiness
    }
}

/// Weights for the unbounded what-if ranking score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreWeights {
    pub resources:  f64,
    pub population: f64,
    pub happiness:  f64,
    pub military:   f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self { resources: 0.01, population: 1.0, happiness: 2.0, military: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSpineConfig {
    /// Speculative branches allowed at once. The main timeline is not counted.
    pub max_concurrent_branches: usize,
    /// Ticks a branch may run past its branch point before it is frozen.
    pub max_branch_duration: Tick,
    /// GC sweep period in global ticks.
    pub branch_gc_interval: Tick,
    /// Divergence score at which a branch is frozen.
    pub divergence_threshold: f64,
    pub allow_nested_branches: bool,
    pub auto_prune_low_priority: bool,

    #[serde(default)]
    pub divergence_weights: DivergenceWeights,
    #[serde(default)]
    pub score_weights: ScoreWeights,
    /// Absolute tolerance for per-field entity comparison.
    #[serde(default = "default_entity_epsilon")]
    pub entity_epsilon: f64,
    /// Scenario name -> priority. Unknown names get `default_scenario_priority`.
    #[serde(default)]
    pub scenario_priorities: BTreeMap<String, BranchPriority>,
    #[serde(default = "default_scenario_priority")]
    pub default_scenario_priority: BranchPriority,
    /// Seed mixed into branch id generation.
    #[serde(default = "default_id_seed")]
    pub id_seed: u32,
    /// Branch snapshots are persisted every this many global ticks.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: Tick,
}

fn default_entity_epsilon() -> f64 { 1e-6 }
fn default_scenario_priority() -> BranchPriority { BranchPriority::Normal }
fn default_id_seed() -> u32 { 0x5EED_2024 }
fn default_snapshot_interval() -> Tick { 30 }

impl TimeSpineConfig {
    /// Load from the data/ directory.
    /// In tests, use TimeSpineConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/timespine/timespine_config.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: TimeSpineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Config with hardcoded defaults for use in unit tests.
    pub fn default_test() -> Self {
        Self {
            max_concurrent_branches: 8,
            max_branch_duration:     1_000,
            branch_gc_interval:      10,
            divergence_threshold:    0.95,
            allow_nested_branches:   false,
            auto_prune_low_priority: false,
            divergence_weights:      DivergenceWeights::default(),
            score_weights:           ScoreWeights::default(),
            entity_epsilon:          default_entity_epsilon(),
            scenario_priorities:     BTreeMap::from([
                ("invasion".to_string(), BranchPriority::High),
                ("background".to_string(), BranchPriority::Low),
            ]),
            default_scenario_priority: default_scenario_priority(),
            id_seed:                 default_id_seed(),
            snapshot_interval:       default_snapshot_interval(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_branches == 0 {
            anyhow::bail!("max_concurrent_branches must be at least 1");
        }
        if self.branch_gc_interval == 0 {
            anyhow::bail!("branch_gc_interval must be at least 1");
        }
        if self.snapshot_interval == 0 {
            anyhow::bail!("snapshot_interval must be at least 1");
        }
        if !(self.divergence_threshold > 0.0 && self.divergence_threshold <= 1.0) {
            anyhow::bail!(
                "divergence_threshold must be in (0, 1], got {}",
                self.divergence_threshold
            );
        }
        let w = &self.divergence_weights;
        for (name, value) in [
            ("resource", w.resource),
            ("population", w.population),
            ("military", w.military),
            ("happiness", w.happiness),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("divergence weight '{name}' must be in [0, 1], got {value}");
            }
        }
        if self.entity_epsilon < 0.0 {
            anyhow::bail!("entity_epsilon must be non-negative");
        }
        Ok(())
    }

    /// Priority assigned to a scenario branch by name.
    pub fn scenario_priority(&self, scenario_name: &str) -> BranchPriority {
        self.scenario_priorities
            .get(scenario_name)
            .copied()
            .unwrap_or(self.default_scenario_priority)
    }
}

impl Default for TimeSpineConfig {
    fn default() -> Self {
        Self::default_test()
    }
}
