//! Aggregate branch snapshots.
//!
//! A snapshot is refreshed after every tick a branch advances (and after
//! a merge writes into it). Comparisons always read the latest snapshot,
//! never a live arena, for their aggregate figures. Snapshots are also
//! persisted every `snapshot_interval` ticks so a run can be inspected
//! after the fact.

use crate::{
    arena::BranchArena,
    types::{BranchId, Tick},
};
use serde::{Deserialize, Serialize};

/// Per-tick figures reported by the host simulation for one branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub population: f64,
    pub resources:  f64,
    pub happiness:  f64,
    pub military:   f64,
}

impl AggregateMetrics {
    /// Component-wise `self - baseline`.
    pub fn delta_from(&self, baseline: &AggregateMetrics) -> MetricDeltas {
        MetricDeltas {
            population: self.population - baseline.population,
            resources:  self.resources - baseline.resources,
            happiness:  self.happiness - baseline.happiness,
            military:   self.military - baseline.military,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDeltas {
    pub population: f64,
    pub resources:  f64,
    pub happiness:  f64,
    pub military:   f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSnapshot {
    pub branch_id:    BranchId,
    pub tick:         Tick,
    pub entity_count: usize,
    pub metrics:      AggregateMetrics,
    pub byte_size:    usize,
}

impl BranchSnapshot {
    pub fn capture(arena: &BranchArena, tick: Tick, metrics: AggregateMetrics) -> Self {
        Self {
            branch_id:    arena.branch_id.clone(),
            tick,
            entity_count: arena.len(),
            metrics,
            byte_size:    arena.byte_size(),
        }
    }
}
