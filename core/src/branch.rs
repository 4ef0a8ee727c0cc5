//! The branch record owned by the timeline registry.
//!
//! Invariants held by every method here:
//!   - branch_point_tick <= current_tick <= max_tick
//!   - a frozen branch never advances
//!   - the main timeline is never frozen, merged or marked for merge

use crate::{
    error::{SpineError, SpineResult},
    types::{BranchId, OriginId, Tick},
};
use serde::{Deserialize, Serialize};

/// Scheduling priority. Higher values are advanced first each pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchPriority {
    Low    = 0,
    Normal = 1,
    High   = 2,
}

impl BranchPriority {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreezeReason {
    DivergenceThreshold,
    DurationExceeded,
    ScenarioComplete,
    HostFailure,
    Explicit,
}

/// Lifecycle state derived from the branch flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    Active,
    Frozen,
    Merged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineBranch {
    pub id:                  BranchId,
    pub parent_id:           Option<BranchId>,
    pub branch_point_tick:   Tick,
    current_tick:            Tick,
    max_tick:                Tick,
    pub is_main_timeline:    bool,
    pub is_active:           bool,
    is_frozen:               bool,
    pub is_marked_for_merge: bool,
    divergence_score:        f64,
    pub priority:            BranchPriority,
    pub freeze_reason:       Option<FreezeReason>,
    /// Set when nothing downstream needs the branch any more.
    pub prune_eligible:      bool,
    pub merged:              bool,
    /// First origin id allocated after the fork. Lower ids pre-date it.
    pub origin_watermark:    OriginId,
    /// Global clock tick at creation.
    pub created_at_tick:     Tick,
}

impl TimelineBranch {
    pub fn main(tick: Tick) -> Self {
        Self {
            id:                  crate::types::MAIN_BRANCH_ID.to_string(),
            parent_id:           None,
            branch_point_tick:   tick,
            current_tick:        tick,
            max_tick:            tick,
            is_main_timeline:    true,
            is_active:           true,
            is_frozen:           false,
            is_marked_for_merge: false,
            divergence_score:    0.0,
            priority:            BranchPriority::High,
            freeze_reason:       None,
            prune_eligible:      false,
            merged:              false,
            origin_watermark:    0,
            created_at_tick:     tick,
        }
    }

    pub fn speculative(
        id: BranchId,
        parent_id: BranchId,
        branch_point_tick: Tick,
        priority: BranchPriority,
        origin_watermark: OriginId,
        created_at_tick: Tick,
    ) -> Self {
        Self {
            id,
            parent_id: Some(parent_id),
            branch_point_tick,
            current_tick: branch_point_tick,
            max_tick: branch_point_tick,
            is_main_timeline: false,
            is_active: true,
            is_frozen: false,
            is_marked_for_merge: false,
            divergence_score: 0.0,
            priority,
            freeze_reason: None,
            prune_eligible: false,
            merged: false,
            origin_watermark,
            created_at_tick,
        }
    }

    pub fn current_tick(&self) -> Tick { self.current_tick }
    pub fn max_tick(&self) -> Tick { self.max_tick }
    pub fn is_frozen(&self) -> bool { self.is_frozen }
    pub fn divergence_score(&self) -> f64 { self.divergence_score }

    /// Ticks advanced since the fork.
    pub fn elapsed(&self) -> Tick {
        self.current_tick - self.branch_point_tick
    }

    pub fn state(&self) -> BranchState {
        if self.merged {
            BranchState::Merged
        } else if self.is_frozen {
            BranchState::Frozen
        } else {
            BranchState::Active
        }
    }

    /// True if the lifecycle manager should step this branch this pass.
    pub fn is_schedulable(&self) -> bool {
        self.is_active && !self.is_frozen
    }

    /// Move forward one tick. Frozen branches are left untouched.
    pub(crate) fn advance(&mut self) -> bool {
        if !self.is_schedulable() {
            return false;
        }
        self.current_tick += 1;
        self.max_tick = self.max_tick.max(self.current_tick);
        true
    }

    /// Stop forward advancement. Returns false if already frozen.
    pub(crate) fn freeze(&mut self, reason: FreezeReason) -> SpineResult<bool> {
        if self.is_main_timeline {
            return Err(SpineError::MainTimelineProtected { operation: "freeze" });
        }
        if self.is_frozen {
            return Ok(false);
        }
        self.is_frozen = true;
        self.freeze_reason = Some(reason);
        Ok(true)
    }

    pub(crate) fn set_divergence(&mut self, score: f64) {
        self.divergence_score = score.clamp(0.0, 1.0);
    }

    pub(crate) fn mark_merged(&mut self) {
        self.is_marked_for_merge = false;
        self.merged = true;
        self.is_active = false;
        self.prune_eligible = true;
    }

    pub fn check_invariants(&self) -> SpineResult<()> {
        if self.branch_point_tick <= self.current_tick && self.current_tick <= self.max_tick {
            Ok(())
        } else {
            Err(SpineError::TickInvariant {
                branch_id:    self.id.clone(),
                branch_point: self.branch_point_tick,
                current:      self.current_tick,
                max:          self.max_tick,
            })
        }
    }
}
