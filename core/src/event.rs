//! The event log: every state change the engine makes.
//!
//! RULE: Components report what they did as events; the engine persists
//! them in order. Nothing is logged that did not actually happen.

use crate::{
    branch::{BranchPriority, FreezeReason},
    error::ErrorKind,
    types::{BranchId, RunId, Tick},
};
use serde::{Deserialize, Serialize};

/// Every event emitted by the engine.
/// Variants are appended over time, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpineEvent {
    // ── Engine events ──────────────────────────────
    TickStarted {
        tick: Tick,
    },
    TickCompleted {
        tick: Tick,
    },
    RunInitialized {
        run_id: RunId,
        seed: u64,
    },
    CommandReceived {
        tick: Tick,
        command_id: String,
        command_type: String,
    },

    // ── Registry / lifecycle events ────────────────
    BranchCreated {
        tick: Tick,
        branch_id: BranchId,
        parent_id: BranchId,
        branch_point_tick: Tick,
        priority: BranchPriority,
    },
    BranchEvicted {
        tick: Tick,
        branch_id: BranchId,
    },
    BranchFrozen {
        tick: Tick,
        branch_id: BranchId,
        reason: FreezeReason,
        branch_tick: Tick,
        divergence: f64,
    },
    BranchPruned {
        tick: Tick,
        branch_id: BranchId,
    },
    HostStepFailed {
        tick: Tick,
        branch_id: BranchId,
        reason: String,
    },

    // ── Scenario events ────────────────────────────
    ScenarioSubmitted {
        tick: Tick,
        branch_id: BranchId,
        scenario_name: String,
        modification_count: usize,
    },
    ModificationFailed {
        tick: Tick,
        branch_id: BranchId,
        index: usize,
        op: String,
        reason: String,
    },
    ScenarioCompleted {
        tick: Tick,
        branch_id: BranchId,
        scenario_name: String,
        overall_score: f64,
        is_better_than_baseline: bool,
    },

    // ── Comparison / merge events ──────────────────
    ComparisonCompleted {
        tick: Tick,
        branch_a: BranchId,
        branch_b: BranchId,
        divergence: f64,
    },
    MergeCompleted {
        tick: Tick,
        source: BranchId,
        target: BranchId,
        full_merge: bool,
        created: usize,
        updated: usize,
        removed: usize,
    },
    RequestRejected {
        tick: Tick,
        request: String,
        kind: ErrorKind,
        reason_code: String,
        message: String,
    },
}

impl SpineEvent {
    /// Stable string name, used for the event_type column in event_log.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TickStarted { .. }         => "tick_started",
            Self::TickCompleted { .. }       => "tick_completed",
            Self::RunInitialized { .. }      => "run_initialized",
            Self::CommandReceived { .. }     => "command_received",
            Self::BranchCreated { .. }       => "branch_created",
            Self::BranchEvicted { .. }       => "branch_evicted",
            Self::BranchFrozen { .. }        => "branch_frozen",
            Self::BranchPruned { .. }        => "branch_pruned",
            Self::HostStepFailed { .. }      => "host_step_failed",
            Self::ScenarioSubmitted { .. }   => "scenario_submitted",
            Self::ModificationFailed { .. }  => "modification_failed",
            Self::ScenarioCompleted { .. }   => "scenario_completed",
            Self::ComparisonCompleted { .. } => "comparison_completed",
            Self::MergeCompleted { .. }      => "merge_completed",
            Self::RequestRejected { .. }     => "request_rejected",
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub run_id:     RunId,
    pub tick:       Tick,
    pub component:  String,
    pub event_type: String,
    pub payload:    String, // JSON-serialized SpineEvent
}
