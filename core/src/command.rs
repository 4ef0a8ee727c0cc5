//! Queued host requests.
//!
//! Commands are value records. `SpineEngine::submit_command` queues one
//! and returns its id; the engine consumes the queue at the start of the
//! next tick, before the lifecycle pass, and records an outcome per id.

use crate::{
    comparator::BranchComparison,
    error::ErrorKind,
    merge::{BranchMergeRequest, MergeOutcome},
    types::{BranchId, RunId, Tick},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRequest {
    pub branch_a: BranchId,
    pub branch_b: BranchId,
    #[serde(default)]
    pub detailed: bool,
}

impl ComparisonRequest {
    pub fn new(branch_a: &str, branch_b: &str, detailed: bool) -> Self {
        Self { branch_a: branch_a.to_string(), branch_b: branch_b.to_string(), detailed }
    }
}

/// All host-issued commands.
/// Variants are appended over time, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum SpineCommand {
    Compare(ComparisonRequest),
    Merge(BranchMergeRequest),
    Destroy { branch_id: BranchId },
    Freeze  { branch_id: BranchId },
}

impl SpineCommand {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Compare(_)     => "compare",
            Self::Merge(_)       => "merge",
            Self::Destroy { .. } => "destroy",
            Self::Freeze { .. }  => "freeze",
        }
    }
}

/// A queued command with its submission tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub run_id:     RunId,
    pub queued_at:  Tick,
    pub command_id: String,
    pub command:    SpineCommand,
}

/// What became of a queued command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    Pending,
    Compared { comparison: Box<BranchComparison> },
    Merged   { outcome: MergeOutcome },
    Destroyed { branch_id: BranchId },
    Frozen   { branch_id: BranchId },
    Rejected {
        kind:        ErrorKind,
        reason_code: String,
        message:     String,
    },
}

impl CommandOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CommandOutcome::Rejected { .. })
    }
}
