use crate::types::{BranchId, OriginId, Tick};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    #[error("Branch '{branch_id}' not found")]
    BranchNotFound { branch_id: BranchId },

    #[error("Nested branches are disabled: parent '{parent_id}' is not the main timeline")]
    NestedBranchNotAllowed { parent_id: BranchId },

    #[error("Branch limit exceeded: {limit} concurrent branches (eviction attempted: {eviction_attempted})")]
    BranchLimitExceeded { limit: usize, eviction_attempted: bool },

    #[error("Branch '{branch_id}' is not frozen and cannot be merged")]
    SourceNotFrozen { branch_id: BranchId },

    #[error("Cannot merge '{source_id}' into '{target_id}': target descends from source")]
    TargetIsDescendant { source_id: BranchId, target_id: BranchId },

    #[error("Operation '{operation}' is not permitted on the main timeline")]
    MainTimelineProtected { operation: &'static str },

    #[error("A merge into '{target}' is already in flight")]
    MergeInFlight { target: BranchId },

    #[error("Branch '{branch_id}' cannot be destroyed before it is frozen")]
    BranchNotFrozen { branch_id: BranchId },

    #[error("Branch '{branch_id}' is marked for merge and cannot be destroyed")]
    MarkedForMerge { branch_id: BranchId },

    #[error("Entity {origin_id} not found in branch '{branch_id}'")]
    EntityNotFound { branch_id: BranchId, origin_id: OriginId },

    #[error("Tick invariant violated on '{branch_id}': branch point {branch_point}, current {current}, max {max}")]
    TickInvariant { branch_id: BranchId, branch_point: Tick, current: Tick, max: Tick },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse error classes, used for telemetry and for the IPC reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    PolicyViolation,
    ResourceExhaustion,
    Storage,
    Internal,
}

impl SpineError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation { reason: reason.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. }
            | Self::BranchNotFound { .. }
            | Self::EntityNotFound { .. } => ErrorKind::Validation,

            // Auto-prune ran and still could not free a slot.
            Self::BranchLimitExceeded { eviction_attempted: true, .. } => {
                ErrorKind::ResourceExhaustion
            }

            Self::BranchLimitExceeded { .. }
            | Self::NestedBranchNotAllowed { .. }
            | Self::SourceNotFrozen { .. }
            | Self::TargetIsDescendant { .. }
            | Self::MainTimelineProtected { .. }
            | Self::MergeInFlight { .. }
            | Self::BranchNotFrozen { .. }
            | Self::MarkedForMerge { .. } => ErrorKind::PolicyViolation,

            Self::Database(_) | Self::Serialization(_) => ErrorKind::Storage,

            Self::TickInvariant { .. } | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Stable snake_case reason code reported back to hosts.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Database(_)                 => "database",
            Self::Serialization(_)            => "serialization",
            Self::Validation { .. }           => "validation_error",
            Self::BranchNotFound { .. }       => "branch_not_found",
            Self::NestedBranchNotAllowed { .. } => "nested_branch_not_allowed",
            Self::BranchLimitExceeded { .. }  => "branch_limit_exceeded",
            Self::SourceNotFrozen { .. }      => "source_not_frozen",
            Self::TargetIsDescendant { .. }   => "target_is_descendant",
            Self::MainTimelineProtected { .. } => "main_timeline_protected",
            Self::MergeInFlight { .. }        => "merge_in_flight",
            Self::BranchNotFrozen { .. }      => "branch_not_frozen",
            Self::MarkedForMerge { .. }       => "marked_for_merge",
            Self::EntityNotFound { .. }       => "entity_not_found",
            Self::TickInvariant { .. }        => "tick_invariant",
            Self::Other(_)                    => "internal",
        }
    }
}

pub type SpineResult<T> = Result<T, SpineError>;
