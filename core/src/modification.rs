//! What-if modifications and their default application against an arena.
//!
//! Modifications are applied strictly in list order. A spawned entity has
//! no origin id until it is applied, so later modifications refer to it by
//! the label given at spawn time.

use crate::{
    arena::{BranchArena, OriginAllocator, Position},
    error::{SpineError, SpineResult},
    types::{OriginId, Tick},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference to the entity a modification targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    Origin(OriginId),
    /// Label of an entity spawned earlier in the same list.
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WhatIfModification {
    SetResource {
        target:   EntityRef,
        resource: String,
        value:    f64,
    },
    SpawnEntity {
        #[serde(default)]
        label:    Option<String>,
        kind:     String,
        #[serde(default)]
        position: Position,
    },
    RemoveEntity {
        target: EntityRef,
    },
}

impl WhatIfModification {
    pub fn set_resource(target: EntityRef, resource: &str, value: f64) -> Self {
        Self::SetResource { target, resource: resource.to_string(), value }
    }

    pub fn spawn(label: Option<&str>, kind: &str, position: Position) -> Self {
        Self::SpawnEntity { label: label.map(str::to_string), kind: kind.to_string(), position }
    }

    pub fn remove(target: EntityRef) -> Self {
        Self::RemoveEntity { target }
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            Self::SetResource { .. }  => "set_resource",
            Self::SpawnEntity { .. }  => "spawn_entity",
            Self::RemoveEntity { .. } => "remove_entity",
        }
    }
}

/// A modification that could not be applied. Recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationFailure {
    pub index:  usize,
    pub op:     String,
    pub reason: String,
}

/// Labels bound by spawns so far in one modification list.
pub type SpawnLabels = BTreeMap<String, OriginId>;

fn resolve(arena: &BranchArena, labels: &SpawnLabels, target: &EntityRef) -> SpineResult<OriginId> {
    let origin_id = match target {
        EntityRef::Origin(id) => *id,
        EntityRef::Label(label) => *labels.get(label).ok_or_else(|| {
            SpineError::validation(format!("no entity spawned under label '{label}'"))
        })?,
    };
    if arena.contains(origin_id) {
        Ok(origin_id)
    } else {
        Err(SpineError::EntityNotFound { branch_id: arena.branch_id.clone(), origin_id })
    }
}

/// Apply one modification. Returns the origin id of a spawned entity.
pub fn apply_to_arena(
    arena: &mut BranchArena,
    origins: &mut OriginAllocator,
    labels: &mut SpawnLabels,
    modification: &WhatIfModification,
    tick: Tick,
) -> SpineResult<Option<OriginId>> {
    match modification {
        WhatIfModification::SetResource { target, resource, value } => {
            let origin_id = resolve(arena, labels, target)?;
            arena.set_resource(origin_id, resource, *value)?;
            Ok(None)
        }
        WhatIfModification::SpawnEntity { label, kind, position } => {
            let origin_id = arena.spawn(origins, kind, *position, tick);
            if let Some(label) = label {
                labels.insert(label.clone(), origin_id);
            }
            Ok(Some(origin_id))
        }
        WhatIfModification::RemoveEntity { target } => {
            let origin_id = resolve(arena, labels, target)?;
            arena.remove(origin_id)?;
            Ok(None)
        }
    }
}
