//! Per-branch entity arenas.
//!
//! Every branch owns one arena exclusively. Entities are keyed by their
//! stable origin id, so the same logical entity can be found in any
//! branch it was forked into without pointer identity. Iteration order is
//! origin-id order, which keeps comparison and merge deterministic.

use crate::{
    error::{SpineError, SpineResult},
    types::{BranchId, OriginId, Tick},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// First id of the range reserved for host-derived spawns. The allocator
/// never reaches it.
pub const DERIVED_ORIGIN_BASE: OriginId = 1 << 62;

/// Origin id for the `index`-th entity spawned by `parent` at `tick`.
///
/// A pure function of its inputs, so the same birth happening in lock-step
/// in two branches yields the same id in both.
pub fn derived_origin(parent: OriginId, tick: Tick, index: u32) -> OriginId {
    let mut x = parent
        ^ tick.wrapping_mul(0x9e37_79b9_7f4a_7c15)
        ^ u64::from(index).wrapping_mul(0xc2b2_ae3d_27d4_eb4f);
    // splitmix64 finalizer
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    DERIVED_ORIGIN_BASE | (x & (DERIVED_ORIGIN_BASE - 1))
}

pub fn is_derived(origin_id: OriginId) -> bool {
    origin_id >= DERIVED_ORIGIN_BASE
}

/// Hands out origin ids for edits and modifications. One allocator per
/// engine, shared by every branch, so ids never collide across branches
/// and grow monotonically with time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OriginAllocator {
    next: OriginId,
}

impl OriginAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn allocate(&mut self) -> OriginId {
        let id = self.next.max(1);
        self.next = id + 1;
        id
    }

    /// The id the next allocation will return. Used as a fork watermark.
    pub fn peek(&self) -> OriginId {
        self.next.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Provenance of an entity inside one arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchMembership {
    pub origin_id:       OriginId,
    /// Branch whose arena first spawned the entity.
    pub created_in:      BranchId,
    pub created_at_tick: Tick,
    /// True when the entity was copied into this arena by a fork.
    pub inherited:       bool,
}

impl BranchMembership {
    /// Whether the entity existed before a fork taken at `fork_tick` with
    /// allocator watermark `watermark`. Derived ids carry no ordering, so
    /// their creation tick decides.
    pub fn predates(&self, watermark: OriginId, fork_tick: Tick) -> bool {
        if is_derived(self.origin_id) {
            self.created_at_tick <= fork_tick
        } else {
            self.origin_id < watermark
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchEntity {
    pub origin_id:  OriginId,
    pub kind:       String,
    pub position:   Position,
    pub resources:  BTreeMap<String, f64>,
    pub membership: BranchMembership,
}

impl BranchEntity {
    pub fn resource(&self, name: &str) -> f64 {
        self.resources.get(name).copied().unwrap_or(0.0)
    }

    /// Rough in-memory footprint, reported in snapshots.
    pub fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.kind.len()
            + self.membership.created_in.len()
            + self
                .resources
                .keys()
                .map(|k| k.len() + std::mem::size_of::<f64>())
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchArena {
    pub branch_id: BranchId,
    /// Branch tick at which this arena was forked from its parent.
    pub forked_at: Tick,
    entities:      BTreeMap<OriginId, BranchEntity>,
}

impl BranchArena {
    pub fn new(branch_id: BranchId, tick: Tick) -> Self {
        Self { branch_id, forked_at: tick, entities: BTreeMap::new() }
    }

    /// By-value copy for a new branch. Every entity becomes inherited.
    pub fn fork(&self, branch_id: &str, tick: Tick) -> BranchArena {
        let entities = self
            .entities
            .iter()
            .map(|(id, entity)| {
                let mut copy = entity.clone();
                copy.membership.inherited = true;
                (*id, copy)
            })
            .collect();
        BranchArena { branch_id: branch_id.to_string(), forked_at: tick, entities }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, origin_id: OriginId) -> Option<&BranchEntity> {
        self.entities.get(&origin_id)
    }

    pub fn get_mut(&mut self, origin_id: OriginId) -> Option<&mut BranchEntity> {
        self.entities.get_mut(&origin_id)
    }

    pub fn contains(&self, origin_id: OriginId) -> bool {
        self.entities.contains_key(&origin_id)
    }

    /// Read-only entity view in origin-id order.
    pub fn entities(&self) -> &BTreeMap<OriginId, BranchEntity> {
        &self.entities
    }

    pub fn iter(&self) -> impl Iterator<Item = &BranchEntity> {
        self.entities.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BranchEntity> {
        self.entities.values_mut()
    }

    pub fn byte_size(&self) -> usize {
        self.entities.values().map(BranchEntity::approx_bytes).sum()
    }

    pub fn spawn(
        &mut self,
        origins: &mut OriginAllocator,
        kind: &str,
        position: Position,
        tick: Tick,
    ) -> OriginId {
        let origin_id = origins.allocate();
        self.insert_new(origin_id, kind, position, tick)
    }

    /// Spawn on behalf of `parent` with a derived id. On a collision the
    /// next id inside the reserved range is tried.
    pub fn spawn_derived(
        &mut self,
        parent: OriginId,
        index: u32,
        kind: &str,
        position: Position,
        tick: Tick,
    ) -> OriginId {
        let mut origin_id = derived_origin(parent, tick, index);
        while self.entities.contains_key(&origin_id) {
            origin_id = DERIVED_ORIGIN_BASE | (origin_id.wrapping_add(1) & (DERIVED_ORIGIN_BASE - 1));
        }
        self.insert_new(origin_id, kind, position, tick)
    }

    fn insert_new(&mut self, origin_id: OriginId, kind: &str, position: Position, tick: Tick) -> OriginId {
        let entity = BranchEntity {
            origin_id,
            kind: kind.to_string(),
            position,
            resources: BTreeMap::new(),
            membership: BranchMembership {
                origin_id,
                created_in: self.branch_id.clone(),
                created_at_tick: tick,
                inherited: false,
            },
        };
        self.entities.insert(origin_id, entity);
        origin_id
    }

    pub fn remove(&mut self, origin_id: OriginId) -> SpineResult<BranchEntity> {
        self.entities.remove(&origin_id).ok_or_else(|| SpineError::EntityNotFound {
            branch_id: self.branch_id.clone(),
            origin_id,
        })
    }

    pub fn set_resource(&mut self, origin_id: OriginId, name: &str, value: f64) -> SpineResult<()> {
        let branch_id = &self.branch_id;
        let entity = self.entities.get_mut(&origin_id).ok_or_else(|| SpineError::EntityNotFound {
            branch_id: branch_id.clone(),
            origin_id,
        })?;
        entity.resources.insert(name.to_string(), value);
        Ok(())
    }

    /// Insert or overwrite an entity carried over from another arena.
    pub(crate) fn upsert(&mut self, entity: BranchEntity) {
        self.entities.insert(entity.origin_id, entity);
    }
}
