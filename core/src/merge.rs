//! Merge coordinator: folds a frozen branch into a target branch.
//!
//! RULES:
//!   - The source must be frozen; a branch still advancing is never read
//!     mid-flight.
//!   - The target must not be the source or descend from it.
//!   - At most one merge into a given target is in flight at a time.
//!   - A merge is planned against immutable views first and only then
//!     written, so a rejected merge leaves the target untouched.
//!
//! Full merge: every source entity is created or overwritten in the
//! target. Target entities absent from the source are removed only if
//! they were created after the source's fork (origin id at or above the
//! source's watermark); anything older is never deleted by a merge.
//!
//! Selective merge: only the selected entities (all source entities when
//! the entity set is empty) are touched. With an empty field set each
//! selected entity is copied whole, created if missing. With a field set,
//! only those fields are copied, and only onto entities the target
//! already holds. Selective merges never delete.

use crate::{
    arena::{BranchArena, BranchEntity},
    error::{SpineError, SpineResult},
    host::HostSimulation,
    state::SpineState,
    types::{BranchId, OriginId, Tick},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Field names understood by a selective merge besides resource names.
pub const FIELD_KIND: &str = "kind";
pub const FIELD_POSITION: &str = "position";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeSelection {
    /// Origin ids to adopt. Empty means every entity in the source.
    #[serde(default)]
    pub entities: BTreeSet<OriginId>,
    /// `kind`, `position`, or resource names. Empty means whole entities.
    #[serde(default)]
    pub fields:   BTreeSet<String>,
}

impl MergeSelection {
    pub fn entities(ids: impl IntoIterator<Item = OriginId>) -> Self {
        Self { entities: ids.into_iter().collect(), fields: BTreeSet::new() }
    }

    pub fn fields<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self { entities: BTreeSet::new(), fields: names.into_iter().map(Into::into).collect() }
    }

    pub fn with_entities(mut self, ids: impl IntoIterator<Item = OriginId>) -> Self {
        self.entities.extend(ids);
        self
    }

    fn selects(&self, origin_id: OriginId) -> bool {
        self.entities.is_empty() || self.entities.contains(&origin_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchMergeRequest {
    pub source:     BranchId,
    pub target:     BranchId,
    pub full_merge: bool,
    #[serde(default)]
    pub selection:  Option<MergeSelection>,
}

impl BranchMergeRequest {
    pub fn full(source: &str, target: &str) -> Self {
        Self { source: source.to_string(), target: target.to_string(), full_merge: true, selection: None }
    }

    pub fn selective(source: &str, target: &str, selection: MergeSelection) -> Self {
        Self {
            source:     source.to_string(),
            target:     target.to_string(),
            full_merge: false,
            selection:  Some(selection),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub source:     BranchId,
    pub target:     BranchId,
    pub full_merge: bool,
    pub created:    usize,
    pub updated:    usize,
    pub removed:    usize,
    /// Selected ids the source did not hold, or field copies with no target entity.
    pub skipped:    usize,
}

/// Writes computed against immutable views, applied in one go.
#[derive(Debug, Default)]
struct MergePlan {
    upserts:  Vec<BranchEntity>,
    removals: Vec<OriginId>,
    created:  usize,
    updated:  usize,
    skipped:  usize,
}

#[derive(Debug, Default)]
pub struct MergeCoordinator {
    in_flight: BTreeSet<BranchId>,
}

impl MergeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self, target: &str) -> bool {
        self.in_flight.contains(target)
    }

    #[cfg(test)]
    pub(crate) fn hold_target(&mut self, target: &str) {
        self.in_flight.insert(target.to_string());
    }

    /// Check every precondition without writing anything.
    pub fn validate(&self, state: &SpineState, request: &BranchMergeRequest) -> SpineResult<()> {
        if !request.full_merge && request.selection.is_none() {
            return Err(SpineError::validation("selective merge requires a selection"));
        }
        let source = state.branch(&request.source)?;
        state.branch(&request.target)?;

        if source.is_main_timeline {
            return Err(SpineError::MainTimelineProtected { operation: "merge_source" });
        }
        if source.merged {
            return Err(SpineError::validation(format!(
                "branch '{}' has already been merged",
                request.source
            )));
        }
        if !source.is_frozen() {
            return Err(SpineError::SourceNotFrozen { branch_id: request.source.clone() });
        }
        if state.registry.is_descendant(&request.target, &request.source) {
            return Err(SpineError::TargetIsDescendant {
                source_id: request.source.clone(),
                target_id: request.target.clone(),
            });
        }
        if self.in_flight.contains(&request.target) {
            return Err(SpineError::MergeInFlight { target: request.target.clone() });
        }
        Ok(())
    }

    /// Flag a source as awaiting merge so GC leaves it alone.
    pub fn mark_pending(&self, state: &mut SpineState, request: &BranchMergeRequest) -> SpineResult<()> {
        let source = state.registry.branch_mut(&request.source)?;
        if source.is_main_timeline {
            return Err(SpineError::MainTimelineProtected { operation: "mark_for_merge" });
        }
        source.is_marked_for_merge = true;
        Ok(())
    }

    pub fn merge_branch(
        &mut self,
        state: &mut SpineState,
        host: &dyn HostSimulation,
        request: &BranchMergeRequest,
        tick: Tick,
    ) -> SpineResult<MergeOutcome> {
        if let Err(e) = self.validate(state, request) {
            // A rejected request must not leave a stale mark behind.
            if let Ok(source) = state.registry.branch_mut(&request.source) {
                if !source.is_main_timeline && !source.merged {
                    source.is_marked_for_merge = false;
                }
            }
            return Err(e);
        }

        self.in_flight.insert(request.target.clone());
        self.mark_pending(state, request)?;
        let result = self.execute(state, host, request, tick);
        self.in_flight.remove(&request.target);

        match result {
            Ok(outcome) => {
                state.registry.branch_mut(&request.source)?.mark_merged();
                Ok(outcome)
            }
            Err(e) => {
                state.registry.branch_mut(&request.source)?.is_marked_for_merge = false;
                Err(e)
            }
        }
    }

    fn execute(
        &self,
        state: &mut SpineState,
        host: &dyn HostSimulation,
        request: &BranchMergeRequest,
        tick: Tick,
    ) -> SpineResult<MergeOutcome> {
        let source_branch = state.branch(&request.source)?;
        let fork = (source_branch.origin_watermark, source_branch.branch_point_tick);
        let plan = {
            let source = state.arena(&request.source)?;
            let target = state.arena(&request.target)?;
            match (&request.selection, request.full_merge) {
                (_, true) => plan_full(source, target, fork),
                (Some(selection), false) => plan_selective(source, target, selection),
                (None, false) => return Err(SpineError::validation("selective merge requires a selection")),
            }
        };

        let target = state.arena_mut(&request.target)?;
        for origin_id in &plan.removals {
            target.remove(*origin_id)?;
        }
        for entity in plan.upserts {
            target.upsert(entity);
        }
        state.refresh_snapshot(host, &request.target)?;

        let outcome = MergeOutcome {
            source:     request.source.clone(),
            target:     request.target.clone(),
            full_merge: request.full_merge,
            created:    plan.created,
            updated:    plan.updated,
            removed:    plan.removals.len(),
            skipped:    plan.skipped,
        };
        log::info!(
            "tick={tick} merged {} into {} ({}): +{} ~{} -{}",
            outcome.source,
            outcome.target,
            if outcome.full_merge { "full" } else { "selective" },
            outcome.created,
            outcome.updated,
            outcome.removed
        );
        Ok(outcome)
    }
}

/// Carry a source entity into the target, keeping the target's view of
/// whether it was inherited.
fn carried(entity: &BranchEntity, existing: Option<&BranchEntity>) -> BranchEntity {
    let mut copy = entity.clone();
    if let Some(existing) = existing {
        copy.membership.inherited = existing.membership.inherited;
    } else {
        copy.membership.inherited = false;
    }
    copy
}

/// `fork` is the source's (allocator watermark, branch point tick).
fn plan_full(source: &BranchArena, target: &BranchArena, fork: (OriginId, Tick)) -> MergePlan {
    let mut plan = MergePlan::default();
    for entity in source.iter() {
        match target.get(entity.origin_id) {
            None => {
                plan.created += 1;
                plan.upserts.push(carried(entity, None));
            }
            Some(existing) => {
                if !same_state(entity, existing) {
                    plan.updated += 1;
                    plan.upserts.push(carried(entity, Some(existing)));
                }
            }
        }
    }
    for entity in target.iter() {
        if !source.contains(entity.origin_id) && !entity.membership.predates(fork.0, fork.1) {
            plan.removals.push(entity.origin_id);
        }
    }
    plan
}

fn plan_selective(source: &BranchArena, target: &BranchArena, selection: &MergeSelection) -> MergePlan {
    let mut plan = MergePlan::default();

    // Explicitly named ids the source no longer holds.
    plan.skipped += selection.entities.iter().filter(|id| !source.contains(**id)).count();

    for entity in source.iter().filter(|e| selection.selects(e.origin_id)) {
        let existing = target.get(entity.origin_id);
        if selection.fields.is_empty() {
            match existing {
                None => {
                    plan.created += 1;
                    plan.upserts.push(carried(entity, None));
                }
                Some(existing) if !same_state(entity, existing) => {
                    plan.updated += 1;
                    plan.upserts.push(carried(entity, Some(existing)));
                }
                Some(_) => {}
            }
            continue;
        }

        let Some(existing) = existing else {
            plan.skipped += 1;
            continue;
        };
        let mut merged = existing.clone();
        for field in &selection.fields {
            match field.as_str() {
                FIELD_KIND => merged.kind = entity.kind.clone(),
                FIELD_POSITION => merged.position = entity.position,
                resource => match entity.resources.get(resource) {
                    Some(value) => {
                        merged.resources.insert(resource.to_string(), *value);
                    }
                    None => {
                        merged.resources.remove(resource);
                    }
                },
            }
        }
        if merged != *existing {
            plan.updated += 1;
            plan.upserts.push(merged);
        }
    }
    plan
}

/// Equality on the merged fields only; provenance is not compared.
fn same_state(a: &BranchEntity, b: &BranchEntity) -> bool {
    a.kind == b.kind && a.position == b.position && a.resources == b.resources
}
