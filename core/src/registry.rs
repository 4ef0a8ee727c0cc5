//! The timeline registry: the table of every live branch.
//!
//! RULE: Only the registry creates or destroys TimelineBranch records.
//! It owns the parent/child index and the structural invariants:
//!   - exactly one branch is the main timeline, and it is never destroyed
//!   - branch ids are deterministic and never reused within a run
//!   - speculative branch count never exceeds max_concurrent_branches

use crate::{
    branch::{BranchPriority, TimelineBranch},
    config::TimeSpineConfig,
    error::{SpineError, SpineResult},
    rng::branch_id_for,
    types::{BranchId, OriginId, Tick, MAIN_BRANCH_ID},
};
use std::collections::{BTreeMap, BTreeSet};

const MAX_ID_ATTEMPTS: u32 = 64;

/// Result of a successful create: the new id plus anything evicted to make room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchCreation {
    pub branch_id: BranchId,
    pub evicted:   Vec<BranchId>,
}

pub struct TimelineRegistry {
    config:   TimeSpineConfig,
    branches: BTreeMap<BranchId, TimelineBranch>,
    children: BTreeMap<BranchId, BTreeSet<BranchId>>,
    /// Every id ever issued, live or destroyed.
    issued:   BTreeSet<BranchId>,
}

impl TimelineRegistry {
    pub fn new(config: TimeSpineConfig, main_tick: Tick) -> Self {
        let main = TimelineBranch::main(main_tick);
        let mut branches = BTreeMap::new();
        let mut issued = BTreeSet::new();
        issued.insert(main.id.clone());
        branches.insert(main.id.clone(), main);
        Self { config, branches, children: BTreeMap::new(), issued }
    }

    pub fn config(&self) -> &TimeSpineConfig {
        &self.config
    }

    pub fn main_id(&self) -> &str {
        MAIN_BRANCH_ID
    }

    pub fn main(&self) -> &TimelineBranch {
        // The main record is inserted in new() and never removed.
        &self.branches[MAIN_BRANCH_ID]
    }

    pub fn get_branch(&self, branch_id: &str) -> Option<&TimelineBranch> {
        self.branches.get(branch_id)
    }

    pub fn branch(&self, branch_id: &str) -> SpineResult<&TimelineBranch> {
        self.branches.get(branch_id).ok_or_else(|| SpineError::BranchNotFound {
            branch_id: branch_id.to_string(),
        })
    }

    pub(crate) fn branch_mut(&mut self, branch_id: &str) -> SpineResult<&mut TimelineBranch> {
        self.branches.get_mut(branch_id).ok_or_else(|| SpineError::BranchNotFound {
            branch_id: branch_id.to_string(),
        })
    }

    pub fn contains(&self, branch_id: &str) -> bool {
        self.branches.contains_key(branch_id)
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Live branches other than the main timeline.
    pub fn speculative_count(&self) -> usize {
        self.branches.values().filter(|b| !b.is_main_timeline).count()
    }

    pub fn branches(&self) -> impl Iterator<Item = &TimelineBranch> {
        self.branches.values()
    }

    /// Branches that are active and not frozen, in id order.
    pub fn active_branches(&self) -> Vec<&TimelineBranch> {
        self.branches.values().filter(|b| b.is_schedulable()).collect()
    }

    /// Schedulable ids by descending priority, ties by ascending id.
    pub fn schedule_order(&self) -> Vec<BranchId> {
        let mut ids: Vec<(&BranchPriority, &BranchId)> = self
            .branches
            .values()
            .filter(|b| b.is_schedulable())
            .map(|b| (&b.priority, &b.id))
            .collect();
        ids.sort_by(|(pa, ia), (pb, ib)| pb.cmp(pa).then_with(|| ia.cmp(ib)));
        ids.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn children(&self, branch_id: &str) -> Vec<BranchId> {
        self.children
            .get(branch_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ancestors of `branch_id`, nearest first. Stops at a destroyed parent.
    pub fn lineage(&self, branch_id: &str) -> Vec<BranchId> {
        let mut out = Vec::new();
        let mut cursor = self.branches.get(branch_id).and_then(|b| b.parent_id.clone());
        while let Some(parent) = cursor {
            cursor = self.branches.get(&parent).and_then(|b| b.parent_id.clone());
            out.push(parent);
        }
        out
    }

    /// True if `candidate` is `ancestor` or sits anywhere below it.
    pub fn is_descendant(&self, candidate: &str, ancestor: &str) -> bool {
        candidate == ancestor || self.lineage(candidate).iter().any(|id| id == ancestor)
    }

    pub fn create_branch(
        &mut self,
        parent_id: &str,
        branch_point_tick: Tick,
        priority: BranchPriority,
        origin_watermark: OriginId,
        now: Tick,
    ) -> SpineResult<BranchCreation> {
        let parent = self.branch(parent_id)?;
        if !parent.is_main_timeline && !self.config.allow_nested_branches {
            return Err(SpineError::NestedBranchNotAllowed { parent_id: parent_id.to_string() });
        }
        // The fork copies the parent as it stands, so it can only be taken
        // at the parent's current tick.
        if branch_point_tick != parent.current_tick() {
            return Err(SpineError::validation(format!(
                "branch point {branch_point_tick} does not match '{parent_id}' at tick {}",
                parent.current_tick()
            )));
        }

        let branch_id = self.next_branch_id(branch_point_tick)?;
        let mut evicted = Vec::new();
        if self.speculative_count() >= self.config.max_concurrent_branches {
            if !self.config.auto_prune_low_priority {
                return Err(SpineError::BranchLimitExceeded {
                    limit: self.config.max_concurrent_branches,
                    eviction_attempted: false,
                });
            }
            let victim = self.eviction_candidate(parent_id).ok_or(SpineError::BranchLimitExceeded {
                limit: self.config.max_concurrent_branches,
                eviction_attempted: true,
            })?;
            self.destroy_branch(&victim)?;
            log::info!("tick={now} evicted frozen low-priority branch {victim} to free a slot");
            evicted.push(victim);
        }

        let branch = TimelineBranch::speculative(
            branch_id.clone(),
            parent_id.to_string(),
            branch_point_tick,
            priority,
            origin_watermark,
            now,
        );
        self.issued.insert(branch_id.clone());
        self.children
            .entry(parent_id.to_string())
            .or_default()
            .insert(branch_id.clone());
        self.branches.insert(branch_id.clone(), branch);

        log::debug!(
            "tick={now} created {branch_id} from {parent_id} at branch point {branch_point_tick} ({priority:?})"
        );
        Ok(BranchCreation { branch_id, evicted })
    }

    /// Remove a frozen, non-main branch record.
    pub fn destroy_branch(&mut self, branch_id: &str) -> SpineResult<TimelineBranch> {
        let branch = self.branch(branch_id)?;
        if branch.is_main_timeline {
            return Err(SpineError::MainTimelineProtected { operation: "destroy" });
        }
        if !branch.is_frozen() {
            return Err(SpineError::BranchNotFrozen { branch_id: branch_id.to_string() });
        }
        if branch.is_marked_for_merge {
            return Err(SpineError::MarkedForMerge { branch_id: branch_id.to_string() });
        }

        let removed = self
            .branches
            .remove(branch_id)
            .ok_or_else(|| SpineError::BranchNotFound { branch_id: branch_id.to_string() })?;
        if let Some(parent) = &removed.parent_id {
            if let Some(siblings) = self.children.get_mut(parent) {
                siblings.remove(branch_id);
            }
        }
        self.children.remove(branch_id);
        Ok(removed)
    }

    /// Oldest frozen Low-priority branch that is not waiting on a merge.
    fn eviction_candidate(&self, parent_id: &str) -> Option<BranchId> {
        self.branches
            .values()
            .filter(|b| {
                !b.is_main_timeline
                    && b.id != parent_id
                    && b.is_frozen()
                    && !b.is_marked_for_merge
                    && b.priority == BranchPriority::Low
            })
            .min_by(|a, b| a.created_at_tick.cmp(&b.created_at_tick).then_with(|| a.id.cmp(&b.id)))
            .map(|b| b.id.clone())
    }

    /// Ids are never reused, so a tick's id space can run out. Give up
    /// after a bounded number of reseeds rather than scan it.
    fn next_branch_id(&self, tick: Tick) -> SpineResult<BranchId> {
        let mut seed = self.config.id_seed;
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = branch_id_for(tick, seed);
            if !self.issued.contains(&candidate) {
                return Ok(candidate);
            }
            seed = seed.wrapping_add(1);
        }
        log::warn!("no free branch id at tick {tick} after {MAX_ID_ATTEMPTS} attempts");
        Err(SpineError::BranchLimitExceeded {
            limit:              self.config.max_concurrent_branches,
            eviction_attempted: true,
        })
    }

    /// Verify every structural invariant. Used by tests and debug tooling.
    pub fn check_invariants(&self) -> SpineResult<()> {
        let mains = self.branches.values().filter(|b| b.is_main_timeline).count();
        if mains != 1 {
            return Err(anyhow::anyhow!("expected exactly one main timeline, found {mains}").into());
        }
        let main = self.main();
        if main.is_frozen() || main.is_marked_for_merge || main.merged {
            return Err(anyhow::anyhow!("main timeline left the active state").into());
        }
        for branch in self.branches.values() {
            branch.check_invariants()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::FreezeReason;

    fn churn(registry: &mut TimelineRegistry) -> SpineResult<BranchId> {
        let id = registry.create_branch(MAIN_BRANCH_ID, 0, BranchPriority::Normal, 1, 0)?.branch_id;
        registry.branch_mut(&id)?.freeze(FreezeReason::Explicit)?;
        registry.destroy_branch(&id)?;
        Ok(id)
    }

    /// Retired ids stay retired; once a tick's ids run out creation fails
    /// cleanly instead of spinning.
    #[test]
    fn exhausted_id_space_is_resource_exhaustion() {
        let mut registry = TimelineRegistry::new(TimeSpineConfig::default_test(), 0);
        let mut seen = BTreeSet::new();
        let err = loop {
            match churn(&mut registry) {
                Ok(id) => {
                    assert!(seen.insert(id), "id reused");
                    assert!(seen.len() <= 10_000, "more ids than the tick's id space");
                }
                Err(e) => break e,
            }
        };
        assert!(
            matches!(err, SpineError::BranchLimitExceeded { eviction_attempted: true, .. }),
            "got {err:?}"
        );
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhaustion);
        assert_eq!(registry.speculative_count(), 0);
    }

    #[test]
    fn branch_point_must_match_parent_tick() {
        let mut registry = TimelineRegistry::new(TimeSpineConfig::default_test(), 0);
        for tick in [1, 10_000] {
            let err = registry.create_branch(MAIN_BRANCH_ID, tick, BranchPriority::Normal, 1, 0).unwrap_err();
            assert!(matches!(err, SpineError::Validation { .. }), "got {err:?}");
        }
        assert_eq!(registry.speculative_count(), 0);
    }
}
