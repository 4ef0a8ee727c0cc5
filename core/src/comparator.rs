//! Branch comparison.
//!
//! Aggregate differences come from each side's latest snapshot. Entity
//! classification, when requested, is a single merge-walk over both
//! origin-id-ordered entity sets: O(|A| + |B|), no hashing, no pointers
//! into live arenas.

use crate::{
    arena::BranchEntity,
    snapshot::{AggregateMetrics, BranchSnapshot, MetricDeltas},
    types::{BranchId, OriginId},
};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeMap};

/// A read-only, already-materialized view of one branch.
#[derive(Debug, Clone, Copy)]
pub struct BranchView<'a> {
    pub snapshot: &'a BranchSnapshot,
    pub entities: &'a BTreeMap<OriginId, BranchEntity>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "field", content = "name", rename_all = "snake_case")]
pub enum EntityField {
    Kind,
    PositionX,
    PositionY,
    Resource(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchEntityDelta {
    pub origin_id: OriginId,
    pub field:     EntityField,
    pub value_a:   FieldValue,
    pub value_b:   FieldValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchComparison {
    pub branch_a:       BranchId,
    pub branch_b:       BranchId,
    pub metrics_a:      AggregateMetrics,
    pub metrics_b:      AggregateMetrics,
    /// `b - a` per metric.
    pub metric_deltas:  MetricDeltas,
    pub entity_count_a: usize,
    pub entity_count_b: usize,
    pub detailed:       bool,
    pub only_in_a:      usize,
    pub only_in_b:      usize,
    pub in_both:        usize,
    pub diverged:       usize,
    pub entity_deltas:  Vec<BranchEntityDelta>,
    /// Filled in by the engine from the divergence evaluator.
    pub divergence:     f64,
}

impl BranchComparison {
    pub fn empty(branch_a: &str, branch_b: &str) -> Self {
        Self {
            branch_a:       branch_a.to_string(),
            branch_b:       branch_b.to_string(),
            metrics_a:      AggregateMetrics::default(),
            metrics_b:      AggregateMetrics::default(),
            metric_deltas:  MetricDeltas::default(),
            entity_count_a: 0,
            entity_count_b: 0,
            detailed:       false,
            only_in_a:      0,
            only_in_b:      0,
            in_both:        0,
            diverged:       0,
            entity_deltas:  Vec::new(),
            divergence:     0.0,
        }
    }

    pub fn entities_only_in_a(&self) -> usize { self.only_in_a }
    pub fn entities_only_in_b(&self) -> usize { self.only_in_b }

    /// Origin ids of every entity that differs between the two sides.
    pub fn diverged_entities(&self) -> Vec<OriginId> {
        let mut ids: Vec<OriginId> = self.entity_deltas.iter().map(|d| d.origin_id).collect();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BranchComparator {
    epsilon: f64,
}

impl BranchComparator {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon: epsilon.max(0.0) }
    }

    pub fn compare(&self, a: &BranchView<'_>, b: &BranchView<'_>, detailed: bool) -> BranchComparison {
        let mut out = BranchComparison::empty(&a.snapshot.branch_id, &b.snapshot.branch_id);
        out.metrics_a = a.snapshot.metrics;
        out.metrics_b = b.snapshot.metrics;
        out.metric_deltas = b.snapshot.metrics.delta_from(&a.snapshot.metrics);
        out.entity_count_a = a.snapshot.entity_count;
        out.entity_count_b = b.snapshot.entity_count;

        if !detailed {
            return out;
        }
        out.detailed = true;

        let mut left = a.entities.iter().peekable();
        let mut right = b.entities.iter().peekable();
        loop {
            let order = match (left.peek(), right.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((ka, _)), Some((kb, _))) => ka.cmp(kb),
            };
            match order {
                Ordering::Less => {
                    left.next();
                    out.only_in_a += 1;
                }
                Ordering::Greater => {
                    right.next();
                    out.only_in_b += 1;
                }
                Ordering::Equal => {
                    let (Some((_, ea)), Some((_, eb))) = (left.next(), right.next()) else {
                        break;
                    };
                    let deltas = self.entity_deltas(ea, eb);
                    if deltas.is_empty() {
                        out.in_both += 1;
                    } else {
                        out.diverged += 1;
                        out.entity_deltas.extend(deltas);
                    }
                }
            }
        }
        out
    }

    fn differs(&self, x: f64, y: f64) -> bool {
        (x - y).abs() > self.epsilon
    }

    /// One delta per tracked field that differs beyond epsilon.
    pub fn entity_deltas(&self, a: &BranchEntity, b: &BranchEntity) -> Vec<BranchEntityDelta> {
        let mut deltas = Vec::new();
        let origin_id = a.origin_id;

        if a.kind != b.kind {
            deltas.push(BranchEntityDelta {
                origin_id,
                field:   EntityField::Kind,
                value_a: FieldValue::Text(a.kind.clone()),
                value_b: FieldValue::Text(b.kind.clone()),
            });
        }
        if self.differs(a.position.x, b.position.x) {
            deltas.push(BranchEntityDelta {
                origin_id,
                field:   EntityField::PositionX,
                value_a: FieldValue::Number(a.position.x),
                value_b: FieldValue::Number(b.position.x),
            });
        }
        if self.differs(a.position.y, b.position.y) {
            deltas.push(BranchEntityDelta {
                origin_id,
                field:   EntityField::PositionY,
                value_a: FieldValue::Number(a.position.y),
                value_b: FieldValue::Number(b.position.y),
            });
        }

        // Union of resource names; a missing resource reads as 0.
        let mut names: Vec<&String> = a.resources.keys().chain(b.resources.keys()).collect();
        names.sort();
        names.dedup();
        for name in names {
            let (va, vb) = (a.resource(name), b.resource(name));
            if self.differs(va, vb) {
                deltas.push(BranchEntityDelta {
                    origin_id,
                    field:   EntityField::Resource(name.clone()),
                    value_a: FieldValue::Number(va),
                    value_b: FieldValue::Number(vb),
                });
            }
        }
        deltas
    }
}
