//! Divergence and ranking scores.
//!
//! Pure functions over already-materialized comparison data. Nothing here
//! touches an arena or the registry.

use crate::{
    comparator::BranchComparison,
    config::{DivergenceWeights, ScoreWeights},
    snapshot::MetricDeltas,
};

/// `|a - b|` scaled into [0, 1] by the larger magnitude (floored at 1 so
/// tiny values do not blow up).
pub fn normalized_difference(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs()).max(1.0);
    ((a - b).abs() / scale).clamp(0.0, 1.0)
}

/// Weighted sum of the normalized aggregate differences.
pub fn metric_divergence(comparison: &BranchComparison, weights: &DivergenceWeights) -> f64 {
    let a = &comparison.metrics_a;
    let b = &comparison.metrics_b;
    weights.resource * normalized_difference(a.resources, b.resources)
        + weights.population * normalized_difference(a.population, b.population)
        + weights.military * normalized_difference(a.military, b.military)
        + weights.happiness * normalized_difference(a.happiness, b.happiness)
}

/// Share of entities that are missing on one side or differ, over every
/// entity seen on either side. `in_both` counts only unchanged entities.
pub fn entity_divergence(comparison: &BranchComparison) -> f64 {
    let changed = comparison.only_in_a + comparison.only_in_b + comparison.diverged;
    let universe = (changed + comparison.in_both).max(1);
    changed as f64 / universe as f64
}

/// Divergence score in [0, 1]. Aggregate change and entity-population
/// change count equally.
pub fn calculate_divergence(comparison: &BranchComparison, weights: &DivergenceWeights) -> f64 {
    let score = (metric_divergence(comparison, weights) + entity_divergence(comparison)) / 2.0;
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 1.0)
}

/// Unbounded linear ranking score. Positive means better than baseline.
pub fn calculate_overall_score(deltas: &MetricDeltas, weights: &ScoreWeights) -> f64 {
    deltas.resources * weights.resources
        + deltas.population * weights.population
        + deltas.happiness * weights.happiness
        + deltas.military * weights.military
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::AggregateMetrics;

    fn comparison(
        a: AggregateMetrics,
        b: AggregateMetrics,
        counts: (usize, usize, usize, usize),
    ) -> BranchComparison {
        let mut c = BranchComparison::empty("a", "b");
        c.metrics_a = a;
        c.metrics_b = b;
        c.only_in_a = counts.0;
        c.only_in_b = counts.1;
        c.in_both = counts.2;
        c.diverged = counts.3;
        c
    }

    #[test]
    fn identical_branches_score_zero() {
        let m = AggregateMetrics { population: 10.0, resources: 500.0, happiness: 0.6, military: 3.0 };
        let c = comparison(m, m, (0, 0, 10, 0));
        assert_eq!(calculate_divergence(&c, &DivergenceWeights::default()), 0.0);
    }

    #[test]
    fn extreme_inputs_stay_in_unit_range() {
        let a = AggregateMetrics { population: 1e12, resources: -1e12, happiness: 0.0, military: 1e9 };
        let b = AggregateMetrics { population: 0.0, resources: 1e12, happiness: 1.0, military: 0.0 };
        let weights = [
            DivergenceWeights { resource: 1.0, population: 0.0, military: 0.0, happiness: 0.0 },
            DivergenceWeights { resource: 0.0, population: 0.0, military: 0.0, happiness: 0.0 },
            DivergenceWeights::default(),
            DivergenceWeights { resource: 1.0, population: 1.0, military: 1.0, happiness: 1.0 },
        ];
        for w in &weights {
            for counts in [(0, 0, 0, 0), (5, 5, 0, 0), (0, 0, 3, 3), (1, 2, 3, 9)] {
                let score = calculate_divergence(&comparison(a, b, counts), w);
                assert!((0.0..=1.0).contains(&score), "score {score} out of range for {w:?} {counts:?}");
            }
        }
    }

    #[test]
    fn entity_term_counts_one_sided_and_diverged() {
        let m = AggregateMetrics::default();
        // 2 only in A, 2 only in B, 4 unchanged, 2 diverged -> 6 / 10
        let c = comparison(m, m, (2, 2, 4, 2));
        assert!((entity_divergence(&c) - 0.6).abs() < 1e-12);
        assert!((calculate_divergence(&c, &DivergenceWeights::default()) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn overall_score_is_not_clamped() {
        let deltas = MetricDeltas { population: 1_000.0, resources: 0.0, happiness: 0.0, military: 0.0 };
        let score = calculate_overall_score(&deltas, &ScoreWeights::default());
        assert_eq!(score, 1_000.0);

        let worse = MetricDeltas { population: -5.0, ..MetricDeltas::default() };
        assert!(calculate_overall_score(&worse, &ScoreWeights::default()) < 0.0);
    }
}
