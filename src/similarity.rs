//! Similarity scoring between overlapping activities.
//!
//! similarity = (overlap / n_max) * distance_factor
//!
//! `n_max` is the point count of the activity that was indexed first, since
//! that count is not affected by downsampling of the later one. When both
//! activities are new the lower id was indexed first.

use std::collections::HashMap;

use log::{debug, info};

use crate::overlap::OverlapResult;
use crate::{ActivityId, SimilarityEdge};

/// Edges between saves-progress messages.
const SAVE_LOG_INTERVAL: usize = 10_000;

/// Ratio of the shorter to the longer distance; 1.0 when equal.
///
/// Penalizes a short track fully contained in a long one.
pub fn distance_factor(d_lo: f64, d_hi: f64) -> f64 {
    if d_lo == d_hi {
        1.0
    } else {
        d_lo.min(d_hi) / d_lo.max(d_hi)
    }
}

/// Normalized similarity for one pair.
pub fn similarity(overlap: u32, n_max: u32, distance_factor: f64) -> f64 {
    if overlap == 0 || n_max == 0 {
        return 0.0;
    }
    (overlap as f64 / n_max as f64) * distance_factor
}

/// Denominator for the pair `(lo, hi)`, `lo < hi`, given which side is new.
pub fn normalizing_count(
    lo: ActivityId,
    hi: ActivityId,
    lo_new: bool,
    hi_new: bool,
    result: &OverlapResult,
) -> u32 {
    if lo_new && !hi_new {
        // hi already existed so was indexed first
        result.points(hi)
    } else {
        // hi new and indexed last, or both new and ordered lo-hi
        result.points(lo)
    }
}

/// Score every affected pair that involves at least one new activity.
///
/// Pairs where either side lacks a positive distance are skipped, as are
/// pairs that never overlapped. Output is ordered by `(lo, hi)`.
pub fn score_edges(
    constraint: &str,
    result: &OverlapResult,
    distances: &HashMap<ActivityId, f64>,
) -> Vec<SimilarityEdge> {
    let known = |id: &ActivityId| distances.get(id).copied().filter(|d| *d > 0.0);

    let mut edges = Vec::new();
    for (&(lo, hi), &overlap) in &result.overlaps {
        let (lo_new, hi_new) = (result.is_new(lo), result.is_new(hi));
        if !(lo_new || hi_new) || overlap == 0 {
            continue;
        }
        let (Some(d_lo), Some(d_hi)) = (known(&lo), known(&hi)) else {
            debug!(
                "[Similarity] Skipping {}-{} for {}: no distance",
                lo, hi, constraint
            );
            continue;
        };
        let n_max = normalizing_count(lo, hi, lo_new, hi_new, result);
        edges.push(SimilarityEdge {
            constraint: constraint.to_string(),
            lo,
            hi,
            similarity: similarity(overlap, n_max, distance_factor(d_lo, d_hi)),
        });
        if edges.len() % SAVE_LOG_INTERVAL == 0 {
            info!("[Similarity] Scored {} for {}", edges.len(), constraint);
        }
    }
    if edges.len() % SAVE_LOG_INTERVAL != 0 {
        info!("[Similarity] Scored {} for {}", edges.len(), constraint);
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet};

    fn result(
        overlaps: &[((ActivityId, ActivityId), u32)],
        points: &[(ActivityId, u32)],
        new_ids: &[ActivityId],
    ) -> OverlapResult {
        let overlaps: BTreeMap<_, _> = overlaps.iter().copied().collect();
        let mut affected_ids: HashSet<ActivityId> = new_ids.iter().copied().collect();
        for &(lo, hi) in overlaps.keys() {
            affected_ids.insert(lo);
            affected_ids.insert(hi);
        }
        OverlapResult {
            overlaps,
            n_points: points.iter().copied().collect(),
            new_ids: new_ids.to_vec(),
            affected_ids,
        }
    }

    #[test]
    fn test_distance_factor() {
        assert_eq!(distance_factor(10.0, 10.0), 1.0);
        assert_eq!(distance_factor(5.0, 10.0), 0.5);
        assert_eq!(distance_factor(10.0, 5.0), 0.5);
        for (a, b) in [(1.0, 3.0), (7.5, 2.5), (0.1, 100.0)] {
            assert!(distance_factor(a, b) <= 1.0);
        }
    }

    #[test]
    fn test_similarity_monotonic_in_overlap() {
        assert_eq!(similarity(0, 5, 1.0), 0.0);
        let mut previous = 0.0;
        for overlap in 1..=10 {
            let s = similarity(overlap, 10, 0.8);
            assert!(s > previous);
            previous = s;
        }
    }

    #[test]
    fn test_three_of_five_shared() {
        // A rebuilt first, B new.
        let r = result(&[((1, 2), 3)], &[(1, 5), (2, 5)], &[2]);
        let distances = HashMap::from([(1, 10.0), (2, 10.0)]);
        let edges = score_edges("c", &r, &distances);

        assert_eq!(edges.len(), 1);
        assert_eq!((edges[0].lo, edges[0].hi), (1, 2));
        assert!((edges[0].similarity - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_denominator_is_first_indexed_activity() {
        // lo new, hi old: hi's count is used.
        let r = result(&[((1, 2), 4)], &[(1, 20), (2, 8)], &[1]);
        assert_eq!(normalizing_count(1, 2, true, false, &r), 8);
        // hi new, lo old: lo's count.
        assert_eq!(normalizing_count(1, 2, false, true, &r), 20);
        // Both new: lower id by convention.
        assert_eq!(normalizing_count(1, 2, true, true, &r), 20);

        let distances = HashMap::from([(1, 10.0), (2, 10.0)]);
        let edges = score_edges("c", &r, &distances);
        assert!((edges[0].similarity - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_skips_missing_or_zero_distance() {
        let r = result(
            &[((1, 2), 3), ((1, 3), 3), ((2, 3), 3)],
            &[(1, 5), (2, 5), (3, 5)],
            &[3],
        );
        let distances = HashMap::from([(1, 10.0), (2, 0.0)]);
        assert!(score_edges("c", &r, &distances).is_empty());
    }

    #[test]
    fn test_old_pairs_are_not_rescored() {
        let r = result(&[((1, 2), 3), ((2, 3), 2)], &[(1, 5), (2, 5), (3, 4)], &[3]);
        let distances = HashMap::from([(1, 10.0), (2, 20.0), (3, 10.0)]);
        let edges = score_edges("c", &r, &distances);

        assert_eq!(edges.len(), 1);
        assert_eq!((edges[0].lo, edges[0].hi), (2, 3));
        // 2/5 of lo's points, halved for the distance mismatch.
        assert!((edges[0].similarity - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_edges_are_ordered_pairs() {
        let r = result(
            &[((1, 4), 1), ((2, 4), 2), ((3, 4), 3)],
            &[(1, 3), (2, 3), (3, 3), (4, 3)],
            &[4],
        );
        let distances: HashMap<ActivityId, f64> = (1..=4).map(|id| (id, 5.0)).collect();
        for edge in score_edges("c", &r, &distances) {
            assert!(edge.lo < edge.hi);
            assert_eq!(edge.constraint, "c");
        }
    }
}
