//! Incremental overlap counting between activities.
//!
//! ## Algorithm
//! 1. Rebuild: insert the points of every activity that already has edges,
//!    without querying.
//! 2. For each new activity (ascending id), query every one of its points
//!    against the index and count each distinct matched position once per
//!    matched activity.
//! 3. Only then insert the new activity's points, so later new activities
//!    see them but the activity never matches itself.
//!
//! Cost is one index query per new point instead of a scan over all pairs.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{NearbyError, Result};
use crate::spatial_index::{IndexedPoint, SpatialIndex};
use crate::{ActivityId, PositionSample};

/// Points between progress messages while rebuilding.
const REBUILD_LOG_INTERVAL: usize = 30_000;
/// Points between progress messages while measuring new activities.
const MEASURE_LOG_INTERVAL: usize = 10_000;

/// Decides which of a new activity's points take part in the comparison.
pub trait PointSampler {
    fn keep(&mut self) -> bool;
}

/// Keep every point (fraction = 1, fully reproducible).
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepAll;

impl PointSampler for KeepAll {
    fn keep(&mut self) -> bool {
        true
    }
}

/// Keep each point independently with probability `fraction`.
#[derive(Debug, Clone)]
pub struct FractionSampler {
    fraction: f64,
    rng: StdRng,
}

impl FractionSampler {
    pub fn new(fraction: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { fraction, rng }
    }
}

impl PointSampler for FractionSampler {
    fn keep(&mut self) -> bool {
        self.fraction >= 1.0 || self.rng.gen::<f64>() < self.fraction
    }
}

/// Everything the similarity scorer needs from a counting run.
#[derive(Debug, Default, Clone)]
pub struct OverlapResult {
    /// `(lo, hi)` with `lo < hi` -> distinct matched positions
    pub overlaps: BTreeMap<(ActivityId, ActivityId), u32>,
    /// Points inserted into the index, per activity, across both passes
    pub n_points: HashMap<ActivityId, u32>,
    /// New activities, in processing order
    pub new_ids: Vec<ActivityId>,
    /// New activities plus every activity one of them overlapped
    pub affected_ids: HashSet<ActivityId>,
}

impl OverlapResult {
    pub fn overlap(&self, a: ActivityId, b: ActivityId) -> u32 {
        self.overlaps
            .get(&(a.min(b), a.max(b)))
            .copied()
            .unwrap_or(0)
    }

    pub fn points(&self, id: ActivityId) -> u32 {
        self.n_points.get(&id).copied().unwrap_or(0)
    }

    pub fn is_new(&self, id: ActivityId) -> bool {
        self.new_ids.binary_search(&id).is_ok()
    }
}

/// Run-local overlap counter; discarded after each run.
pub struct OverlapCounter {
    index: SpatialIndex<f64>,
    result: OverlapResult,
    label: String,
}

impl OverlapCounter {
    /// `border` is the match tolerance in degrees; `label` only tags log output.
    pub fn new(border: f64, label: impl Into<String>) -> Self {
        Self {
            index: SpatialIndex::new(border),
            result: OverlapResult::default(),
            label: label.into(),
        }
    }

    /// Seed the index with already-processed activities. Samples must be
    /// ordered by activity id.
    pub fn prepare<I>(&mut self, samples: I) -> Result<()>
    where
        I: IntoIterator<Item = PositionSample>,
    {
        let mut points = Vec::new();
        let mut previous: Option<ActivityId> = None;
        for sample in samples {
            check_order(&mut previous, sample.activity_id)?;
            *self.result.n_points.entry(sample.activity_id).or_insert(0) += 1;
            points.push(IndexedPoint {
                activity_id: sample.activity_id,
                position: sample.position(),
            });
            if points.len() % REBUILD_LOG_INTERVAL == 0 {
                info!("[Similarity] Loaded {} points for {}", points.len(), self.label);
            }
        }
        let n = points.len();
        if n % REBUILD_LOG_INTERVAL != 0 {
            info!("[Similarity] Loaded {} points for {}", n, self.label);
        }

        if self.index.is_empty() {
            self.index = SpatialIndex::bulk_load(self.index.border(), points);
        } else {
            for point in points {
                self.index.insert(point.position, point.activity_id);
            }
        }
        Ok(())
    }

    /// Measure new activities against everything indexed so far. Samples must
    /// be grouped and ordered by activity id.
    pub fn count_overlaps<I, S>(&mut self, samples: I, sampler: &mut S) -> Result<()>
    where
        I: IntoIterator<Item = PositionSample>,
        S: PointSampler + ?Sized,
    {
        let mut n = 0;
        let mut n_overlaps = 0;
        let mut previous: Option<ActivityId> = None;
        let mut batch: Vec<PositionSample> = Vec::new();

        for sample in samples {
            if previous != Some(sample.activity_id) {
                check_order(&mut previous, sample.activity_id)?;
                let processed = self.measure_activity(&batch, &mut n_overlaps);
                n = self.log_progress(n, processed, n_overlaps);
                batch.clear();
            }
            if sampler.keep() {
                batch.push(sample);
            }
            previous = Some(sample.activity_id);
            self.note_new(sample.activity_id);
        }
        let processed = self.measure_activity(&batch, &mut n_overlaps);
        n = self.log_progress(n, processed, n_overlaps);
        if n % MEASURE_LOG_INTERVAL != 0 {
            info!(
                "[Similarity] Measured {} points for {} ({} overlaps)",
                n, self.label, n_overlaps
            );
        }
        Ok(())
    }

    pub fn result(&self) -> &OverlapResult {
        &self.result
    }

    pub fn into_result(self) -> OverlapResult {
        self.result
    }

    fn note_new(&mut self, id: ActivityId) {
        if self.result.new_ids.last() != Some(&id) {
            self.result.new_ids.push(id);
            self.result.affected_ids.insert(id);
        }
    }

    /// Query then insert one new activity's (already sampled) points.
    fn measure_activity(&mut self, points: &[PositionSample], n_overlaps: &mut usize) -> usize {
        let Some(first) = points.first() else {
            return 0;
        };
        let id = first.activity_id;
        let mut seen: HashSet<(ActivityId, u64, u64)> = HashSet::new();

        for sample in points {
            for other in self.index.query(sample.position()) {
                let key = (
                    other.activity_id,
                    other.position[0].to_bits(),
                    other.position[1].to_bits(),
                );
                if seen.insert(key) {
                    let pair = (id.min(other.activity_id), id.max(other.activity_id));
                    *self.result.overlaps.entry(pair).or_insert(0) += 1;
                    self.result.affected_ids.insert(other.activity_id);
                    *n_overlaps += 1;
                }
            }
        }
        for sample in points {
            self.insert(sample);
        }
        points.len()
    }

    fn insert(&mut self, sample: &PositionSample) {
        self.index.insert(sample.position(), sample.activity_id);
        *self.result.n_points.entry(sample.activity_id).or_insert(0) += 1;
    }

    fn log_progress(&self, before: usize, processed: usize, n_overlaps: usize) -> usize {
        let after = before + processed;
        if after / MEASURE_LOG_INTERVAL > before / MEASURE_LOG_INTERVAL {
            info!(
                "[Similarity] Measured {} points for {} ({} overlaps)",
                after, self.label, n_overlaps
            );
        }
        after
    }
}

fn check_order(previous: &mut Option<ActivityId>, next: ActivityId) -> Result<()> {
    if let Some(prev) = *previous {
        if next < prev {
            return Err(NearbyError::UnorderedStream {
                previous: prev,
                next,
            });
        }
    }
    *previous = Some(next);
    Ok(())
}
