//! # Nearby Engine
//!
//! Drives both stages for one constraint against a [`NearbyStore`].
//!
//! ## Stages
//!
//! 1. **Similarity**: index activities that already have edges, measure new
//!    ones against them, score and insert the new edges.
//! 2. **Clustering**: adaptive-radius DBSCAN over every edge of the
//!    constraint, replacing its groups.
//!
//! Each stage records a run marker on success. Similarity is skipped when no
//! activity of the group was loaded since its marker (unless forced);
//! clustering only runs when similarity completed more recently than the
//! last clustering.

use chrono::{DateTime, Utc};
use log::info;

use crate::clustering::{cluster_adaptive, ClusterParams, SimilarityGraph};
use crate::config::NearbyConfig;
use crate::error::Result;
use crate::overlap::{FractionSampler, KeepAll, OverlapCounter, PointSampler};
use crate::persistence::{insert_edges, replace_groups, NearbyStore, Stage};
use crate::similarity::score_edges;

/// What a stage did.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Nothing to do; stored results are current
    Skipped,
    /// Similarity ran
    Scored {
        new_activities: usize,
        edges: usize,
    },
    /// Clustering ran
    Clustered { groups: usize, epsilon: f64 },
}

/// Outcome of both stages.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub similarity: StageOutcome,
    pub clustering: StageOutcome,
}

/// Similarity and clustering for one constraint.
pub struct NearbyEngine {
    store: NearbyStore,
    config: NearbyConfig,
    force_start: Option<DateTime<Utc>>,
    force_finish: Option<DateTime<Utc>>,
}

impl NearbyEngine {
    /// Validates the configuration before anything touches the store.
    pub fn new(store: NearbyStore, config: NearbyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            force_start: None,
            force_finish: None,
        })
    }

    /// Limit forced recomputation to activities started in `[start, finish)`.
    pub fn with_force_range(
        mut self,
        start: Option<DateTime<Utc>>,
        finish: Option<DateTime<Utc>>,
    ) -> Self {
        self.force_start = start;
        self.force_finish = finish;
        self
    }

    pub fn config(&self) -> &NearbyConfig {
        &self.config
    }

    pub fn store(&self) -> &NearbyStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut NearbyStore {
        &mut self.store
    }

    pub fn into_store(self) -> NearbyStore {
        self.store
    }

    /// Similarity, then clustering.
    pub fn run(&mut self, force: bool) -> Result<RunOutcome> {
        let similarity = self.run_similarity(force)?;
        let clustering = self.run_clustering()?;
        Ok(RunOutcome {
            similarity,
            clustering,
        })
    }

    // ========================================================================
    // Similarity
    // ========================================================================

    /// Measure new activities and insert their edges.
    ///
    /// With `force`, edges of activities in the force range are deleted first
    /// so those activities are measured again.
    pub fn run_similarity(&mut self, force: bool) -> Result<StageOutcome> {
        let constraint = self.config.constraint.clone();

        if force {
            self.store.clear_marker(Stage::Similarity, &constraint)?;
            self.store
                .delete_edges_in_range(&constraint, self.force_start, self.force_finish)?;
        } else if let Some(marker) = self.store.marker(Stage::Similarity, &constraint)? {
            let loaded = self
                .store
                .activities_loaded_since(&self.config.activity_group, Some(marker))?;
            if loaded == 0 {
                info!("[Similarity] {} is current", constraint);
                return Ok(StageOutcome::Skipped);
            }
            info!(
                "[Similarity] {} activities loaded since last run of {}",
                loaded, constraint
            );
        }

        let old = self.store.positions(&self.config, false)?;
        let new = self.store.positions(&self.config, true)?;
        let distances = self.store.distances()?;

        let mut counter = OverlapCounter::new(self.config.border_degrees(), constraint.as_str());
        counter.prepare(old)?;
        let mut sampler = self.sampler();
        counter.count_overlaps(new, sampler.as_mut())?;
        let result = counter.into_result();

        let edges = score_edges(&constraint, &result, &distances);
        let n_edges = self
            .store
            .with_run_marker(Stage::Similarity, &constraint, |conn| {
                insert_edges(conn, &edges)
            })?;

        info!(
            "[Similarity] {}: {} new activities, {} edges",
            constraint,
            result.new_ids.len(),
            n_edges
        );
        Ok(StageOutcome::Scored {
            new_activities: result.new_ids.len(),
            edges: n_edges,
        })
    }

    fn sampler(&self) -> Box<dyn PointSampler> {
        if self.config.fraction >= 1.0 {
            Box::new(KeepAll)
        } else {
            Box::new(FractionSampler::new(
                self.config.fraction,
                self.config.sample_seed,
            ))
        }
    }

    // ========================================================================
    // Clustering
    // ========================================================================

    /// Regroup the constraint if similarity changed since the last grouping.
    pub fn run_clustering(&mut self) -> Result<StageOutcome> {
        let constraint = self.config.constraint.clone();

        let Some(similarity) = self.store.marker(Stage::Similarity, &constraint)? else {
            info!("[Nearby] No similarity data for {}", constraint);
            return Ok(StageOutcome::Skipped);
        };
        if let Some(clustering) = self.store.marker(Stage::Clustering, &constraint)? {
            if clustering >= similarity {
                info!("[Nearby] Groups for {} are current", constraint);
                return Ok(StageOutcome::Skipped);
            }
        }

        let edges = self.store.edges(&constraint)?;
        info!("[Nearby] Clustering {} edges for {}", edges.len(), constraint);
        let graph = SimilarityGraph::from_edges(&edges);
        let clustering = cluster_adaptive(&graph, &self.cluster_params());

        self.store
            .with_run_marker(Stage::Clustering, &constraint, |conn| {
                replace_groups(conn, &constraint, &clustering.groups)
            })?;

        Ok(StageOutcome::Clustered {
            groups: clustering.groups.len(),
            epsilon: clustering.epsilon,
        })
    }

    fn cluster_params(&self) -> ClusterParams {
        ClusterParams {
            min_points: self.config.min_points,
            epsilon_lo: self.config.epsilon_lo,
            epsilon_hi: self.config.epsilon_hi,
            iterations: self.config.epsilon_iterations,
        }
    }
}
