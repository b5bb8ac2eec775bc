//! # Nearby Activities
//!
//! Geographic similarity between recorded activities and grouping of similar
//! activities into "nearby" sets.
//!
//! This library provides:
//! - An R-tree overlap index over GPS positions
//! - Incremental overlap counting (new activities against already-indexed ones)
//! - Normalized pairwise similarity, persisted as edges
//! - Adaptive-radius DBSCAN over the similarity graph, persisted as groups
//!
//! Everything is scoped by a *constraint* (a named region, time window and
//! activity group) so independent configurations never interfere.
//!
//! ## Quick Start
//!
//! ```rust
//! use nearby_activities::{NearbyConfig, NearbyEngine, NearbyStore, PositionSample};
//!
//! let mut store = NearbyStore::in_memory().unwrap();
//! for id in 1..=3 {
//!     store.add_activity(id, "Bike", "2020-01-01T10:00:00Z", Some(1000.0)).unwrap();
//!     let samples: Vec<PositionSample> = (0..10)
//!         .map(|i| PositionSample::new(id, 1.577e9 + i as f64, -2.9 + i as f64 * 0.01, 43.3))
//!         .collect();
//!     store.add_positions(&samples).unwrap();
//! }
//!
//! let config = NearbyConfig {
//!     activity_group: "Bike".to_string(),
//!     latitude: 43.3,
//!     longitude: -2.9,
//!     height: 1.0,
//!     width: 1.0,
//!     ..NearbyConfig::default()
//! };
//! let mut engine = NearbyEngine::new(store, config).unwrap();
//! engine.run(false).unwrap();
//!
//! let groups = engine.store().groups("default").unwrap();
//! assert_eq!(groups.len(), 1);
//! assert_eq!(groups[0].activity_ids, vec![1, 2, 3]);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{NearbyError, OptionExt, Result};

// Per-constraint configuration
pub mod config;
pub use config::NearbyConfig;

// R-tree overlap index
pub mod spatial_index;
pub use spatial_index::{IndexedPoint, SpatialIndex};

// Overlap counting between new and indexed activities
pub mod overlap;
pub use overlap::{FractionSampler, KeepAll, OverlapCounter, OverlapResult, PointSampler};

// Similarity scoring
pub mod similarity;
pub use similarity::{distance_factor, score_edges};

// Density clustering and the radius search driving it
pub mod dbscan;
pub mod search;
pub mod clustering;
pub use clustering::{cluster_adaptive, ClusterParams, Clustering, SimilarityGraph};

// SQLite storage for edges, groups and run markers
pub mod persistence;
pub use persistence::{NearbyStore, Stage};

// Both stages, gated by run markers
pub mod engine;
pub use engine::{NearbyEngine, RunOutcome, StageOutcome};

// ============================================================================
// Core Types
// ============================================================================

/// Identifier of a recorded activity (activity journal).
pub type ActivityId = i64;

/// One recorded position of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub activity_id: ActivityId,
    /// Seconds since the epoch
    pub timestamp: f64,
    pub longitude: f64,
    pub latitude: f64,
}

impl PositionSample {
    pub fn new(activity_id: ActivityId, timestamp: f64, longitude: f64, latitude: f64) -> Self {
        Self {
            activity_id,
            timestamp,
            longitude,
            latitude,
        }
    }

    /// `[longitude, latitude]`, the index's coordinate order.
    pub fn position(&self) -> [f64; 2] {
        [self.longitude, self.latitude]
    }
}

/// Similarity between two activities within a constraint. `lo < hi`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    pub constraint: String,
    pub lo: ActivityId,
    pub hi: ActivityId,
    pub similarity: f64,
}

/// A group of nearby activities within a constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyGroup {
    pub constraint: String,
    /// Discovery order of the last clustering run, from 0
    pub group: u32,
    pub activity_ids: Vec<ActivityId>,
}
