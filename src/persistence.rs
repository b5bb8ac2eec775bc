//! # Nearby Store
//!
//! SQLite storage shared by the similarity and clustering stages.
//!
//! ## Tables
//!
//! 1. **Inputs** (written by ingestion, read-only here):
//!    - `activities`: group, start time, total distance, load time
//!    - `positions`: timestamped longitude/latitude samples
//!
//! 2. **Outputs** (scoped by constraint):
//!    - `similarity`: one edge per `(constraint, lo, hi)`, `lo < hi`
//!    - `nearby`: group membership, at most one group per activity
//!
//! 3. **Bookkeeping**:
//!    - `run_markers`: last successful completion per `(stage, constraint)`

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::{epoch_seconds, parse_time, NearbyConfig};
use crate::error::{OptionExt, Result};
use crate::{ActivityId, NearbyGroup, PositionSample, SimilarityEdge};

/// Stages that record run markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Similarity,
    Clustering,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Similarity => "similarity",
            Stage::Clustering => "clustering",
        }
    }
}

/// SQLite-backed store for inputs, edges, groups and run markers.
pub struct NearbyStore {
    db: Connection,
}

impl NearbyStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) a database at the given path.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        Ok(Self { db })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Recorded activities (ingested elsewhere)
            CREATE TABLE IF NOT EXISTS activities (
                id INTEGER PRIMARY KEY,
                activity_group TEXT NOT NULL,
                start REAL NOT NULL,
                distance REAL,
                loaded_at INTEGER NOT NULL
            );

            -- Position samples, seconds since epoch
            CREATE TABLE IF NOT EXISTS positions (
                activity_id INTEGER NOT NULL,
                time REAL NOT NULL,
                longitude REAL NOT NULL,
                latitude REAL NOT NULL,
                FOREIGN KEY (activity_id) REFERENCES activities(id) ON DELETE CASCADE
            );

            -- Pairwise similarity edges
            CREATE TABLE IF NOT EXISTS similarity (
                constraint_name TEXT NOT NULL,
                lo INTEGER NOT NULL,
                hi INTEGER NOT NULL,
                similarity REAL NOT NULL,
                PRIMARY KEY (constraint_name, lo, hi),
                CHECK (lo < hi)
            );

            -- Nearby group membership
            CREATE TABLE IF NOT EXISTS nearby (
                constraint_name TEXT NOT NULL,
                grp INTEGER NOT NULL,
                activity_id INTEGER NOT NULL,
                PRIMARY KEY (constraint_name, activity_id)
            );

            -- Last successful run per stage, microseconds since epoch
            CREATE TABLE IF NOT EXISTS run_markers (
                owner TEXT NOT NULL,
                constraint_name TEXT NOT NULL,
                time INTEGER NOT NULL,
                PRIMARY KEY (owner, constraint_name)
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_positions_activity ON positions(activity_id, time);
            CREATE INDEX IF NOT EXISTS idx_activities_group ON activities(activity_group);
            CREATE INDEX IF NOT EXISTS idx_similarity_hi ON similarity(constraint_name, hi);

            -- Enable foreign keys
            PRAGMA foreign_keys = ON;
        "#,
        )?;
        Ok(())
    }

    /// Raw connection, for callers that need their own queries.
    pub fn connection(&self) -> &Connection {
        &self.db
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    /// Record (or update) an activity. `start` is a date or RFC 3339 time.
    pub fn add_activity(
        &mut self,
        id: ActivityId,
        activity_group: &str,
        start: &str,
        distance: Option<f64>,
    ) -> Result<()> {
        let start = epoch_seconds(parse_time(start)?);
        self.db.execute(
            "INSERT INTO activities (id, activity_group, start, distance, loaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 activity_group = excluded.activity_group,
                 start = excluded.start,
                 distance = excluded.distance,
                 loaded_at = excluded.loaded_at",
            params![id, activity_group, start, distance, Utc::now().timestamp_micros()],
        )?;
        Ok(())
    }

    /// Append position samples (in one transaction).
    pub fn add_positions(&mut self, samples: &[PositionSample]) -> Result<()> {
        let tx = self.db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO positions (activity_id, time, longitude, latitude)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for s in samples {
                stmt.execute(params![s.activity_id, s.timestamp, s.longitude, s.latitude])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Position samples inside the constraint's window and region, ordered
    /// by activity then time.
    ///
    /// With `new` set, only activities without any edge in the constraint are
    /// returned; otherwise only those with at least one.
    pub fn positions(&self, config: &NearbyConfig, new: bool) -> Result<Vec<PositionSample>> {
        let (start, finish) = config.window()?;
        let region = config.region();
        let membership = if new { "NOT IN" } else { "IN" };
        let sql = format!(
            "SELECT p.activity_id, p.time, p.longitude, p.latitude
             FROM positions p JOIN activities a ON a.id = p.activity_id
             WHERE a.activity_group = ?1
               AND p.time >= ?2 AND p.time < ?3
               AND p.latitude > ?4 AND p.latitude < ?5
               AND p.longitude > ?6 AND p.longitude < ?7
               AND p.activity_id {} (
                   SELECT lo FROM similarity WHERE constraint_name = ?8
                   UNION
                   SELECT hi FROM similarity WHERE constraint_name = ?8)
             ORDER BY p.activity_id, p.time",
            membership
        );
        let mut stmt = self.db.prepare(&sql)?;
        let samples = stmt
            .query_map(
                params![
                    config.activity_group,
                    epoch_seconds(start),
                    epoch_seconds(finish),
                    region.min().y,
                    region.max().y,
                    region.min().x,
                    region.max().x,
                    config.constraint,
                ],
                |row| {
                    Ok(PositionSample {
                        activity_id: row.get(0)?,
                        timestamp: row.get(1)?,
                        longitude: row.get(2)?,
                        latitude: row.get(3)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(samples)
    }

    /// Total distance of one activity, if known.
    pub fn distance(&self, id: ActivityId) -> Result<Option<f64>> {
        let distance: Option<Option<f64>> = self
            .db
            .query_row(
                "SELECT distance FROM activities WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(distance.flatten())
    }

    /// Every known total distance.
    pub fn distances(&self) -> Result<HashMap<ActivityId, f64>> {
        let mut stmt = self
            .db
            .prepare("SELECT id, distance FROM activities WHERE distance IS NOT NULL")?;
        let distances = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<HashMap<ActivityId, f64>>>()?;
        Ok(distances)
    }

    /// Activities of a group loaded after `time` (all of them if `None`).
    pub fn activities_loaded_since(
        &self,
        activity_group: &str,
        time: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        let since = time.map(|t| t.timestamp_micros()).unwrap_or(i64::MIN);
        let count: u32 = self.db.query_row(
            "SELECT COUNT(*) FROM activities WHERE activity_group = ?1 AND loaded_at > ?2",
            params![activity_group, since],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========================================================================
    // Similarity edges
    // ========================================================================

    pub fn edges(&self, constraint: &str) -> Result<Vec<SimilarityEdge>> {
        let mut stmt = self.db.prepare(
            "SELECT lo, hi, similarity FROM similarity
             WHERE constraint_name = ? ORDER BY lo, hi",
        )?;
        let edges = stmt
            .query_map(params![constraint], |row| {
                Ok(SimilarityEdge {
                    constraint: constraint.to_string(),
                    lo: row.get(0)?,
                    hi: row.get(1)?,
                    similarity: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Similarity of one pair, in either order.
    pub fn similarity(
        &self,
        constraint: &str,
        a: ActivityId,
        b: ActivityId,
    ) -> Result<Option<f64>> {
        let similarity = self
            .db
            .query_row(
                "SELECT similarity FROM similarity
                 WHERE constraint_name = ?1 AND lo = ?2 AND hi = ?3",
                params![constraint, a.min(b), a.max(b)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(similarity)
    }

    pub fn insert_edges(&self, edges: &[SimilarityEdge]) -> Result<usize> {
        insert_edges(&self.db, edges)
    }

    /// Delete every edge touching an activity that started in
    /// `[start, finish)`; either bound may be open.
    pub fn delete_edges_in_range(
        &self,
        constraint: &str,
        start: Option<DateTime<Utc>>,
        finish: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        warn!(
            "[Store] Deleting similarity data for {} from {:?} to {:?}",
            constraint, start, finish
        );
        let deleted = self.db.execute(
            "DELETE FROM similarity
             WHERE constraint_name = ?1
               AND (lo IN (SELECT id FROM activities
                           WHERE (?2 IS NULL OR start >= ?2) AND (?3 IS NULL OR start < ?3))
                    OR hi IN (SELECT id FROM activities
                              WHERE (?2 IS NULL OR start >= ?2) AND (?3 IS NULL OR start < ?3)))",
            params![
                constraint,
                start.map(epoch_seconds),
                finish.map(epoch_seconds),
            ],
        )?;
        info!("[Store] Deleted {} edges for {}", deleted, constraint);
        Ok(deleted)
    }

    // ========================================================================
    // Nearby groups
    // ========================================================================

    /// Groups of a constraint, ordered by group number.
    pub fn groups(&self, constraint: &str) -> Result<Vec<NearbyGroup>> {
        let mut stmt = self.db.prepare(
            "SELECT grp, activity_id FROM nearby
             WHERE constraint_name = ? ORDER BY grp, activity_id",
        )?;
        let rows = stmt
            .query_map(params![constraint], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, ActivityId>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut groups: Vec<NearbyGroup> = Vec::new();
        for (group, activity_id) in rows {
            match groups.last_mut() {
                Some(last) if last.group == group => last.activity_ids.push(activity_id),
                _ => groups.push(NearbyGroup {
                    constraint: constraint.to_string(),
                    group,
                    activity_ids: vec![activity_id],
                }),
            }
        }
        Ok(groups)
    }

    /// Group number of an activity, if it belongs to one.
    pub fn group_of(&self, constraint: &str, activity_id: ActivityId) -> Result<Option<u32>> {
        let group = self
            .db
            .query_row(
                "SELECT grp FROM nearby WHERE constraint_name = ?1 AND activity_id = ?2",
                params![constraint, activity_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(group)
    }

    pub fn replace_groups(&self, constraint: &str, groups: &[Vec<ActivityId>]) -> Result<usize> {
        replace_groups(&self.db, constraint, groups)
    }

    // ========================================================================
    // Run markers
    // ========================================================================

    pub fn marker(&self, stage: Stage, constraint: &str) -> Result<Option<DateTime<Utc>>> {
        let micros: Option<i64> = self
            .db
            .query_row(
                "SELECT time FROM run_markers WHERE owner = ?1 AND constraint_name = ?2",
                params![stage.as_str(), constraint],
                |row| row.get(0),
            )
            .optional()?;
        micros
            .map(|m| DateTime::from_timestamp_micros(m).ok_or_internal("marker time out of range"))
            .transpose()
    }

    pub fn clear_marker(&self, stage: Stage, constraint: &str) -> Result<()> {
        self.db.execute(
            "DELETE FROM run_markers WHERE owner = ?1 AND constraint_name = ?2",
            params![stage.as_str(), constraint],
        )?;
        Ok(())
    }

    /// Run `work` and record a marker only if it succeeds.
    ///
    /// The old marker is cleared (and committed) first. `work` and the new
    /// marker share one transaction, so a failure leaves neither partial
    /// writes nor a marker behind.
    pub fn with_run_marker<T, F>(&mut self, stage: Stage, constraint: &str, work: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        self.clear_marker(stage, constraint)?;
        let tx = self.db.transaction()?;
        let value = work(&tx)?;
        tx.execute(
            "INSERT INTO run_markers (owner, constraint_name, time) VALUES (?1, ?2, ?3)",
            params![stage.as_str(), constraint, Utc::now().timestamp_micros()],
        )?;
        tx.commit()?;
        Ok(value)
    }
}

/// Insert edges on any connection (typically an open transaction).
pub fn insert_edges(conn: &Connection, edges: &[SimilarityEdge]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO similarity (constraint_name, lo, hi, similarity) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for edge in edges {
        stmt.execute(params![edge.constraint, edge.lo, edge.hi, edge.similarity])?;
    }
    Ok(edges.len())
}

/// Replace every group of a constraint; group numbers follow slice order.
pub fn replace_groups(
    conn: &Connection,
    constraint: &str,
    groups: &[Vec<ActivityId>],
) -> Result<usize> {
    conn.execute(
        "DELETE FROM nearby WHERE constraint_name = ?",
        params![constraint],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO nearby (constraint_name, grp, activity_id) VALUES (?1, ?2, ?3)",
    )?;
    let mut n = 0;
    for (i, group) in groups.iter().enumerate() {
        info!("[Nearby] Group {} has {} members", i, group.len());
        for activity_id in group {
            stmt.execute(params![constraint, i as u32, activity_id])?;
            n += 1;
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NearbyConfig {
        NearbyConfig {
            constraint: "c".to_string(),
            activity_group: "Bike".to_string(),
            latitude: 43.0,
            longitude: -3.0,
            height: 2.0,
            width: 2.0,
            ..NearbyConfig::default()
        }
    }

    fn store_with_tracks() -> NearbyStore {
        let mut store = NearbyStore::in_memory().unwrap();
        store.add_activity(2, "Bike", "2020-01-02", Some(10.0)).unwrap();
        store.add_activity(1, "Bike", "2020-01-01", Some(20.0)).unwrap();
        store.add_activity(3, "Run", "2020-01-03", None).unwrap();
        let mut samples = Vec::new();
        for id in [2, 1, 3] {
            for i in 0..3 {
                let lon = -3.0 + i as f64 * 0.1;
                samples.push(PositionSample::new(id, 1.6e9 + i as f64, lon, 43.0));
            }
        }
        // Outside the region.
        samples.push(PositionSample::new(1, 1.6e9 + 10.0, 10.0, 43.0));
        store.add_positions(&samples).unwrap();
        store
    }

    fn edge(lo: ActivityId, hi: ActivityId, similarity: f64) -> SimilarityEdge {
        SimilarityEdge {
            constraint: "c".to_string(),
            lo,
            hi,
            similarity,
        }
    }

    #[test]
    fn test_positions_filtered_and_ordered() {
        let store = store_with_tracks();
        let samples = store.positions(&config(), true).unwrap();
        let ids: Vec<ActivityId> = samples.iter().map(|s| s.activity_id).collect();
        assert_eq!(ids, vec![1, 1, 1, 2, 2, 2]);
        assert!(store.positions(&config(), false).unwrap().is_empty());
    }

    #[test]
    fn test_positions_split_by_existing_edges() {
        let store = store_with_tracks();
        store.insert_edges(&[edge(1, 5, 0.5)]).unwrap();

        let old = store.positions(&config(), false).unwrap();
        assert!(old.iter().all(|s| s.activity_id == 1));
        let new = store.positions(&config(), true).unwrap();
        assert!(new.iter().all(|s| s.activity_id == 2));
    }

    #[test]
    fn test_distances() {
        let store = store_with_tracks();
        assert_eq!(store.distance(1).unwrap(), Some(20.0));
        assert_eq!(store.distance(3).unwrap(), None);
        assert_eq!(store.distance(99).unwrap(), None);
        let distances = store.distances().unwrap();
        assert_eq!(distances.len(), 2);
    }

    #[test]
    fn test_edges_reject_bad_pairs() {
        let store = NearbyStore::in_memory().unwrap();
        assert!(store.insert_edges(&[edge(2, 2, 0.1)]).is_err());
        assert!(store.insert_edges(&[edge(3, 2, 0.1)]).is_err());
        store.insert_edges(&[edge(2, 3, 0.1)]).unwrap();
        assert!(store.insert_edges(&[edge(2, 3, 0.2)]).is_err());
        assert_eq!(store.similarity("c", 3, 2).unwrap(), Some(0.1));
    }

    #[test]
    fn test_delete_edges_in_range() {
        let store = store_with_tracks();
        store
            .insert_edges(&[edge(1, 2, 0.5), edge(2, 3, 0.4), edge(1, 3, 0.3)])
            .unwrap();

        let start = parse_time("2020-01-02").ok();
        let finish = parse_time("2020-01-03").ok();
        let deleted = store.delete_edges_in_range("c", start, finish).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.edges("c").unwrap(), vec![edge(1, 3, 0.3)]);

        assert_eq!(store.delete_edges_in_range("c", None, None).unwrap(), 1);
    }

    #[test]
    fn test_replace_groups() {
        let store = NearbyStore::in_memory().unwrap();
        store.replace_groups("c", &[vec![1, 2, 3], vec![7, 8, 9]]).unwrap();
        store.replace_groups("other", &[vec![1, 2, 3]]).unwrap();
        store.replace_groups("c", &[vec![4, 5, 6]]).unwrap();

        let groups = store.groups("c").unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].activity_ids, vec![4, 5, 6]);
        assert_eq!(store.group_of("c", 5).unwrap(), Some(0));
        assert_eq!(store.group_of("c", 1).unwrap(), None);
        assert_eq!(store.groups("other").unwrap().len(), 1);

        // An activity cannot be in two groups of one constraint.
        assert!(store.replace_groups("c", &[vec![1, 2], vec![2, 3]]).is_err());
    }

    #[test]
    fn test_run_marker_commits_on_success() {
        let mut store = NearbyStore::in_memory().unwrap();
        assert!(store.marker(Stage::Similarity, "c").unwrap().is_none());

        let n = store
            .with_run_marker(Stage::Similarity, "c", |conn| {
                insert_edges(conn, &[edge(1, 2, 0.5)])
            })
            .unwrap();
        assert_eq!(n, 1);
        assert!(store.marker(Stage::Similarity, "c").unwrap().is_some());
        assert!(store.marker(Stage::Clustering, "c").unwrap().is_none());
        assert!(store.marker(Stage::Similarity, "other").unwrap().is_none());
    }

    #[test]
    fn test_run_marker_rolls_back_on_failure() {
        let mut store = NearbyStore::in_memory().unwrap();
        store
            .with_run_marker(Stage::Similarity, "c", |_| Ok(()))
            .unwrap();

        let result = store.with_run_marker(Stage::Similarity, "c", |conn| {
            insert_edges(conn, &[edge(1, 2, 0.5)])?;
            insert_edges(conn, &[edge(1, 2, 0.6)])
        });
        assert!(result.is_err());
        assert!(store.marker(Stage::Similarity, "c").unwrap().is_none());
        assert!(store.edges("c").unwrap().is_empty());
    }

    #[test]
    fn test_activities_loaded_since() {
        let store = store_with_tracks();
        assert_eq!(store.activities_loaded_since("Bike", None).unwrap(), 2);
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.activities_loaded_since("Bike", Some(later)).unwrap(), 0);
    }

    #[test]
    fn test_file_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nearby.db");
        let path = path.to_str().unwrap();
        {
            let store = NearbyStore::new(path).unwrap();
            store.insert_edges(&[edge(1, 2, 0.5)]).unwrap();
        }
        let store = NearbyStore::new(path).unwrap();
        assert_eq!(store.edges("c").unwrap().len(), 1);
    }
}
