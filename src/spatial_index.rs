//! R-tree indexed positions and overlap queries.
//!
//! Each stored position is a degenerate box tagged with its owning activity.
//! A query matches every stored position whose box, grown by `border`,
//! intersects the query position's box grown by the same `border`. For
//! points that reduces to `|dx| <= 2 * border && |dy| <= 2 * border`.

use rstar::{RTree, RTreeNum, RTreeObject, AABB};

use crate::ActivityId;

/// A position in the index together with the activity that recorded it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedPoint<T: RTreeNum> {
    pub activity_id: ActivityId,
    /// `[x, y]`, i.e. `[longitude, latitude]` for GPS data
    pub position: [T; 2],
}

impl<T: RTreeNum> RTreeObject for IndexedPoint<T> {
    type Envelope = AABB<[T; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

/// Spatial index answering "which stored positions overlap this one".
///
/// Coincident positions are never merged: two activities that visit the
/// same spot are both returned by a query there.
///
/// # Example
/// ```
/// use nearby_activities::spatial_index::SpatialIndex;
///
/// let mut index = SpatialIndex::new(1);
/// index.insert([0, 0], 1);
/// index.insert([0, 0], 2);
/// index.insert([10, 10], 3);
///
/// let ids: Vec<_> = index.query([1, 1]).map(|p| p.activity_id).collect();
/// assert_eq!(ids.len(), 2);
/// ```
#[derive(Debug)]
pub struct SpatialIndex<T: RTreeNum> {
    tree: RTree<IndexedPoint<T>>,
    border: T,
}

impl<T: RTreeNum> SpatialIndex<T> {
    /// Create an empty index with the given match tolerance.
    pub fn new(border: T) -> Self {
        Self {
            tree: RTree::new(),
            border,
        }
    }

    /// Bulk-load an index (faster than repeated inserts for a rebuild).
    pub fn bulk_load(border: T, points: Vec<IndexedPoint<T>>) -> Self {
        Self {
            tree: RTree::bulk_load(points),
            border,
        }
    }

    pub fn border(&self) -> T {
        self.border
    }

    /// Store a position recorded by `activity_id`.
    pub fn insert(&mut self, position: [T; 2], activity_id: ActivityId) {
        self.tree.insert(IndexedPoint {
            activity_id,
            position,
        });
    }

    /// All stored positions overlapping `position`, including those on the
    /// boundary of the tolerance box.
    pub fn query(&self, position: [T; 2]) -> impl Iterator<Item = &IndexedPoint<T>> {
        self.tree.locate_in_envelope_intersecting(&self.search_envelope(position))
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    fn search_envelope(&self, position: [T; 2]) -> AABB<[T; 2]> {
        // Both boxes are grown by the border, so their separation may be twice it.
        let reach = self.border + self.border;
        AABB::from_corners(
            [position[0] - reach, position[1] - reach],
            [position[0] + reach, position[1] + reach],
        )
    }
}
