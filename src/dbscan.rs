//! Density-based clustering (DBSCAN) over an abstract neighbourhood.
//!
//! Nodes only need an ordering and hashing; distances live behind the
//! [`Neighbourhood`] trait so the same code clusters a similarity graph or a
//! synthetic integer grid.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Neighbour lookup at a given radius.
pub trait Neighbourhood {
    type Node: Copy + Ord + Hash;

    /// Every other node strictly closer than `epsilon` to `node`.
    fn neighbours(&self, node: Self::Node, epsilon: f64) -> Vec<Self::Node>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Noise,
    Cluster(usize),
}

/// DBSCAN with a fixed radius and core point threshold.
///
/// # Example
/// ```
/// use nearby_activities::dbscan::{Dbscan, Neighbourhood};
///
/// struct Line;
/// impl Neighbourhood for Line {
///     type Node = i32;
///     fn neighbours(&self, node: i32, epsilon: f64) -> Vec<i32> {
///         [0, 1, 2, 10, 11, 12, 50]
///             .into_iter()
///             .filter(|&n| n != node && ((n - node).abs() as f64) < epsilon)
///             .collect()
///     }
/// }
///
/// let groups = Dbscan::new(1.5, 3).run(&Line, vec![50, 12, 11, 10, 2, 1, 0]);
/// assert_eq!(groups, vec![vec![0, 1, 2], vec![10, 11, 12]]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Dbscan {
    pub epsilon: f64,
    pub min_points: usize,
}

impl Dbscan {
    pub fn new(epsilon: f64, min_points: usize) -> Self {
        Self {
            epsilon,
            min_points,
        }
    }

    /// Cluster `candidates`, visiting them in ascending order.
    ///
    /// Groups are returned in discovery order with sorted members. Nodes
    /// reachable from no core point are left out.
    pub fn run<G: Neighbourhood>(
        &self,
        graph: &G,
        mut candidates: Vec<G::Node>,
    ) -> Vec<Vec<G::Node>> {
        candidates.sort_unstable();
        candidates.dedup();

        let mut labels: HashMap<G::Node, Label> = HashMap::with_capacity(candidates.len());
        let mut groups: Vec<Vec<G::Node>> = Vec::new();

        for candidate in candidates {
            if labels.contains_key(&candidate) {
                continue;
            }
            let neighbours = graph.neighbours(candidate, self.epsilon);
            if !self.is_core(&neighbours) {
                labels.insert(candidate, Label::Noise);
                continue;
            }

            let cluster = groups.len();
            let mut members = vec![candidate];
            labels.insert(candidate, Label::Cluster(cluster));

            let mut queue: VecDeque<G::Node> = neighbours.into();
            while let Some(node) = queue.pop_front() {
                match labels.get(&node).copied() {
                    Some(Label::Cluster(_)) => continue,
                    Some(Label::Noise) => {
                        // Border point: joins but does not expand.
                        labels.insert(node, Label::Cluster(cluster));
                        members.push(node);
                        continue;
                    }
                    None => {}
                }
                labels.insert(node, Label::Cluster(cluster));
                members.push(node);

                let expansion = graph.neighbours(node, self.epsilon);
                if self.is_core(&expansion) {
                    queue.extend(
                        expansion
                            .into_iter()
                            .filter(|n| !matches!(labels.get(n), Some(Label::Cluster(_)))),
                    );
                }
            }

            members.sort_unstable();
            groups.push(members);
        }

        groups
    }

    fn is_core<N>(&self, neighbours: &[N]) -> bool {
        neighbours.len() + 1 >= self.min_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Integer positions on a line, distance = absolute difference.
    struct Grid(Vec<i64>);

    impl Neighbourhood for Grid {
        type Node = i64;

        fn neighbours(&self, node: i64, epsilon: f64) -> Vec<i64> {
            self.0
                .iter()
                .copied()
                .filter(|&n| n != node && ((n - node).abs() as f64) < epsilon)
                .collect()
        }
    }

    #[test]
    fn test_two_clusters_and_noise() {
        let grid = Grid(vec![0, 1, 2, 3, 20, 21, 22, 50]);
        let groups = Dbscan::new(1.5, 3).run(&grid, grid.0.clone());
        assert_eq!(groups, vec![vec![0, 1, 2, 3], vec![20, 21, 22]]);
    }

    #[test]
    fn test_border_point_joins_without_expanding() {
        // 4 is reachable from 2 but is not core itself, so 7 stays out.
        let grid = Grid(vec![0, 1, 2, 4, 7]);
        let groups = Dbscan::new(2.5, 3).run(&grid, grid.0.clone());
        assert_eq!(groups, vec![vec![0, 1, 2, 4]]);
    }

    #[test]
    fn test_noise_later_claimed_as_border() {
        // 10 is visited first and is noise, then absorbed by the dense run.
        let grid = Grid(vec![10, 12, 13, 14]);
        let groups = Dbscan::new(2.5, 4).run(&grid, vec![14, 13, 12, 10]);
        assert_eq!(groups, vec![vec![10, 12, 13, 14]]);
    }

    #[test]
    fn test_min_points_one_makes_singletons() {
        let grid = Grid(vec![0, 10, 20]);
        let groups = Dbscan::new(1.0, 1).run(&grid, grid.0.clone());
        assert_eq!(groups, vec![vec![0], vec![10], vec![20]]);
    }

    #[test]
    fn test_zero_epsilon_finds_nothing() {
        let grid = Grid(vec![0, 0, 1]);
        assert!(Dbscan::new(0.0, 2).run(&grid, grid.0.clone()).is_empty());
    }

    #[test]
    fn test_candidate_order_does_not_matter() {
        let grid = Grid(vec![0, 1, 2, 5, 6, 7, 8, 30, 31]);
        let forward = Dbscan::new(1.5, 3).run(&grid, grid.0.clone());
        let mut reversed = grid.0.clone();
        reversed.reverse();
        let backward = Dbscan::new(1.5, 3).run(&grid, reversed);
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 2);
    }
}
