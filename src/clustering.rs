//! Nearby groups: DBSCAN over the similarity graph of one constraint.
//!
//! Distance between two activities joined by an edge is
//! `(max_similarity - similarity) / max_similarity`, where `max_similarity`
//! is the largest similarity in the constraint. Activities without an edge
//! are never neighbours.

use std::collections::HashMap;

use log::info;

use crate::dbscan::{Dbscan, Neighbourhood};
use crate::search::expand_max;
use crate::{ActivityId, SimilarityEdge};

/// Adjacency view of the similarity edges of one constraint.
#[derive(Debug, Clone, Default)]
pub struct SimilarityGraph {
    adjacency: HashMap<ActivityId, Vec<(ActivityId, f64)>>,
    max_similarity: f64,
}

impl SimilarityGraph {
    pub fn from_edges(edges: &[SimilarityEdge]) -> Self {
        let mut adjacency: HashMap<ActivityId, Vec<(ActivityId, f64)>> = HashMap::new();
        let mut max_similarity: f64 = 0.0;
        for edge in edges {
            adjacency
                .entry(edge.lo)
                .or_default()
                .push((edge.hi, edge.similarity));
            adjacency
                .entry(edge.hi)
                .or_default()
                .push((edge.lo, edge.similarity));
            max_similarity = max_similarity.max(edge.similarity);
        }
        Self {
            adjacency,
            max_similarity,
        }
    }

    /// Every activity on either end of an edge, ascending.
    pub fn nodes(&self) -> Vec<ActivityId> {
        let mut nodes: Vec<ActivityId> = self.adjacency.keys().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    pub fn max_similarity(&self) -> f64 {
        self.max_similarity
    }

    pub fn derived_distance(&self, similarity: f64) -> f64 {
        (self.max_similarity - similarity) / self.max_similarity
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }
}

impl Neighbourhood for SimilarityGraph {
    type Node = ActivityId;

    fn neighbours(&self, node: ActivityId, epsilon: f64) -> Vec<ActivityId> {
        if self.max_similarity <= 0.0 {
            return Vec::new();
        }
        self.adjacency
            .get(&node)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|(_, similarity)| self.derived_distance(*similarity) < epsilon)
                    .map(|(other, _)| *other)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parameters of the adaptive radius search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    pub min_points: usize,
    pub epsilon_lo: f64,
    pub epsilon_hi: f64,
    pub iterations: u32,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            min_points: 3,
            epsilon_lo: 0.0,
            epsilon_hi: 1.0,
            iterations: 5,
        }
    }
}

/// Outcome of clustering one constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Clustering {
    pub epsilon: f64,
    /// Groups in discovery order; index is the group number
    pub groups: Vec<Vec<ActivityId>>,
}

/// Cluster at a fixed radius.
pub fn cluster(graph: &SimilarityGraph, epsilon: f64, min_points: usize) -> Vec<Vec<ActivityId>> {
    Dbscan::new(epsilon, min_points).run(graph, graph.nodes())
}

/// Cluster at the radius that gives the most groups (see [`expand_max`]).
pub fn cluster_adaptive(graph: &SimilarityGraph, params: &ClusterParams) -> Clustering {
    let (epsilon, n) = expand_max(
        params.epsilon_lo,
        params.epsilon_hi,
        params.iterations,
        |epsilon| cluster(graph, epsilon, params.min_points).len(),
    );
    info!("[Nearby] {} groups at d={:.6}", n, epsilon);
    Clustering {
        epsilon,
        groups: cluster(graph, epsilon, params.min_points),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(lo: ActivityId, hi: ActivityId, similarity: f64) -> SimilarityEdge {
        SimilarityEdge {
            constraint: "c".to_string(),
            lo,
            hi,
            similarity,
        }
    }

    fn two_triangles() -> Vec<SimilarityEdge> {
        vec![
            edge(1, 2, 0.9),
            edge(1, 3, 0.9),
            edge(2, 3, 0.9),
            edge(4, 5, 0.8),
            edge(4, 6, 0.8),
            edge(5, 6, 0.8),
        ]
    }

    #[test]
    fn test_graph_nodes_include_both_ends() {
        let graph = SimilarityGraph::from_edges(&[edge(5, 9, 0.2), edge(1, 5, 0.4)]);
        assert_eq!(graph.nodes(), vec![1, 5, 9]);
        assert_eq!(graph.max_similarity(), 0.4);
        assert_eq!(graph.derived_distance(0.4), 0.0);
        assert!((graph.derived_distance(0.2) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_neighbourhood_is_strict() {
        let graph = SimilarityGraph::from_edges(&[edge(1, 2, 1.0), edge(1, 3, 0.5)]);
        assert_eq!(graph.neighbours(1, 0.5), vec![2]);
        let mut wide = graph.neighbours(1, 0.51);
        wide.sort_unstable();
        assert_eq!(wide, vec![2, 3]);
        assert!(graph.neighbours(1, 0.0).is_empty());
        assert!(graph.neighbours(42, 1.0).is_empty());
    }

    #[test]
    fn test_two_triangles_at_fixed_radius() {
        let graph = SimilarityGraph::from_edges(&two_triangles());
        let gap = graph.derived_distance(0.8);

        // Below the second triangle's distance only the first forms a group.
        assert_eq!(cluster(&graph, gap * 0.5, 3), vec![vec![1, 2, 3]]);
        assert_eq!(
            cluster(&graph, gap * 1.5, 3),
            vec![vec![1, 2, 3], vec![4, 5, 6]]
        );
    }

    #[test]
    fn test_two_triangles_adaptive() {
        let graph = SimilarityGraph::from_edges(&two_triangles());
        let clustering = cluster_adaptive(&graph, &ClusterParams::default());

        assert_eq!(clustering.groups, vec![vec![1, 2, 3], vec![4, 5, 6]]);
        assert!(clustering.epsilon > graph.derived_distance(0.8));
    }

    #[test]
    fn test_clustering_is_deterministic() {
        let mut edges = two_triangles();
        edges.push(edge(3, 7, 0.3));
        edges.push(edge(6, 8, 0.85));
        let graph = SimilarityGraph::from_edges(&edges);
        let first = cluster_adaptive(&graph, &ClusterParams::default());
        let mut reversed = edges.clone();
        reversed.reverse();
        let second = cluster_adaptive(
            &SimilarityGraph::from_edges(&reversed),
            &ClusterParams::default(),
        );
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_graph() {
        let graph = SimilarityGraph::from_edges(&[]);
        assert!(graph.is_empty());
        let clustering = cluster_adaptive(&graph, &ClusterParams::default());
        assert!(clustering.groups.is_empty());
    }

    #[test]
    fn test_pair_is_not_a_group() {
        // Two nodes can never reach three points including themselves.
        let graph = SimilarityGraph::from_edges(&[edge(1, 2, 0.7)]);
        assert!(cluster(&graph, 1.0, 3).is_empty());
    }
}
