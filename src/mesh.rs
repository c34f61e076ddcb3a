//! Coupling view of a distributed interface mesh.
//!
//! The coupling core never builds or maps meshes; it only needs to know
//! which rank owns which global vertex so that rank-to-rank data subsets can
//! be routed, plus enough geometry (coordinates, edges) to ship a partition
//! to the remote participant on request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type MeshId = usize;

/// Owned global vertex IDs per rank of one participant, in local storage
/// order. The per-rank lists must be disjoint.
pub type VertexDistribution = BTreeMap<usize, Vec<usize>>;

/// Local value-array indices to exchange, keyed by remote rank.
pub type CommunicationMap = BTreeMap<usize, Vec<usize>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vertex {
    /// Global ID, unique across all ranks of the owning participant.
    pub id: usize,
    pub coords: [f64; 3],
}

/// The vertices and connectivity held by one rank, in wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshPartition {
    pub vertices: Vec<Vertex>,
    /// Edges as pairs of global vertex IDs.
    pub edges: Vec<(usize, usize)>,
}

/// Read-only mesh description shared by all ranks of a participant.
#[derive(Debug, Clone)]
pub struct InterfaceMesh {
    id: MeshId,
    name: String,
    vertices: Vec<Vertex>,
    edges: Vec<(usize, usize)>,
    vertex_distribution: VertexDistribution,
}

impl InterfaceMesh {
    pub fn new(
        id: MeshId,
        name: impl Into<String>,
        vertices: Vec<Vertex>,
        edges: Vec<(usize, usize)>,
        vertex_distribution: VertexDistribution,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            vertices,
            edges,
            vertex_distribution,
        }
    }

    /// Convenience constructor for meshes used only for data routing, where
    /// coordinates do not matter.
    pub fn from_distribution(
        id: MeshId,
        name: impl Into<String>,
        vertex_distribution: VertexDistribution,
    ) -> Self {
        let vertices = vertex_distribution
            .values()
            .flatten()
            .map(|&id| Vertex {
                id,
                coords: [0.0; 3],
            })
            .collect();
        Self::new(id, name, vertices, Vec::new(), vertex_distribution)
    }

    pub fn id(&self) -> MeshId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    pub fn vertex_distribution(&self) -> &VertexDistribution {
        &self.vertex_distribution
    }

    /// Global IDs owned by `rank`, in local storage order. Empty when the
    /// rank holds no part of this mesh.
    pub fn owned_ids(&self, rank: usize) -> &[usize] {
        self.vertex_distribution
            .get(&rank)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The partition held by `rank`, in wire form.
    pub fn partition(&self, rank: usize) -> MeshPartition {
        let owned = self.owned_ids(rank);
        let vertices = self
            .vertices
            .iter()
            .filter(|v| owned.contains(&v.id))
            .cloned()
            .collect();
        let edges = self
            .edges
            .iter()
            .filter(|(a, b)| owned.contains(a) && owned.contains(b))
            .copied()
            .collect();
        MeshPartition { vertices, edges }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_rank_mesh() -> InterfaceMesh {
        let mut distribution = VertexDistribution::new();
        distribution.insert(0, vec![0, 1, 2]);
        distribution.insert(1, vec![3, 4]);
        InterfaceMesh::from_distribution(7, "interface", distribution)
    }

    #[test]
    fn test_owned_ids_per_rank() {
        let mesh = two_rank_mesh();
        assert_eq!(mesh.owned_ids(0), &[0, 1, 2]);
        assert_eq!(mesh.owned_ids(1), &[3, 4]);
        assert_eq!(mesh.owned_ids(2), &[] as &[usize]);
    }

    #[test]
    fn test_partition_filters_vertices() {
        let mesh = two_rank_mesh();
        let part = mesh.partition(1);
        let ids: Vec<usize> = part.vertices.iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_partition_wire_round_trip() {
        let mesh = two_rank_mesh();
        let part = mesh.partition(0);
        let bytes = crate::transport::codec::encode_json(&part).unwrap();
        let back: MeshPartition = crate::transport::codec::decode_json(&bytes).unwrap();
        assert_eq!(back.vertices.len(), 3);
    }
}
