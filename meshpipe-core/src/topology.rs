//! Position-welded connectivity
//!
//! Render vertices that share a position (UV or normal seams) are merged so
//! that edge sharing, watertightness and connected components reflect the
//! actual surface rather than how attributes were split.

use crate::mesh::TriangleMesh;
use crate::point::position_key;
use std::collections::HashMap;

/// Undirected edge between two welded vertices, smaller id first
pub type EdgeKey = (usize, usize);

/// Build an undirected edge key
#[inline]
pub fn edge_key(a: usize, b: usize) -> EdgeKey {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Welded vertex ids and edge-to-face incidence for a mesh
#[derive(Debug, Clone)]
pub struct WeldedTopology {
    /// Welded id for every render vertex
    pub welded: Vec<usize>,
    /// Number of distinct positions
    pub welded_count: usize,
    /// Faces incident to every undirected welded edge
    pub edge_faces: HashMap<EdgeKey, Vec<usize>>,
}

impl WeldedTopology {
    pub fn new(mesh: &TriangleMesh) -> Self {
        let mut ids: HashMap<[u32; 3], usize> = HashMap::with_capacity(mesh.vertices.len());
        let welded: Vec<usize> = mesh
            .vertices
            .iter()
            .map(|p| {
                let next = ids.len();
                *ids.entry(position_key(p)).or_insert(next)
            })
            .collect();

        let mut edge_faces: HashMap<EdgeKey, Vec<usize>> =
            HashMap::with_capacity(mesh.faces.len() * 3 / 2 + 1);
        for (fi, face) in mesh.faces.iter().enumerate() {
            for j in 0..3 {
                let a = welded[face[j]];
                let b = welded[face[(j + 1) % 3]];
                if a == b {
                    continue;
                }
                edge_faces.entry(edge_key(a, b)).or_default().push(fi);
            }
        }

        Self {
            welded,
            welded_count: ids.len(),
            edge_faces,
        }
    }

    /// Welded ids of a face's corners
    pub fn welded_face(&self, face: &[usize; 3]) -> [usize; 3] {
        [self.welded[face[0]], self.welded[face[1]], self.welded[face[2]]]
    }

    /// Number of unique undirected edges
    pub fn edge_count(&self) -> usize {
        self.edge_faces.len()
    }

    /// Edges used by exactly one face
    pub fn boundary_edges(&self) -> impl Iterator<Item = &EdgeKey> {
        self.edge_faces
            .iter()
            .filter(|(_, faces)| faces.len() == 1)
            .map(|(e, _)| e)
    }

    /// Edges used by more than two faces
    pub fn non_manifold_edges(&self) -> impl Iterator<Item = (&EdgeKey, &Vec<usize>)> {
        self.edge_faces.iter().filter(|(_, faces)| faces.len() > 2)
    }

    /// Every edge borders exactly two faces
    pub fn is_watertight(&self) -> bool {
        !self.edge_faces.is_empty() && self.edge_faces.values().all(|f| f.len() == 2)
    }

    /// Connected components over faces that share a welded vertex
    pub fn component_count(&self, mesh: &TriangleMesh) -> usize {
        let mut parent: Vec<usize> = (0..self.welded_count).collect();
        let mut referenced = vec![false; self.welded_count];

        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        for face in &mesh.faces {
            let [a, b, c] = self.welded_face(face);
            referenced[a] = true;
            referenced[b] = true;
            referenced[c] = true;
            for (x, y) in [(a, b), (b, c)] {
                let rx = find(&mut parent, x);
                let ry = find(&mut parent, y);
                if rx != ry {
                    parent[rx] = ry;
                }
            }
        }

        (0..self.welded_count)
            .filter(|&v| referenced[v] && find(&mut parent, v) == v)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Point3f;

    #[test]
    fn test_seam_vertices_are_welded() {
        // Two triangles sharing an edge, with the shared corners duplicated
        let mesh = TriangleMesh::from_vertices_and_faces(
            vec![
                Point3f::new(0.0, 0.0, 0.0),
                Point3f::new(1.0, 0.0, 0.0),
                Point3f::new(0.0, 1.0, 0.0),
                Point3f::new(1.0, 0.0, 0.0),
                Point3f::new(1.0, 1.0, 0.0),
                Point3f::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2], [3, 4, 5]],
        );
        let topo = WeldedTopology::new(&mesh);
        assert_eq!(topo.welded_count, 4);
        assert_eq!(topo.edge_count(), 5);
        assert_eq!(topo.boundary_edges().count(), 4);
        assert_eq!(topo.component_count(&mesh), 1);
        assert!(!topo.is_watertight());
    }

    #[test]
    fn test_negative_zero_welds() {
        let mesh = TriangleMesh::from_vertices_and_faces(
            vec![Point3f::new(0.0, 0.0, 0.0), Point3f::new(-0.0, 0.0, -0.0)],
            vec![],
        );
        assert_eq!(WeldedTopology::new(&mesh).welded_count, 1);
    }
}
