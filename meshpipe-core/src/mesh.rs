//! Mesh data structures and functionality

use crate::point::*;
use serde::{Deserialize, Serialize};

/// A triangle mesh with optional per-vertex attributes and per-face material slots.
///
/// Vertices are "render" vertices: a position that appears with two different
/// UVs or normals is stored twice. Topology queries that must ignore such seams
/// go through [`crate::topology::WeldedTopology`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriangleMesh {
    pub vertices: Vec<Point3f>,
    pub faces: Vec<[usize; 3]>,
    pub normals: Option<Vec<Vector3f>>,
    pub uvs: Option<Vec<Uv>>,
    /// Index into `materials` for every face
    pub face_materials: Option<Vec<usize>>,
    /// Material slot names in first-use order
    pub materials: Vec<String>,
}

impl TriangleMesh {
    /// Create a new empty mesh
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            faces: Vec::new(),
            normals: None,
            uvs: None,
            face_materials: None,
            materials: Vec::new(),
        }
    }

    /// Create a mesh from vertices and faces
    pub fn from_vertices_and_faces(vertices: Vec<Point3f>, faces: Vec<[usize; 3]>) -> Self {
        Self {
            vertices,
            faces,
            ..Self::new()
        }
    }

    /// Get the number of vertices
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Get the number of faces
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check if the mesh is empty
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Whether the mesh carries texture coordinates
    pub fn has_uvs(&self) -> bool {
        self.uvs.is_some()
    }

    /// Add a vertex to the mesh
    pub fn add_vertex(&mut self, vertex: Point3f) -> usize {
        let index = self.vertices.len();
        self.vertices.push(vertex);
        index
    }

    /// Add a face to the mesh
    pub fn add_face(&mut self, face: [usize; 3]) {
        self.faces.push(face);
    }

    /// Calculate face normals
    pub fn calculate_face_normals(&self) -> Vec<Vector3f> {
        self.faces
            .iter()
            .map(|face| {
                let v0 = self.vertices[face[0]];
                let v1 = self.vertices[face[1]];
                let v2 = self.vertices[face[2]];

                let edge1 = v1 - v0;
                let edge2 = v2 - v0;

                edge1.cross(&edge2).normalize()
            })
            .collect()
    }

    /// Area-weighted vertex normals
    pub fn compute_vertex_normals(&self) -> Vec<Vector3f> {
        let mut acc = vec![Vector3f::zeros(); self.vertices.len()];
        for face in &self.faces {
            let v0 = self.vertices[face[0]];
            let n = (self.vertices[face[1]] - v0).cross(&(self.vertices[face[2]] - v0));
            for &i in face {
                acc[i] += n;
            }
        }
        acc.into_iter()
            .map(|n| {
                let len = n.norm();
                if len > f32::EPSILON {
                    n / len
                } else {
                    Vector3f::new(0.0, 0.0, 1.0)
                }
            })
            .collect()
    }

    /// Total surface area
    pub fn surface_area(&self) -> f64 {
        self.faces
            .iter()
            .map(|f| triangle_area(&self.vertices[f[0]], &self.vertices[f[1]], &self.vertices[f[2]]))
            .sum()
    }

    /// Set vertex normals
    pub fn set_normals(&mut self, normals: Vec<Vector3f>) {
        if normals.len() == self.vertices.len() {
            self.normals = Some(normals);
        }
    }

    /// Set texture coordinates
    pub fn set_uvs(&mut self, uvs: Vec<Uv>) {
        if uvs.len() == self.vertices.len() {
            self.uvs = Some(uvs);
        }
    }

    /// Assign material slots; ignored unless every face gets a valid slot
    pub fn set_face_materials(&mut self, materials: Vec<String>, face_materials: Vec<usize>) {
        if face_materials.len() == self.faces.len()
            && face_materials.iter().all(|&m| m < materials.len())
        {
            self.materials = materials;
            self.face_materials = Some(face_materials);
        }
    }

    /// Material name used by a face, if any
    pub fn material_of(&self, face: usize) -> Option<&str> {
        let slot = *self.face_materials.as_ref()?.get(face)?;
        self.materials.get(slot).map(String::as_str)
    }

    /// Drop vertices no face references, remapping indices and attributes
    pub fn remove_unreferenced_vertices(&mut self) -> usize {
        let mut used = vec![false; self.vertices.len()];
        for face in &self.faces {
            for &i in face {
                used[i] = true;
            }
        }
        let mut remap = vec![usize::MAX; self.vertices.len()];
        let mut next = 0usize;
        for (i, &u) in used.iter().enumerate() {
            if u {
                remap[i] = next;
                next += 1;
            }
        }
        let removed = self.vertices.len() - next;
        if removed == 0 {
            return 0;
        }
        self.vertices = retain_by(&self.vertices, &used);
        if let Some(normals) = self.normals.take() {
            self.normals = Some(retain_by(&normals, &used));
        }
        if let Some(uvs) = self.uvs.take() {
            self.uvs = Some(retain_by(&uvs, &used));
        }
        for face in &mut self.faces {
            for i in face.iter_mut() {
                *i = remap[*i];
            }
        }
        removed
    }

    /// Keep only faces whose flag is set, along with their material slots
    pub fn retain_faces(&mut self, keep: &[bool]) -> usize {
        if keep.len() != self.faces.len() {
            return 0;
        }
        let before = self.faces.len();
        self.faces = retain_by(&self.faces, keep);
        if let Some(slots) = self.face_materials.take() {
            self.face_materials = Some(retain_by(&slots, keep));
        }
        before - self.faces.len()
    }

    /// Clear the mesh
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.faces.clear();
        self.normals = None;
        self.uvs = None;
        self.face_materials = None;
        self.materials.clear();
    }
}

impl Default for TriangleMesh {
    fn default() -> Self {
        Self::new()
    }
}

fn retain_by<T: Copy>(values: &[T], keep: &[bool]) -> Vec<T> {
    values
        .iter()
        .zip(keep)
        .filter_map(|(v, &k)| k.then_some(*v))
        .collect()
}

/// Area of a triangle in double precision
pub fn triangle_area(a: &Point3f, b: &Point3f, c: &Point3f) -> f64 {
    let ab = (b - a).cast::<f64>();
    let ac = (c - a).cast::<f64>();
    ab.cross(&ac).norm() * 0.5
}
