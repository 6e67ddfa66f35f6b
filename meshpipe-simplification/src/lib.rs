//! Mesh simplification and decimation algorithms
//!
//! This crate provides algorithms for reducing mesh complexity while
//! preserving important geometric features:
//! - Edge collapse with quadric error metrics
//! - Progressive decimation in bounded steps

pub mod edge_collapse;
pub mod progressive;

#[cfg(test)]
mod test_meshes;

pub use edge_collapse::*;
pub use progressive::*;

use meshpipe_core::{TriangleMesh, Result};

/// Simplify a mesh by reducing the number of faces/vertices
pub trait MeshSimplifier {
    /// Simplify mesh with target reduction ratio (0.0 = no reduction, 1.0 = maximum reduction)
    fn simplify(&self, mesh: &TriangleMesh, reduction_ratio: f32) -> Result<TriangleMesh>;

    /// Simplify mesh to at most `target_faces` faces where possible
    fn simplify_to(&self, mesh: &TriangleMesh, target_faces: usize) -> Result<TriangleMesh> {
        let faces = mesh.face_count();
        if faces <= target_faces {
            return Ok(mesh.clone());
        }
        let ratio = 1.0 - target_faces as f32 / faces as f32;
        self.simplify(mesh, ratio)
    }
}
