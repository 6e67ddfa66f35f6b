//! Affine transforms applied to whole meshes

use crate::mesh::TriangleMesh;
use crate::point::{Point3f, Vector3f};
use nalgebra::Matrix4;

/// A 4x4 affine transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3D {
    pub matrix: Matrix4<f32>,
}

impl Transform3D {
    /// Create an identity transformation
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    /// Build from column-major arrays, the layout glTF node matrices use
    pub fn from_column_arrays(columns: [[f32; 4]; 4]) -> Self {
        Self {
            matrix: Matrix4::from_fn(|row, col| columns[col][row]),
        }
    }

    /// Apply the transformation to a point
    pub fn transform_point(&self, point: &Point3f) -> Point3f {
        let homogeneous = self.matrix * point.to_homogeneous();
        Point3f::from_homogeneous(homogeneous).unwrap_or(*point)
    }

    /// Transform a normal by the inverse transpose of the linear part
    pub fn transform_normal(&self, normal: &Vector3f) -> Vector3f {
        let linear = self.matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let normal_matrix = linear.try_inverse().map(|m| m.transpose()).unwrap_or(linear);
        let n = normal_matrix * normal;
        let len = n.norm();
        if len > f32::EPSILON {
            n / len
        } else {
            *normal
        }
    }

    /// Compose this transformation with another (`self` applied last)
    pub fn compose(self, other: Self) -> Self {
        Self {
            matrix: self.matrix * other.matrix,
        }
    }

    /// Check if this is approximately the identity transformation
    pub fn is_identity(&self, epsilon: f32) -> bool {
        (self.matrix - Matrix4::identity()).norm() < epsilon
    }
}

impl Default for Transform3D {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for Transform3D {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self::Output {
        self.compose(rhs)
    }
}

/// Trait for objects that can be transformed in place
pub trait Transformable {
    fn transform(&mut self, transform: &Transform3D);
}

impl Transformable for TriangleMesh {
    fn transform(&mut self, transform: &Transform3D) {
        if transform.is_identity(1e-7) {
            return;
        }
        for v in &mut self.vertices {
            *v = transform.transform_point(v);
        }
        if let Some(normals) = self.normals.as_mut() {
            for n in normals.iter_mut() {
                *n = transform.transform_normal(n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_column_major_translation() {
        let t = Transform3D::from_column_arrays([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [2.0, 3.0, 4.0, 1.0],
        ]);
        let p = t.transform_point(&Point3f::new(1.0, 1.0, 1.0));
        assert_relative_eq!(p.x, 3.0);
        assert_relative_eq!(p.y, 4.0);
        assert_relative_eq!(p.z, 5.0);
    }

    #[test]
    fn test_mesh_transform_keeps_normals_unit() {
        let mut mesh = TriangleMesh::from_vertices_and_faces(
            vec![
                Point3f::new(0.0, 0.0, 0.0),
                Point3f::new(1.0, 0.0, 0.0),
                Point3f::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2]],
        );
        mesh.set_normals(vec![Vector3f::new(0.0, 0.0, 1.0); 3]);
        let scale = Transform3D {
            matrix: Matrix4::new_nonuniform_scaling(&Vector3f::new(2.0, 2.0, 5.0)),
        };
        mesh.transform(&scale);
        assert_relative_eq!(mesh.vertices[1].x, 2.0);
        let n = mesh.normals.as_ref().unwrap()[0];
        assert_relative_eq!(n.norm(), 1.0, epsilon = 1e-6);
    }
}
