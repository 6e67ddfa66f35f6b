//! Point and attribute type aliases

use nalgebra::{Point3, Vector3};

/// A 3D point with floating point coordinates
pub type Point3f = Point3<f32>;

/// A 3D vector with floating point components
pub type Vector3f = Vector3<f32>;

/// Texture coordinate (u, v)
pub type Uv = [f32; 2];

/// Key used to weld vertices that share the exact same position.
///
/// `-0.0` and `0.0` map to the same key.
pub fn position_key(p: &Point3f) -> [u32; 3] {
    let bits = |v: f32| if v == 0.0 { 0u32 } else { v.to_bits() };
    [bits(p.x), bits(p.y), bits(p.z)]
}
