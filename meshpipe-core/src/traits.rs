//! Core traits for meshpipe

use crate::{mesh::*, point::*};

/// Trait for objects with spatial extent
pub trait Drawable {
    /// Get the bounding box of the object
    fn bounding_box(&self) -> (Point3f, Point3f);

    /// Get the center point of the object
    fn center(&self) -> Point3f {
        let (min, max) = self.bounding_box();
        Point3f::new(
            (min.x + max.x) / 2.0,
            (min.y + max.y) / 2.0,
            (min.z + max.z) / 2.0,
        )
    }

    /// Length of the bounding-box diagonal
    fn bbox_diagonal(&self) -> f64 {
        let (min, max) = self.bounding_box();
        (max - min).cast::<f64>().norm()
    }
}

impl Drawable for TriangleMesh {
    fn bounding_box(&self) -> (Point3f, Point3f) {
        if self.vertices.is_empty() {
            return (Point3f::origin(), Point3f::origin());
        }

        let mut min = self.vertices[0];
        let mut max = self.vertices[0];

        for vertex in &self.vertices {
            min.x = min.x.min(vertex.x);
            min.y = min.y.min(vertex.y);
            min.z = min.z.min(vertex.z);

            max.x = max.x.max(vertex.x);
            max.y = max.y.max(vertex.y);
            max.z = max.z.max(vertex.z);
        }

        (min, max)
    }
}

/// Source of time for polling loops and budgets
///
/// Implementations must be monotonic. `sleep` is how every waiting loop in the
/// workspace blocks, so a manual clock makes those loops run instantly.
pub trait Clock: Send + Sync {
    fn now(&self) -> std::time::Instant;
    fn sleep(&self, duration: std::time::Duration);
}
