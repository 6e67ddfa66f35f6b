//! Core data structures and traits for meshpipe
//!
//! This crate provides the mesh type shared by every pipeline stage, welded
//! topology queries, the quality analyzer, and the clock abstraction used by
//! every polling loop and time budget.

pub mod point;
pub mod mesh;
pub mod traits;
pub mod transform;
pub mod topology;
pub mod quality;
pub mod clock;
pub mod error;

pub use point::*;
pub use mesh::*;
pub use traits::*;
pub use transform::*;
pub use topology::*;
pub use quality::*;
pub use clock::*;
pub use error::*;

/// Re-export commonly used types from nalgebra
pub use nalgebra::{Matrix3, Matrix4, Point3, Vector3, Vector4};
