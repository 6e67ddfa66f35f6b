//! I/O operations for meshes
//!
//! This crate reads and writes the two formats the pipeline moves between:
//! OBJ with MTL material libraries, and binary glTF.

pub mod obj;
pub mod mtl;
pub mod glb;
pub mod error;

#[cfg(test)]
mod tests;

pub use error::*;
pub use glb::{GlbMaterial, GlbReader, GlbScene, GlbWriter};
pub use mtl::{LibraryMaterial, MapReference, MaterialLibrary, MtlDocument, MtlMaterial};
pub use crate::obj::{ObjDocument, ObjReader, ObjWriter};

use meshpipe_core::{Result, TriangleMesh};
use std::path::Path;

/// Trait for reading meshes from files
pub trait MeshReader {
    fn read_mesh<P: AsRef<Path>>(path: P) -> Result<TriangleMesh>;
}

/// Trait for writing meshes to files
pub trait MeshWriter {
    fn write_mesh<P: AsRef<Path>>(mesh: &TriangleMesh, path: P) -> Result<()>;
}

/// Lowercase extension of a path, if any
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase)
}

/// Auto-detect format and read mesh
pub fn read_mesh<P: AsRef<Path>>(path: P) -> Result<TriangleMesh> {
    let path = path.as_ref();
    match extension_of(path).as_deref() {
        Some("obj") => crate::obj::ObjReader::read_mesh(path),
        Some("glb") => glb::GlbReader::read_mesh(path),
        _ => Err(meshpipe_core::Error::UnsupportedFormat(format!(
            "Unsupported mesh format: {:?}",
            path.extension()
        ))),
    }
}

/// Auto-detect format and write mesh
pub fn write_mesh<P: AsRef<Path>>(mesh: &TriangleMesh, path: P) -> Result<()> {
    let path = path.as_ref();
    match extension_of(path).as_deref() {
        Some("obj") => crate::obj::ObjWriter::write_mesh(mesh, path),
        Some("glb") => glb::GlbWriter::write_mesh(mesh, path),
        _ => Err(meshpipe_core::Error::UnsupportedFormat(format!(
            "Unsupported mesh format: {:?}",
            path.extension()
        ))),
    }
}
