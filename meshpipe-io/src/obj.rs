//! OBJ format support
//!
//! Reading goes through the `obj` crate's raw parser, which keeps `mtllib`
//! and `usemtl` names. Corners are unified into render vertices keyed by their
//! `(v, vt, vn)` triple, and polygons are fan-triangulated.

use crate::{IoError, MeshReader, MeshWriter};
use meshpipe_core::{Point3f, Result, TriangleMesh, Uv, Vector3f};
use ::obj::raw::object::{parse_obj, Polygon, RawObj};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Material slot name used for faces that precede any `usemtl`
pub const DEFAULT_MATERIAL: &str = "default";

pub struct ObjReader;
pub struct ObjWriter;

/// A parsed OBJ file: the mesh plus the material libraries it references
#[derive(Debug, Clone, Default)]
pub struct ObjDocument {
    pub mesh: TriangleMesh,
    /// `mtllib` arguments in order of appearance, as written
    pub material_libs: Vec<String>,
}

impl MeshReader for ObjReader {
    fn read_mesh<P: AsRef<Path>>(path: P) -> Result<TriangleMesh> {
        Ok(Self::read_document(path)?.mesh)
    }
}

impl MeshWriter for ObjWriter {
    fn write_mesh<P: AsRef<Path>>(mesh: &TriangleMesh, path: P) -> Result<()> {
        Self::write_document(mesh, &[], path)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct Corner {
    v: usize,
    vt: Option<usize>,
    vn: Option<usize>,
}

fn malformed(message: impl Into<String>) -> IoError {
    IoError::Malformed {
        format: "OBJ",
        message: message.into(),
    }
}

fn parse_raw<R: BufRead>(reader: R) -> std::result::Result<RawObj, IoError> {
    parse_obj(reader).map_err(|e| malformed(e.to_string()))
}

impl ObjReader {
    /// Read an OBJ file including its material references
    pub fn read_document<P: AsRef<Path>>(path: P) -> Result<ObjDocument> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(IoError::FileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let file = File::open(path)?;
        Ok(Self::parse(BufReader::new(file))?)
    }

    /// Parse OBJ text from any buffered reader
    pub fn parse<R: BufRead>(reader: R) -> std::result::Result<ObjDocument, IoError> {
        Self::from_raw(parse_raw(reader)?)
    }

    fn from_raw(raw: RawObj) -> std::result::Result<ObjDocument, IoError> {
        // `usemtl` groups as polygon ranges; unnamed means no usemtl yet
        let mut polygon_material: Vec<Option<&str>> = vec![None; raw.polygons.len()];
        for (name, group) in &raw.meshes {
            if name.is_empty() {
                continue;
            }
            for range in &group.polygons {
                for slot in polygon_material.iter_mut().take(range.end).skip(range.start) {
                    *slot = Some(name.as_str());
                }
            }
        }

        let mut corner_ids: HashMap<Corner, usize> = HashMap::new();
        let mut corners: Vec<Corner> = Vec::new();
        let mut faces: Vec<[usize; 3]> = Vec::new();
        let mut face_slots: Vec<Option<usize>> = Vec::new();
        let mut materials: Vec<String> = Vec::new();

        for (index, polygon) in raw.polygons.iter().enumerate() {
            let polygon_corners: Vec<Corner> = match polygon {
                Polygon::P(vs) => vs.iter().map(|&v| Corner { v, vt: None, vn: None }).collect(),
                Polygon::PT(vs) => vs.iter().map(|&(v, t)| Corner { v, vt: Some(t), vn: None }).collect(),
                Polygon::PN(vs) => vs.iter().map(|&(v, n)| Corner { v, vt: None, vn: Some(n) }).collect(),
                Polygon::PTN(vs) => vs
                    .iter()
                    .map(|&(v, t, n)| Corner { v, vt: Some(t), vn: Some(n) })
                    .collect(),
            };

            let mut ids = Vec::with_capacity(polygon_corners.len());
            for corner in polygon_corners {
                check_corner(&raw, &corner, index)?;
                let next = corners.len();
                let id = *corner_ids.entry(corner).or_insert_with(|| {
                    corners.push(corner);
                    next
                });
                ids.push(id);
            }
            if ids.len() < 3 {
                continue;
            }

            let slot = polygon_material[index].map(|name| {
                match materials.iter().position(|m| m == name) {
                    Some(slot) => slot,
                    None => {
                        materials.push(name.to_string());
                        materials.len() - 1
                    }
                }
            });
            for k in 1..ids.len() - 1 {
                faces.push([ids[0], ids[k], ids[k + 1]]);
                face_slots.push(slot);
            }
        }

        let position = |i: usize| {
            let (x, y, z, _) = raw.positions[i];
            Point3f::new(x, y, z)
        };
        let mut mesh = TriangleMesh::from_vertices_and_faces(
            corners.iter().map(|c| position(c.v)).collect(),
            faces,
        );

        if corners.iter().any(|c| c.vt.is_some()) {
            mesh.set_uvs(
                corners
                    .iter()
                    .map(|c| {
                        c.vt
                            .map(|i| {
                                let (u, v, _) = raw.tex_coords[i];
                                let uv: Uv = [u, v];
                                uv
                            })
                            .unwrap_or([0.0, 0.0])
                    })
                    .collect(),
            );
        }
        if corners.iter().any(|c| c.vn.is_some()) {
            let fallback = mesh.compute_vertex_normals();
            mesh.set_normals(
                corners
                    .iter()
                    .enumerate()
                    .map(|(i, c)| match c.vn {
                        Some(n) => {
                            let (x, y, z) = raw.normals[n];
                            Vector3f::new(x, y, z)
                        }
                        None => fallback[i],
                    })
                    .collect(),
            );
        }
        if face_slots.iter().any(Option::is_some) {
            let default_slot = if face_slots.iter().any(Option::is_none) {
                materials.push(DEFAULT_MATERIAL.to_string());
                materials.len() - 1
            } else {
                usize::MAX
            };
            let slots = face_slots
                .into_iter()
                .map(|s| s.unwrap_or(default_slot))
                .collect();
            mesh.set_face_materials(materials, slots);
        }

        debug!(
            vertices = mesh.vertex_count(),
            faces = mesh.face_count(),
            libraries = raw.material_libraries.len(),
            "OBJ parsed"
        );
        Ok(ObjDocument {
            mesh,
            material_libs: raw.material_libraries,
        })
    }
}

/// Reject corners pointing past the end of their attribute lists
fn check_corner(raw: &RawObj, corner: &Corner, polygon: usize) -> std::result::Result<(), IoError> {
    let out_of_range = |what: &str, index: usize, count: usize| {
        malformed(format!(
            "face {} references {what} {} but only {count} are defined",
            polygon + 1,
            index + 1
        ))
    };
    if corner.v >= raw.positions.len() {
        return Err(out_of_range("vertex", corner.v, raw.positions.len()));
    }
    if let Some(vt) = corner.vt.filter(|&vt| vt >= raw.tex_coords.len()) {
        return Err(out_of_range("texture coordinate", vt, raw.tex_coords.len()));
    }
    if let Some(vn) = corner.vn.filter(|&vn| vn >= raw.normals.len()) {
        return Err(out_of_range("normal", vn, raw.normals.len()));
    }
    Ok(())
}

impl ObjWriter {
    /// Write a mesh with optional `mtllib` references and `usemtl` switches
    pub fn write_document<P: AsRef<Path>>(
        mesh: &TriangleMesh,
        material_libs: &[String],
        path: P,
    ) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut w = BufWriter::new(file);
        Self::write_to(mesh, material_libs, &mut w)?;
        w.flush()?;
        Ok(())
    }

    /// Serialize into any writer
    pub fn write_to<W: Write>(
        mesh: &TriangleMesh,
        material_libs: &[String],
        w: &mut W,
    ) -> std::io::Result<()> {
        writeln!(w, "# meshpipe")?;
        for lib in material_libs {
            writeln!(w, "mtllib {lib}")?;
        }
        for v in &mesh.vertices {
            writeln!(w, "v {} {} {}", v.x, v.y, v.z)?;
        }
        if let Some(uvs) = &mesh.uvs {
            for uv in uvs {
                writeln!(w, "vt {} {}", uv[0], uv[1])?;
            }
        }
        if let Some(normals) = &mesh.normals {
            for n in normals {
                writeln!(w, "vn {} {} {}", n.x, n.y, n.z)?;
            }
        }

        let has_uv = mesh.uvs.is_some();
        let has_normal = mesh.normals.is_some();
        let mut current: Option<usize> = None;
        for (fi, face) in mesh.faces.iter().enumerate() {
            if let Some(slots) = &mesh.face_materials {
                let slot = slots[fi];
                if current != Some(slot) {
                    writeln!(w, "usemtl {}", mesh.materials[slot])?;
                    current = Some(slot);
                }
            }
            write!(w, "f")?;
            for &i in face {
                let i = i + 1;
                match (has_uv, has_normal) {
                    (true, true) => write!(w, " {i}/{i}/{i}")?,
                    (true, false) => write!(w, " {i}/{i}")?,
                    (false, true) => write!(w, " {i}//{i}")?,
                    (false, false) => write!(w, " {i}")?,
                }
            }
            writeln!(w)?;
        }
        Ok(())
    }
}

/// Read the `mtllib` references of an OBJ
pub fn read_material_libs<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    Ok(parse_raw(reader)?.material_libraries)
}

/// Replace every `mtllib` line with a single reference, inserting one if absent
pub fn set_material_lib<P: AsRef<Path>>(path: P, mtl_name: &str) -> Result<()> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let mut out = String::with_capacity(text.len() + mtl_name.len() + 8);
    let directive = format!("mtllib {mtl_name}");
    let mut placed = false;
    for line in text.lines() {
        if line.trim_start().starts_with("mtllib") {
            if !placed {
                out.push_str(&directive);
                out.push('\n');
                placed = true;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !placed {
        out = format!("{directive}\n{out}");
    }
    std::fs::write(path, out)?;
    Ok(())
}
