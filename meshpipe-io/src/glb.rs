//! Minimal binary glTF support
//!
//! Reading goes through the `gltf` crate and flattens every triangle
//! primitive of the default scene into one [`TriangleMesh`], applying node
//! transforms. Writing emits a single mesh with one primitive per material
//! slot and a plain PBR base color per material. Images are neither extracted
//! nor embedded here.

use crate::{IoError, MeshReader, MeshWriter};
use meshpipe_core::{Point3f, Result, Transform3D, Transformable, TriangleMesh, Vector3f};
use serde_json::json;
use std::path::Path;
use tracing::debug;

const GLB_MAGIC: u32 = 0x4654_6C67; // "glTF"
const GLB_VERSION: u32 = 2;
const GLB_CHUNK_JSON: u32 = 0x4E4F_534A; // "JSON"
const GLB_CHUNK_BIN: u32 = 0x004E_4942; // "BIN\0"

const TARGET_ARRAY_BUFFER: u32 = 34962;
const TARGET_ELEMENT_ARRAY_BUFFER: u32 = 34963;
const COMPONENT_FLOAT: u32 = 5126;
const COMPONENT_UNSIGNED_INT: u32 = 5125;

pub struct GlbReader;
pub struct GlbWriter;

/// Base material written into or read from a GLB
#[derive(Debug, Clone, PartialEq)]
pub struct GlbMaterial {
    pub name: String,
    pub base_color: [f32; 4],
}

impl Default for GlbMaterial {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base_color: [0.8, 0.8, 0.8, 1.0],
        }
    }
}

/// Geometry and material summary of a GLB file
#[derive(Debug, Clone, Default)]
pub struct GlbScene {
    pub mesh: TriangleMesh,
    /// One entry per material slot of `mesh`
    pub materials: Vec<GlbMaterial>,
    /// Number of images embedded in the file
    pub image_count: usize,
}

impl MeshReader for GlbReader {
    fn read_mesh<P: AsRef<Path>>(path: P) -> Result<TriangleMesh> {
        Ok(Self::read_scene(path)?.mesh)
    }
}

impl MeshWriter for GlbWriter {
    fn write_mesh<P: AsRef<Path>>(mesh: &TriangleMesh, path: P) -> Result<()> {
        Self::write_scene(mesh, &[], path)
    }
}

impl GlbReader {
    pub fn read_scene<P: AsRef<Path>>(path: P) -> Result<GlbScene> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(IoError::FileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let bytes = std::fs::read(path)?;
        Ok(Self::parse(&bytes)?)
    }

    pub fn parse(bytes: &[u8]) -> std::result::Result<GlbScene, IoError> {
        let gltf = gltf::Gltf::from_slice(bytes).map_err(|e| IoError::InvalidFormat {
            format: format!("glb: {e}"),
        })?;
        let blob = gltf.blob.as_deref();

        let mut builder = SceneBuilder {
            scene: GlbScene {
                image_count: gltf.document.images().len(),
                ..GlbScene::default()
            },
            slots: Vec::new(),
            face_slots: Vec::new(),
        };

        let scene_root = gltf
            .document
            .default_scene()
            .or_else(|| gltf.document.scenes().next());
        match scene_root {
            Some(root) => {
                let mut stack: Vec<(gltf::Node, Transform3D)> = root
                    .nodes()
                    .map(|n| (n, Transform3D::identity()))
                    .collect();
                while let Some((node, parent)) = stack.pop() {
                    let world = parent * Transform3D::from_column_arrays(node.transform().matrix());
                    if let Some(mesh) = node.mesh() {
                        builder.add_mesh(&mesh, &world, blob)?;
                    }
                    stack.extend(node.children().map(|c| (c, world)));
                }
            }
            None => {
                for mesh in gltf.document.meshes() {
                    builder.add_mesh(&mesh, &Transform3D::identity(), blob)?;
                }
            }
        }

        let SceneBuilder {
            mut scene,
            face_slots,
            ..
        } = builder;
        if !scene.materials.is_empty() {
            let names = scene.materials.iter().map(|m| m.name.clone()).collect();
            scene.mesh.set_face_materials(names, face_slots);
        }
        debug!(
            vertices = scene.mesh.vertex_count(),
            faces = scene.mesh.face_count(),
            images = scene.image_count,
            "parsed glb"
        );
        Ok(scene)
    }
}

struct SceneBuilder {
    scene: GlbScene,
    /// glTF material index behind every slot
    slots: Vec<Option<usize>>,
    face_slots: Vec<usize>,
}

impl SceneBuilder {
    fn add_mesh(
        &mut self,
        mesh: &gltf::Mesh,
        transform: &Transform3D,
        blob: Option<&[u8]>,
    ) -> std::result::Result<(), IoError> {
        for primitive in mesh.primitives() {
            if primitive.mode() != gltf::mesh::Mode::Triangles {
                continue;
            }
            let reader = primitive.reader(|buffer| match buffer.source() {
                gltf::buffer::Source::Bin => blob,
                gltf::buffer::Source::Uri(_) => None,
            });
            let Some(positions) = reader.read_positions() else {
                continue;
            };
            let mut part = TriangleMesh::from_vertices_and_faces(
                positions.map(|p| Point3f::new(p[0], p[1], p[2])).collect(),
                Vec::new(),
            );
            let count = part.vertex_count();
            let indices: Vec<usize> = match reader.read_indices() {
                Some(ix) => ix.into_u32().map(|i| i as usize).collect(),
                None => (0..count).collect(),
            };
            if indices.iter().any(|&i| i >= count) {
                return Err(IoError::InvalidFormat {
                    format: "glb: index out of range".to_string(),
                });
            }
            part.faces = indices.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();
            if let Some(normals) = reader.read_normals() {
                part.set_normals(normals.map(|n| Vector3f::new(n[0], n[1], n[2])).collect());
            }
            if let Some(uvs) = reader.read_tex_coords(0) {
                // glTF puts the texture origin at the top left
                part.set_uvs(uvs.into_f32().map(|t| [t[0], 1.0 - t[1]]).collect());
            }
            part.transform(transform);

            let material = primitive.material();
            let key = material.index();
            let slot = match self.slots.iter().position(|s| *s == key) {
                Some(slot) => slot,
                None => {
                    self.slots.push(key);
                    self.scene.materials.push(GlbMaterial {
                        name: material.name().map(str::to_string).unwrap_or_else(|| match key {
                            Some(i) => format!("material_{i}"),
                            None => "default".to_string(),
                        }),
                        base_color: material.pbr_metallic_roughness().base_color_factor(),
                    });
                    self.slots.len() - 1
                }
            };
            self.face_slots
                .extend(std::iter::repeat(slot).take(part.face_count()));
            append(&mut self.scene.mesh, part);
        }
        Ok(())
    }
}

/// Concatenate `part` onto `target`, keeping attributes only when both have them
fn append(target: &mut TriangleMesh, part: TriangleMesh) {
    let first = target.vertices.is_empty();
    let offset = target.vertices.len();

    let normals = match (first, target.normals.take(), part.normals) {
        (true, _, n) => n,
        (false, Some(mut a), Some(b)) => {
            a.extend(b);
            Some(a)
        }
        _ => None,
    };
    let uvs = match (first, target.uvs.take(), part.uvs) {
        (true, _, u) => u,
        (false, Some(mut a), Some(b)) => {
            a.extend(b);
            Some(a)
        }
        _ => None,
    };

    target.vertices.extend(part.vertices);
    target
        .faces
        .extend(part.faces.iter().map(|f| [f[0] + offset, f[1] + offset, f[2] + offset]));
    target.normals = normals;
    target.uvs = uvs;
}

impl GlbWriter {
    /// Write a mesh; `materials` is indexed by the mesh's material slots
    pub fn write_scene<P: AsRef<Path>>(
        mesh: &TriangleMesh,
        materials: &[GlbMaterial],
        path: P,
    ) -> Result<()> {
        let bytes = Self::to_bytes(mesh, materials)?;
        std::fs::write(path.as_ref(), bytes)?;
        Ok(())
    }

    pub fn to_bytes(
        mesh: &TriangleMesh,
        materials: &[GlbMaterial],
    ) -> std::result::Result<Vec<u8>, IoError> {
        if mesh.is_empty() {
            return Err(IoError::WriteError {
                message: "cannot write an empty mesh".to_string(),
            });
        }

        let mut bin: Vec<u8> = Vec::new();
        let mut views = Vec::new();
        let mut accessors = Vec::new();

        let mut push_view = |bin: &mut Vec<u8>, data: &[u8], target: u32| -> usize {
            while bin.len() % 4 != 0 {
                bin.push(0);
            }
            views.push(json!({
                "buffer": 0,
                "byteOffset": bin.len(),
                "byteLength": data.len(),
                "target": target,
            }));
            bin.extend_from_slice(data);
            views.len() - 1
        };

        let positions: Vec<[f32; 3]> = mesh.vertices.iter().map(|p| [p.x, p.y, p.z]).collect();
        let (min, max) = positions.iter().fold(
            ([f32::MAX; 3], [f32::MIN; 3]),
            |(mut lo, mut hi), p| {
                for k in 0..3 {
                    lo[k] = lo[k].min(p[k]);
                    hi[k] = hi[k].max(p[k]);
                }
                (lo, hi)
            },
        );
        let view = push_view(&mut bin, bytemuck::cast_slice(positions.as_slice()), TARGET_ARRAY_BUFFER);
        accessors.push(json!({
            "bufferView": view,
            "componentType": COMPONENT_FLOAT,
            "count": positions.len(),
            "type": "VEC3",
            "min": min,
            "max": max,
        }));
        let mut attributes = serde_json::Map::new();
        attributes.insert("POSITION".into(), json!(accessors.len() - 1));

        if let Some(normals) = &mesh.normals {
            let data: Vec<[f32; 3]> = normals.iter().map(|n| [n.x, n.y, n.z]).collect();
            let view = push_view(&mut bin, bytemuck::cast_slice(data.as_slice()), TARGET_ARRAY_BUFFER);
            accessors.push(json!({
                "bufferView": view,
                "componentType": COMPONENT_FLOAT,
                "count": data.len(),
                "type": "VEC3",
            }));
            attributes.insert("NORMAL".into(), json!(accessors.len() - 1));
        }
        if let Some(uvs) = &mesh.uvs {
            let data: Vec<[f32; 2]> = uvs.iter().map(|t| [t[0], 1.0 - t[1]]).collect();
            let view = push_view(&mut bin, bytemuck::cast_slice(data.as_slice()), TARGET_ARRAY_BUFFER);
            accessors.push(json!({
                "bufferView": view,
                "componentType": COMPONENT_FLOAT,
                "count": data.len(),
                "type": "VEC2",
            }));
            attributes.insert("TEXCOORD_0".into(), json!(accessors.len() - 1));
        }

        let slot_count = mesh.materials.len().max(1);
        let mut groups: Vec<Vec<u32>> = vec![Vec::new(); slot_count];
        for (fi, face) in mesh.faces.iter().enumerate() {
            let slot = mesh
                .face_materials
                .as_ref()
                .map(|s| s[fi])
                .unwrap_or(0)
                .min(slot_count - 1);
            groups[slot].extend(face.iter().map(|&i| i as u32));
        }

        let mut primitives = Vec::new();
        let mut material_json = Vec::new();
        for (slot, indices) in groups.iter().enumerate() {
            if indices.is_empty() {
                continue;
            }
            let view = push_view(
                &mut bin,
                bytemuck::cast_slice(indices.as_slice()),
                TARGET_ELEMENT_ARRAY_BUFFER,
            );
            accessors.push(json!({
                "bufferView": view,
                "componentType": COMPONENT_UNSIGNED_INT,
                "count": indices.len(),
                "type": "SCALAR",
            }));
            let material = materials.get(slot).cloned().unwrap_or_else(|| GlbMaterial {
                name: mesh
                    .materials
                    .get(slot)
                    .cloned()
                    .unwrap_or_else(|| GlbMaterial::default().name),
                ..GlbMaterial::default()
            });
            material_json.push(json!({
                "name": material.name,
                "pbrMetallicRoughness": {
                    "baseColorFactor": material.base_color,
                    "metallicFactor": 0.0,
                    "roughnessFactor": 1.0,
                },
                "doubleSided": false,
            }));
            primitives.push(json!({
                "attributes": attributes.clone(),
                "indices": accessors.len() - 1,
                "material": material_json.len() - 1,
                "mode": 4,
            }));
        }
        while bin.len() % 4 != 0 {
            bin.push(0);
        }

        let document = json!({
            "asset": { "version": "2.0", "generator": "meshpipe" },
            "scene": 0,
            "scenes": [{ "nodes": [0] }],
            "nodes": [{ "mesh": 0, "name": "mesh" }],
            "meshes": [{ "name": "mesh", "primitives": primitives }],
            "materials": material_json,
            "accessors": accessors,
            "bufferViews": views,
            "buffers": [{ "byteLength": bin.len() }],
        });
        let json_bytes = serde_json::to_vec(&document).map_err(|e| IoError::WriteError {
            message: e.to_string(),
        })?;

        Ok(assemble_glb(&json_bytes, &bin))
    }
}

/// Lay out header, JSON chunk and BIN chunk with 4-byte padding
fn assemble_glb(json_bytes: &[u8], bin: &[u8]) -> Vec<u8> {
    let json_padded = (json_bytes.len() + 3) & !3;
    let bin_padded = (bin.len() + 3) & !3;
    let total = 12 + 8 + json_padded + 8 + bin_padded;

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    buf.extend_from_slice(&GLB_VERSION.to_le_bytes());
    buf.extend_from_slice(&(total as u32).to_le_bytes());

    buf.extend_from_slice(&(json_padded as u32).to_le_bytes());
    buf.extend_from_slice(&GLB_CHUNK_JSON.to_le_bytes());
    buf.extend_from_slice(json_bytes);
    buf.resize(buf.len() + json_padded - json_bytes.len(), b' ');

    buf.extend_from_slice(&(bin_padded as u32).to_le_bytes());
    buf.extend_from_slice(&GLB_CHUNK_BIN.to_le_bytes());
    buf.extend_from_slice(bin);
    buf.resize(buf.len() + bin_padded - bin.len(), 0u8);
    buf
}
