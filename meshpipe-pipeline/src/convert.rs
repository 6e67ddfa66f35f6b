//! Conversion between OBJ packages and GLB scenes
//!
//! Both directions try the automation host first. When the host is missing,
//! times out or fails, a minimal conversion through `meshpipe-io` keeps the
//! geometry and the base material colors. Textures are neither extracted
//! nor embedded on that path, and the outcome is marked degraded.

use crate::blender::{pack_params, unpack_params, AutomationHost, HostScript};
use crate::error::Result;
use crate::log::ProcessingLog;
use crate::material::{find_material_file, reconcile_materials};
use crate::textures::{assign_channels, is_texture_file, TextureChannel, TextureSet};
use meshpipe_io::mtl::{diffuse_color, opacity};
use meshpipe_io::{
    GlbMaterial, GlbReader, GlbWriter, LibraryMaterial, MaterialLibrary, MtlDocument, MtlMaterial, ObjReader,
    ObjWriter,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionOutcome {
    pub output: PathBuf,
    /// Textures extracted (unpack) or embedded (pack)
    pub textures: Vec<PathBuf>,
    /// Why the minimal conversion was used, if it was
    pub degraded: Option<String>,
}

impl ConversionOutcome {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

fn texture_files_in(dir: &Path) -> BTreeSet<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(is_texture_file))
                .collect()
        })
        .unwrap_or_default()
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string())
}

/// Convert `glb` into `<output_dir>/<stem>.obj` with an MTL and loose textures
pub fn unpack_glb(
    host: &AutomationHost<'_>,
    glb: &Path,
    output_dir: &Path,
    timeout: Duration,
    log: &mut ProcessingLog,
) -> Result<ConversionOutcome> {
    std::fs::create_dir_all(output_dir)?;
    let obj = output_dir.join(format!("{}.obj", stem_of(glb)));

    let degraded = if host.is_available() {
        let before = texture_files_in(output_dir);
        let params = unpack_params(glb, output_dir);
        match host.run_to_completion(HostScript::UnpackGlb, params, &obj, timeout) {
            Ok(()) => {
                let textures: Vec<PathBuf> = texture_files_in(output_dir)
                    .difference(&before)
                    .cloned()
                    .collect();
                let mut set = TextureSet::new();
                set.extend(textures.iter().cloned());
                let report = reconcile_materials(&obj, &set)?;
                log.info(
                    "unpack",
                    format!(
                        "GLB converted to OBJ with {} textures ({} material directives)",
                        textures.len(),
                        report.directives
                    ),
                );
                return Ok(ConversionOutcome {
                    output: obj,
                    textures,
                    degraded: None,
                });
            }
            Err(e) => e.to_string(),
        }
    } else {
        "automation host unavailable".to_string()
    };

    log.warn("unpack", format!("{degraded}; using minimal GLB to OBJ conversion"));
    let scene = GlbReader::read_scene(glb)?;
    let mtl_name = format!("{}.mtl", stem_of(glb));
    let mut doc = MtlDocument::default();
    doc.preamble.push("# meshpipe minimal conversion".to_string());
    for material in &scene.materials {
        let [r, g, b, a] = material.base_color;
        let mut block = MtlMaterial::new(material.name.clone());
        block.push("Ka 1.000000 1.000000 1.000000");
        block.push(format!("Kd {r:.6} {g:.6} {b:.6}"));
        block.push("Ks 0.500000 0.500000 0.500000");
        block.push("Ns 50.000000");
        block.push(format!("d {a:.6}"));
        block.push("illum 2");
        doc.materials.push(block);
    }
    doc.write(output_dir.join(&mtl_name))?;
    ObjWriter::write_document(&scene.mesh, &[mtl_name], &obj)?;
    if scene.image_count > 0 {
        log.warn(
            "unpack",
            format!("{} embedded images were not extracted", scene.image_count),
        );
    }
    Ok(ConversionOutcome {
        output: obj,
        textures: Vec::new(),
        degraded: Some(degraded),
    })
}

/// Base color of an MTL block from `Kd` and `d`
fn base_color(material: Option<&LibraryMaterial>) -> [f32; 4] {
    let fallback = GlbMaterial::default().base_color;
    let Some(material) = material else {
        return fallback;
    };
    let [r, g, b] = diffuse_color(material).unwrap_or([fallback[0], fallback[1], fallback[2]]);
    [r, g, b, opacity(material).unwrap_or(1.0)]
}

/// Convert `obj` and its package into a self-contained `glb`
pub fn pack_obj(
    host: &AutomationHost<'_>,
    obj: &Path,
    glb: &Path,
    timeout: Duration,
    log: &mut ProcessingLog,
) -> Result<ConversionOutcome> {
    let dir = obj.parent().unwrap_or_else(|| Path::new("."));

    let degraded = if host.is_available() {
        let mut set = TextureSet::new();
        set.scan_dir(dir)?;
        let wiring: Vec<(String, TextureChannel)> = assign_channels(set.iter())
            .into_iter()
            .map(|(channel, record)| (record.file_name(), channel))
            .collect();
        let textures: Vec<PathBuf> = wiring.iter().map(|(file, _)| dir.join(file)).collect();
        match host.run_to_completion(HostScript::PackObj, pack_params(obj, &wiring), glb, timeout) {
            Ok(()) => {
                log.info(
                    "pack",
                    format!("OBJ packed to GLB with {} embedded textures", textures.len()),
                );
                return Ok(ConversionOutcome {
                    output: glb.to_path_buf(),
                    textures,
                    degraded: None,
                });
            }
            Err(e) => e.to_string(),
        }
    } else {
        "automation host unavailable".to_string()
    };

    log.warn("pack", format!("{degraded}; using minimal OBJ to GLB conversion"));
    let document = ObjReader::read_document(obj)?;
    let library = match find_material_file(obj) {
        Some(path) => Some(MaterialLibrary::read(path)?),
        None => None,
    };
    let lookup = |name: &str| {
        library
            .as_ref()
            .and_then(|doc| doc.material(name).or_else(|| doc.materials.first()))
    };
    let materials: Vec<GlbMaterial> = if document.mesh.materials.is_empty() {
        let first = library.as_ref().and_then(|doc| doc.materials.first());
        vec![GlbMaterial {
            name: first.map(|m| m.name.clone()).unwrap_or_else(|| GlbMaterial::default().name),
            base_color: base_color(first),
        }]
    } else {
        document
            .mesh
            .materials
            .iter()
            .map(|name| GlbMaterial {
                name: name.clone(),
                base_color: base_color(lookup(name)),
            })
            .collect()
    };
    GlbWriter::write_scene(&document.mesh, &materials, glb)?;
    Ok(ConversionOutcome {
        output: glb.to_path_buf(),
        textures: Vec::new(),
        degraded: Some(degraded),
    })
}
