//! Material library maintenance around the working OBJ
//!
//! Stages that rewrite geometry tend to drop or misplace the material
//! library. The helpers here put the MTL and its textures back next to the
//! OBJ and rewrite the texture directives from the classified texture set.

use crate::error::Result;
use crate::textures::{assign_channels, tripo_rename, TextureChannel, TextureRecord, TextureSet};
use meshpipe_io::obj::{read_material_libs, set_material_lib, DEFAULT_MATERIAL};
use meshpipe_io::{MaterialLibrary, MtlDocument, MtlMaterial};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// MTL lines for one texture in `channel`
pub fn directives_for(channel: TextureChannel, file: &str) -> Vec<String> {
    match channel {
        TextureChannel::Diffuse => vec![format!("map_Kd {file}")],
        TextureChannel::Normal => vec![format!("map_Bump -bm 1.0 {file}"), format!("norm {file}")],
        TextureChannel::Metallic => vec![format!("map_Pm {file}")],
        TextureChannel::Roughness => vec![format!("map_Pr {file}")],
        TextureChannel::MetallicRoughness => {
            vec![format!("map_Pm {file}"), format!("map_Pr {file}")]
        }
        TextureChannel::OcclusionRoughnessMetallic => vec![
            format!("map_Pr -imfchan g {file}"),
            format!("map_Pm -imfchan b {file}"),
        ],
        TextureChannel::Ao => vec![format!("map_Ka {file}")],
        TextureChannel::Emission => vec![format!("map_Ke {file}")],
        TextureChannel::Unclassified => Vec::new(),
    }
}

/// Channel implied by an existing map directive
pub fn channel_of_directive(directive: &str) -> Option<TextureChannel> {
    match directive.to_ascii_lowercase().as_str() {
        "map_kd" => Some(TextureChannel::Diffuse),
        "map_bump" | "bump" | "norm" => Some(TextureChannel::Normal),
        "map_pm" => Some(TextureChannel::Metallic),
        "map_pr" => Some(TextureChannel::Roughness),
        "map_ka" => Some(TextureChannel::Ao),
        "map_ke" => Some(TextureChannel::Emission),
        _ => None,
    }
}

fn stem_lower(record: &TextureRecord) -> String {
    Path::new(&record.file_name())
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Rewrite texture directives of every material from `textures`.
///
/// A library without any material gets a default block. With an empty
/// texture set existing directives are left alone. Unclassified files that
/// the material already references keep the channel of their directive.
/// Returns the number of directives written.
pub fn rewrite_mtl(doc: &mut MtlDocument, textures: &TextureSet) -> usize {
    if doc.materials.is_empty() {
        doc.materials.push(MtlMaterial::default_block(DEFAULT_MATERIAL));
    }
    if textures.is_empty() {
        return 0;
    }

    let names: Vec<String> = doc.materials.iter().map(|m| m.name.to_lowercase()).collect();
    let single = doc.materials.len() == 1;
    let owned_by = |record: &TextureRecord, name: &str| {
        !name.is_empty() && stem_lower(record).contains(name)
    };

    let mut written = 0;
    for (material, name) in doc.materials.iter_mut().zip(&names) {
        let chosen: Vec<&TextureRecord> = if single {
            textures.iter().collect()
        } else {
            // own textures plus the ones no material claims
            textures
                .iter()
                .filter(|r| owned_by(r, name) || !names.iter().any(|n| owned_by(r, n)))
                .collect()
        };

        let existing = material.maps();
        let adjusted: Vec<TextureRecord> = chosen
            .into_iter()
            .map(|record| {
                let mut record = record.clone();
                if record.channel == TextureChannel::Unclassified {
                    let file = record.file_name();
                    if let Some(channel) = existing
                        .iter()
                        .find(|m| m.file_name() == file)
                        .and_then(|m| channel_of_directive(&m.directive))
                    {
                        record.channel = channel;
                    }
                }
                record
            })
            .collect();

        material.remove_maps();
        for (channel, record) in assign_channels(&adjusted) {
            for line in directives_for(channel, &record.file_name()) {
                material.push(line);
                written += 1;
            }
        }
        debug!(material = %material.name, maps = material.maps().len(), "Material rewritten");
    }
    written
}

/// The MTL used by `obj`: its first existing `mtllib`, else `<stem>.mtl`
pub fn find_material_file(obj: &Path) -> Option<PathBuf> {
    let dir = obj.parent()?;
    if let Ok(libs) = read_material_libs(obj) {
        if let Some(found) = libs.iter().map(|lib| dir.join(lib)).find(|p| p.is_file()) {
            return Some(found);
        }
    }
    let same_stem = obj.with_extension("mtl");
    same_stem.is_file().then_some(same_stem)
}

/// Resolve a map path written in an MTL living in `dir`
fn resolve_map(dir: &Path, path: &str) -> PathBuf {
    let normalized = path.replace('\\', "/");
    let candidate = PathBuf::from(&normalized);
    if candidate.is_absolute() {
        candidate
    } else {
        dir.join(candidate)
    }
}

/// Copy `source` into `dir` under its own name.
///
/// Skips the copy when the destination is the source or already holds the
/// same bytes. Returns whether a file was copied.
pub fn copy_beside(source: &Path, dir: &Path) -> std::io::Result<bool> {
    let Some(name) = source.file_name() else {
        return Ok(false);
    };
    let dest = dir.join(name);
    if dest == source || same_contents(source, &dest) {
        return Ok(false);
    }
    std::fs::copy(source, &dest)?;
    Ok(true)
}

fn same_contents(a: &Path, b: &Path) -> bool {
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) if ma.len() == mb.len() => {
            matches!((std::fs::read(a), std::fs::read(b)), (Ok(x), Ok(y)) if x == y)
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub mtl_path: PathBuf,
    /// File names copied next to the OBJ
    pub copied: Vec<String>,
    pub directives: usize,
}

/// Make the OBJ self-contained.
///
/// Every texture of `textures` and every map the MTL references is copied
/// next to the OBJ, map paths become bare file names, and directives are
/// rewritten from the texture set. An OBJ without a material library gets
/// `<stem>.mtl`.
pub fn reconcile_materials(obj: &Path, textures: &TextureSet) -> Result<ReconcileReport> {
    let dir = obj.parent().unwrap_or_else(|| Path::new("."));
    let mtl_path = match find_material_file(obj) {
        Some(path) => path,
        None => {
            let path = obj.with_extension("mtl");
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{DEFAULT_MATERIAL}.mtl"));
            set_material_lib(obj, &name)?;
            info!(mtl = %path.display(), "Created material library");
            path
        }
    };
    let mut doc = if mtl_path.is_file() {
        MtlDocument::read(&mtl_path)?
    } else {
        MtlDocument::default()
    };
    let mtl_dir = mtl_path.parent().unwrap_or(dir);

    let mut report = ReconcileReport {
        mtl_path: mtl_path.clone(),
        ..ReconcileReport::default()
    };
    let mut copy = |source: &Path| match copy_beside(source, dir) {
        Ok(true) => {
            report
                .copied
                .push(source.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
        }
        Ok(false) => {}
        Err(e) => warn!(path = %source.display(), error = %e, "Failed to copy texture"),
    };

    for record in textures.iter() {
        if record.source.is_file() {
            copy(&record.source);
        }
    }
    for material in &doc.materials {
        for map in material.maps() {
            let source = resolve_map(mtl_dir, &map.path);
            if source.is_file() {
                copy(&source);
            }
        }
    }
    for material in &mut doc.materials {
        material.flatten_map_paths();
    }

    let mut local = textures.clone();
    local.relocate(dir);
    let library = MaterialLibrary::parse(&doc.to_string()).map_err(meshpipe_core::Error::from)?;
    for file in library.texture_files() {
        let path = dir.join(&file);
        if path.is_file() {
            local.insert(path);
        }
    }
    report.directives = rewrite_mtl(&mut doc, &local);
    doc.write(&mtl_path)?;
    info!(
        mtl = %mtl_path.display(),
        copied = report.copied.len(),
        directives = report.directives,
        "Materials reconciled"
    );
    Ok(report)
}

/// Reattach the original material library to a regenerated OBJ.
///
/// The MTL and its textures are copied next to `new_obj` and the OBJ's
/// `mtllib` is pointed at it. Returns the MTL path, or `None` when the
/// original had no material library.
pub fn restore_material(new_obj: &Path, original_obj: &Path) -> Result<Option<PathBuf>> {
    let Some(original_mtl) = find_material_file(original_obj) else {
        debug!(obj = %original_obj.display(), "No material library to restore");
        return Ok(None);
    };
    let target_dir = new_obj.parent().unwrap_or_else(|| Path::new("."));
    let source_dir = original_mtl.parent().unwrap_or_else(|| Path::new("."));
    let Some(mtl_name) = original_mtl.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(None);
    };

    copy_beside(&original_mtl, target_dir)?;
    let doc = MtlDocument::read(&original_mtl)?;
    for material in &doc.materials {
        for map in material.maps() {
            let source = resolve_map(source_dir, &map.path);
            if source.is_file() {
                if let Err(e) = copy_beside(&source, target_dir) {
                    warn!(path = %source.display(), error = %e, "Failed to copy texture");
                }
            }
        }
    }
    let mut loose = TextureSet::new();
    if loose.scan_dir(source_dir).is_ok() {
        for record in loose.iter() {
            if let Err(e) = copy_beside(&record.source, target_dir) {
                warn!(path = %record.source.display(), error = %e, "Failed to copy texture");
            }
        }
    }

    set_material_lib(new_obj, &mtl_name)?;
    let restored = target_dir.join(&mtl_name);
    info!(obj = %new_obj.display(), mtl = %restored.display(), "Material restored");
    Ok(Some(restored))
}

/// Rename Tripo-style numbered textures in `dir` to keyword names.
///
/// MTL files in the directory are updated to the new names. Returns
/// `(old, new)` pairs.
pub fn rename_tripo_textures(dir: &Path) -> Result<Vec<(String, String)>> {
    let mut renamed = Vec::new();
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?.flatten().map(|e| e.path()).collect();
    entries.sort();
    for path in &entries {
        let Some(old) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(new) = tripo_rename(old) else {
            continue;
        };
        let dest = dir.join(&new);
        if dest.exists() {
            continue;
        }
        std::fs::rename(path, &dest)?;
        renamed.push((old.to_string(), new));
    }
    if renamed.is_empty() {
        return Ok(renamed);
    }

    for path in &entries {
        let is_mtl = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("mtl"));
        if !is_mtl || !path.is_file() {
            continue;
        }
        let mut text = std::fs::read_to_string(path)?;
        for (old, new) in &renamed {
            text = text.replace(old.as_str(), new);
        }
        std::fs::write(path, text)?;
    }
    info!(count = renamed.len(), "Renamed Tripo textures");
    Ok(renamed)
}
