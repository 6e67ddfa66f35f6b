//! Result archives and their maintenance
//!
//! An archive is a folder `<model>_<YYYYmmdd_HHMMSS>` under the archive root
//! holding `model/`, `textures/`, `logs/` and an `info.json` describing the
//! request. Archives are never modified after creation.

use crate::error::{PipelineError, Result};
use crate::log::ProcessingLog;
use chrono::{DateTime, Duration as ChronoDuration, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};
use walkdir::WalkDir;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn archive_error(context: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Archive(format!("{context}: {e}"))
}

fn size_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn modified(dir: &Path) -> SystemTime {
    std::fs::metadata(dir)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn format_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format(DATE_FORMAT).to_string()
}

/// Copy `source` into `dest` recursively
fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry.path().strip_prefix(source).map_err(std::io::Error::other)?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Everything that goes into one archive
#[derive(Debug, Clone)]
pub struct ArchiveContents<'a> {
    pub model: &'a Path,
    /// Material sidecar of the model, when it has one
    pub material: Option<&'a Path>,
    pub original_input: &'a str,
    /// Request, reports and decisions recorded in `info.json`
    pub processing_info: Value,
    /// Candidate textures in order; the first file of each name is kept
    pub textures: Vec<PathBuf>,
    pub log: &'a ProcessingLog,
}

/// Contents of `info.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub archive_created: String,
    pub original_input: String,
    pub output_model: String,
    pub processing_info: Value,
    pub copied_textures: Vec<String>,
    pub file_structure: BTreeMap<String, String>,
    pub processing_log: ProcessingLog,
}

fn file_structure() -> BTreeMap<String, String> {
    [
        ("model/", "final model and its material file"),
        ("textures/", "textures collected while processing"),
        ("logs/", "processing log of this request"),
        ("info.json", "request parameters and metadata"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveSummary {
    pub dirname: String,
    pub size: u64,
    pub size_mb: f64,
    pub created: String,
    pub processing_info: Value,
    pub original_input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveListing {
    pub archives: Vec<ArchiveSummary>,
    pub total_count: usize,
    /// Size of the listed archives
    pub total_size: u64,
    pub total_size_mb: f64,
    pub archive_directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpiredArchive {
    pub dirname: String,
    pub size: u64,
    pub created: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanReport {
    /// Candidates on a dry run, removed archives otherwise
    pub archives: Vec<ExpiredArchive>,
    pub deleted_count: usize,
    pub freed_space: u64,
    pub freed_space_mb: f64,
    pub dry_run: bool,
    pub cutoff_date: String,
}

// the archive list is keyed by what happened to it
impl Serialize for CleanReport {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("CleanReport", 6)?;
        let key = if self.dry_run { "dirs_to_delete" } else { "deleted_dirs" };
        s.serialize_field(key, &self.archives)?;
        s.serialize_field("deleted_count", &self.deleted_count)?;
        s.serialize_field("freed_space", &self.freed_space)?;
        s.serialize_field("freed_space_mb", &self.freed_space_mb)?;
        s.serialize_field("dry_run", &self.dry_run)?;
        s.serialize_field("cutoff_date", &self.cutoff_date)?;
        s.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveStats {
    pub exists: bool,
    pub archive_directory: PathBuf,
    pub total_archives: usize,
    pub total_size: u64,
    pub total_size_mb: f64,
    pub oldest_archive: Option<String>,
    pub newest_archive: Option<String>,
}

pub struct ArchiveManager {
    root: PathBuf,
    output_dir: PathBuf,
}

impl ArchiveManager {
    pub fn new(root: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Archive folders with their modification times, newest first
    fn archives(&self) -> Vec<(String, PathBuf, SystemTime)> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut dirs: Vec<(String, PathBuf, SystemTime)> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter_map(|p| {
                let name = p.file_name()?.to_string_lossy().into_owned();
                let time = modified(&p);
                Some((name, p, time))
            })
            .collect();
        dirs.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| b.0.cmp(&a.0)));
        dirs
    }

    fn unique_dir(&self, base: &str) -> PathBuf {
        let mut candidate = self.root.join(base);
        let mut n = 1;
        while candidate.exists() {
            candidate = self.root.join(format!("{base}_{n}"));
            n += 1;
        }
        candidate
    }

    /// Create an archive stamped with the current local time
    pub fn create(&self, contents: &ArchiveContents<'_>) -> Result<PathBuf> {
        self.create_at(contents, Local::now())
    }

    pub fn create_at(&self, contents: &ArchiveContents<'_>, now: DateTime<Local>) -> Result<PathBuf> {
        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        let model_name = contents
            .model
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::Archive("model path has no file name".into()))?;
        let stem = Path::new(&model_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| model_name.clone());

        if !contents.model.is_file() {
            return Err(PipelineError::Archive(format!(
                "model not found: {}",
                contents.model.display()
            )));
        }

        std::fs::create_dir_all(&self.root).map_err(|e| archive_error("cannot create archive root", e))?;
        let dir = self.unique_dir(&format!("{stem}_{stamp}"));
        let model_dir = dir.join("model");
        let textures_dir = dir.join("textures");
        let logs_dir = dir.join("logs");
        for sub in [&model_dir, &textures_dir, &logs_dir] {
            std::fs::create_dir_all(sub).map_err(|e| archive_error("cannot create archive folders", e))?;
        }

        std::fs::copy(contents.model, model_dir.join(&model_name))
            .map_err(|e| archive_error("cannot copy model", e))?;
        if let Some(material) = contents.material.filter(|m| m.is_file()) {
            if let Some(name) = material.file_name() {
                if let Err(e) = std::fs::copy(material, model_dir.join(name)) {
                    warn!(path = %material.display(), error = %e, "Material file not archived");
                }
            }
        }

        let mut seen = BTreeSet::new();
        let mut copied = Vec::new();
        for texture in &contents.textures {
            let Some(name) = texture.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !texture.is_file() || seen.contains(&name) {
                continue;
            }
            match std::fs::copy(texture, textures_dir.join(&name)) {
                Ok(_) => {
                    seen.insert(name.clone());
                    copied.push(name);
                }
                Err(e) => warn!(path = %texture.display(), error = %e, "Texture not archived"),
            }
        }

        contents
            .log
            .flush_to(&logs_dir.join("processing.log"))
            .map_err(|e| archive_error("cannot write processing log", e))?;

        let info = ArchiveInfo {
            archive_created: stamp,
            original_input: contents.original_input.to_string(),
            output_model: model_name,
            processing_info: contents.processing_info.clone(),
            copied_textures: copied,
            file_structure: file_structure(),
            processing_log: contents.log.clone(),
        };
        let json = serde_json::to_vec_pretty(&info).map_err(|e| archive_error("cannot encode info.json", e))?;
        std::fs::write(dir.join("info.json"), json).map_err(|e| archive_error("cannot write info.json", e))?;
        info!(archive = %dir.display(), textures = info.copied_textures.len(), "Archive created");
        Ok(dir)
    }

    /// Read the `info.json` of an archive
    pub fn read_info(&self, name: &str) -> Result<ArchiveInfo> {
        let path = self.archive_path(name)?.join("info.json");
        let text = std::fs::read_to_string(&path).map_err(|e| archive_error("cannot read info.json", e))?;
        serde_json::from_str(&text).map_err(|e| archive_error("invalid info.json", e))
    }

    fn archive_path(&self, name: &str) -> Result<PathBuf> {
        let plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains('/')
            && !name.contains('\\');
        if !plain {
            return Err(PipelineError::Archive(format!("invalid archive name: {name}")));
        }
        let path = self.root.join(name);
        if !path.is_dir() {
            return Err(PipelineError::Archive(format!("archive not found: {name}")));
        }
        Ok(path)
    }

    /// Most recent archives first
    pub fn list(&self, limit: usize) -> ArchiveListing {
        let all = self.archives();
        let archives: Vec<ArchiveSummary> = all
            .iter()
            .take(limit)
            .map(|(name, path, time)| {
                let info: Value = std::fs::read_to_string(path.join("info.json"))
                    .ok()
                    .and_then(|text| serde_json::from_str(&text).ok())
                    .unwrap_or(Value::Null);
                let size = dir_size(path);
                ArchiveSummary {
                    dirname: name.clone(),
                    size,
                    size_mb: size_mb(size),
                    created: format_time(*time),
                    processing_info: info.get("processing_info").cloned().unwrap_or_else(|| Value::Object(Default::default())),
                    original_input: info
                        .get("original_input")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown")
                        .to_string(),
                }
            })
            .collect();
        let total_size = archives.iter().map(|a| a.size).sum();
        ArchiveListing {
            total_count: all.len(),
            total_size,
            total_size_mb: size_mb(total_size),
            archive_directory: self.root.clone(),
            archives,
        }
    }

    /// Remove archives older than `days_to_keep` days
    pub fn clean(&self, days_to_keep: u32, dry_run: bool) -> CleanReport {
        self.clean_at(days_to_keep, dry_run, Local::now())
    }

    pub fn clean_at(&self, days_to_keep: u32, dry_run: bool, now: DateTime<Local>) -> CleanReport {
        self.clean_with(days_to_keep, dry_run, now, |path| std::fs::remove_dir_all(path))
    }

    fn clean_with<F>(&self, days_to_keep: u32, dry_run: bool, now: DateTime<Local>, remove: F) -> CleanReport
    where
        F: Fn(&Path) -> std::io::Result<()>,
    {
        let cutoff = now - ChronoDuration::days(i64::from(days_to_keep));
        let cutoff_time: SystemTime = cutoff.into();
        let expired: Vec<ExpiredArchive> = self
            .archives()
            .into_iter()
            .filter(|(_, _, time)| *time < cutoff_time)
            .map(|(name, path, time)| ExpiredArchive {
                dirname: name,
                size: dir_size(&path),
                created: format_time(time),
            })
            .collect();

        let archives = if dry_run {
            expired
        } else {
            expired
                .into_iter()
                .filter(|archive| match remove(&self.root.join(&archive.dirname)) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(archive = %archive.dirname, error = %e, "Failed to delete archive");
                        false
                    }
                })
                .collect()
        };
        // only archives actually removed count as freed
        let freed_space: u64 = archives.iter().map(|a| a.size).sum();
        if !dry_run {
            info!(deleted = archives.len(), freed_space, "Old archives removed");
        }
        CleanReport {
            deleted_count: archives.len(),
            archives,
            freed_space,
            freed_space_mb: size_mb(freed_space),
            dry_run,
            cutoff_date: cutoff.format(DATE_FORMAT).to_string(),
        }
    }

    /// Copy an archive out, replacing whatever is at the destination.
    ///
    /// Defaults to `<output_dir>/extracted/<name>`.
    pub fn copy_out(&self, name: &str, destination: Option<&Path>) -> Result<PathBuf> {
        let source = self.archive_path(name)?;
        let dest = destination
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.output_dir.join("extracted").join(name));
        if dest.is_dir() {
            std::fs::remove_dir_all(&dest).map_err(|e| archive_error("cannot replace destination", e))?;
        } else if dest.symlink_metadata().is_ok() {
            std::fs::remove_file(&dest).map_err(|e| archive_error("cannot replace destination", e))?;
        }
        copy_tree(&source, &dest).map_err(|e| archive_error("cannot copy archive", e))?;
        info!(archive = name, dest = %dest.display(), "Archive copied");
        Ok(dest)
    }

    pub fn stats(&self) -> ArchiveStats {
        if !self.root.is_dir() {
            return ArchiveStats {
                exists: false,
                archive_directory: self.root.clone(),
                total_archives: 0,
                total_size: 0,
                total_size_mb: 0.0,
                oldest_archive: None,
                newest_archive: None,
            };
        }
        let all = self.archives();
        let total_size = all.iter().map(|(_, path, _)| dir_size(path)).sum();
        ArchiveStats {
            exists: true,
            archive_directory: self.root.clone(),
            total_archives: all.len(),
            total_size,
            total_size_mb: size_mb(total_size),
            oldest_archive: all.last().map(|(name, _, _)| name.clone()),
            newest_archive: all.first().map(|(name, _, _)| name.clone()),
        }
    }
}
