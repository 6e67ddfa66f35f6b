//! Pipeline configuration
//!
//! Values come from defaults, an optional JSON file, and environment
//! overrides applied last.

use crate::error::{PipelineError, Result};
use meshpipe_simplification::ProgressiveOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default name of the remeshing binary when no path is configured
pub const DEFAULT_INSTANT_MESHES: &str = "Instant Meshes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Scratch root, cleared before and after every request
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub log_dir: PathBuf,
    pub blender_executable: Option<PathBuf>,
    pub instant_meshes_path: Option<PathBuf>,
    pub default_target_faces: usize,
    pub conversion_timeout_secs: u64,
    pub decimation_host_timeout_secs: u64,
    pub remesh_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub stability_grace_secs: u64,
    pub max_decimation_steps: usize,
    pub decimation_budget_secs: u64,
    /// Meshes above this face count are decimated by the automation host
    pub large_mesh_threshold: usize,
    pub fetch_retries: usize,
    pub fetch_initial_delay_ms: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("./temp"),
            output_dir: PathBuf::from("./output_remesh"),
            archive_dir: PathBuf::from("./archives"),
            log_dir: PathBuf::from("./logs"),
            blender_executable: None,
            instant_meshes_path: None,
            default_target_faces: 3000,
            conversion_timeout_secs: 180,
            decimation_host_timeout_secs: 600,
            remesh_timeout_secs: 300,
            poll_interval_ms: 1000,
            stability_grace_secs: 30,
            max_decimation_steps: 10,
            decimation_budget_secs: 300,
            large_mesh_threshold: 1_000_000,
            fetch_retries: 3,
            fetch_initial_delay_ms: 2000,
            fetch_timeout_secs: 60,
        }
    }
}

impl PipelineConfig {
    /// Defaults, then `path` if given, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| PipelineError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Apply environment-style overrides through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MESHPIPE_TEMP_DIR") {
            self.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = get("MESHPIPE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = get("MESHPIPE_ARCHIVE_DIR") {
            self.archive_dir = PathBuf::from(v);
        }
        if let Some(v) = get("MESHPIPE_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        // BLENDER_EXECUTABLE wins over BLENDER_PATH
        if let Some(v) = get("BLENDER_EXECUTABLE").or_else(|| get("BLENDER_PATH")) {
            self.blender_executable = Some(PathBuf::from(v));
        }
        if let Some(v) = get("INSTANT_MESHES_PATH") {
            self.instant_meshes_path = Some(PathBuf::from(v));
        }
    }

    /// Create output, archive and log directories
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.output_dir, &self.archive_dir, &self.log_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn instant_meshes(&self) -> PathBuf {
        self.instant_meshes_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTANT_MESHES))
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_secs)
    }

    pub fn decimation_host_timeout(&self) -> Duration {
        Duration::from_secs(self.decimation_host_timeout_secs)
    }

    pub fn remesh_timeout(&self) -> Duration {
        Duration::from_secs(self.remesh_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stability_grace(&self) -> Duration {
        Duration::from_secs(self.stability_grace_secs)
    }

    pub fn fetch_initial_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_initial_delay_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Decimator settings derived from this configuration
    pub fn progressive_options(&self, preserve_boundaries: bool) -> ProgressiveOptions {
        ProgressiveOptions {
            max_steps: self.max_decimation_steps,
            time_budget: Duration::from_secs(self.decimation_budget_secs),
            preserve_boundaries,
            ..ProgressiveOptions::default()
        }
    }
}
