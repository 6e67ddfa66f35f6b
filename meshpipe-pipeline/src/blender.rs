//! Blender as the automation host
//!
//! Discovery of a usable executable, the bundled worker scripts, and
//! [`AutomationHost`], which runs one script under the [`Supervisor`].
//! Scripts receive their parameters through a JSON file passed after `--`.

use crate::error::{PipelineError, Result};
use crate::process::wait_with_timeout;
use crate::supervisor::{ExternalInvocation, InvocationState, Supervisor};
use crate::textures::TextureChannel;
use crate::workspace::Workspace;
use meshpipe_core::SystemClock;
use serde::Serialize;
use serde_json::{json, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

const PATH_NAMES: &[&str] = &["blender", "blender3.6", "blender-3.6"];

#[cfg(target_os = "linux")]
const DEFAULT_LOCATIONS: &[&str] = &[
    "/usr/bin/blender",
    "/usr/local/bin/blender",
    "/opt/blender/blender",
    "/snap/bin/blender",
    "/var/lib/flatpak/exports/bin/org.blender.Blender",
];

#[cfg(target_os = "macos")]
const DEFAULT_LOCATIONS: &[&str] = &["/Applications/Blender.app/Contents/MacOS/Blender"];

#[cfg(target_os = "windows")]
const DEFAULT_LOCATIONS: &[&str] = &[
    r"C:\Program Files\Blender Foundation\Blender 3.6\blender.exe",
    r"C:\Program Files\Blender Foundation\Blender 4.0\blender.exe",
    r"C:\Program Files\Blender Foundation\Blender 4.1\blender.exe",
    r"C:\Program Files\Blender Foundation\Blender\blender.exe",
];

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
const DEFAULT_LOCATIONS: &[&str] = &[];

/// A Blender executable that answered `--version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlenderInfo {
    pub path: PathBuf,
    /// First line of the `--version` output
    pub version: String,
}

/// Candidates in search order: configured path, `BLENDER_EXECUTABLE`,
/// `BLENDER_PATH`, platform install locations, then names on `PATH`.
pub fn candidate_paths<F>(configured: Option<&Path>, lookup: F) -> Vec<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let mut candidates: Vec<PathBuf> = Vec::new();
    let mut push = |path: PathBuf| {
        if !candidates.contains(&path) {
            candidates.push(path);
        }
    };
    if let Some(path) = configured {
        push(path.to_path_buf());
    }
    for key in ["BLENDER_EXECUTABLE", "BLENDER_PATH"] {
        if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
            push(PathBuf::from(value));
        }
    }
    for location in DEFAULT_LOCATIONS {
        push(PathBuf::from(location));
    }
    for name in PATH_NAMES {
        push(PathBuf::from(name));
    }
    candidates
}

/// Run `candidate --version` and return the first line when it names Blender
pub fn query_version(candidate: &Path) -> Option<String> {
    let is_bare_name = candidate.components().count() == 1 && !candidate.is_absolute();
    if !is_bare_name && !candidate.is_file() {
        return None;
    }
    let mut child = Command::new(candidate)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    let status = wait_with_timeout(&mut child, VERSION_TIMEOUT, Duration::from_millis(100), &SystemClock)
        .ok()
        .flatten()?;
    if !status.success() {
        return None;
    }
    let mut output = String::new();
    child.stdout.take()?.read_to_string(&mut output).ok()?;
    if !output.contains("Blender") {
        return None;
    }
    output.lines().next().map(|line| line.trim().to_string())
}

/// First working candidate, consulting the process environment
pub fn find_blender(configured: Option<&Path>) -> Option<BlenderInfo> {
    for candidate in candidate_paths(configured, |key| std::env::var(key).ok()) {
        if let Some(version) = query_version(&candidate) {
            info!(path = %candidate.display(), %version, "Found Blender");
            return Some(BlenderInfo {
                path: candidate,
                version,
            });
        }
        debug!(path = %candidate.display(), "Not a usable Blender");
    }
    warn!("No Blender executable found");
    None
}

const COMMON_SCRIPT: &str = include_str!("../scripts/common.py");
const UNPACK_SCRIPT: &str = include_str!("../scripts/unpack_glb.py");
const PACK_SCRIPT: &str = include_str!("../scripts/pack_obj.py");
const DECIMATE_SCRIPT: &str = include_str!("../scripts/decimate.py");

/// The worker scripts shipped with the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostScript {
    UnpackGlb,
    PackObj,
    Decimate,
}

impl HostScript {
    /// Full script text, shared helpers first
    pub fn source(&self) -> String {
        let body = match self {
            HostScript::UnpackGlb => UNPACK_SCRIPT,
            HostScript::PackObj => PACK_SCRIPT,
            HostScript::Decimate => DECIMATE_SCRIPT,
        };
        format!("{COMMON_SCRIPT}\n{body}")
    }

    /// Human-readable operation name used in logs and timeout errors
    pub fn operation(&self) -> &'static str {
        match self {
            HostScript::UnpackGlb => "GLB to OBJ conversion",
            HostScript::PackObj => "OBJ to GLB conversion",
            HostScript::Decimate => "Large mesh decimation",
        }
    }
}

/// Image-name prefixes used to label images extracted from a GLB
const IMAGE_PREFIXES: &[(&str, TextureChannel)] = &[
    ("color", TextureChannel::Diffuse),
    ("diffuse", TextureChannel::Diffuse),
    ("albedo", TextureChannel::Diffuse),
    ("basecolor", TextureChannel::Diffuse),
    ("normalgl", TextureChannel::Normal),
    ("normal", TextureChannel::Normal),
    ("nrm", TextureChannel::Normal),
    ("orm", TextureChannel::OcclusionRoughnessMetallic),
    ("metallicroughness", TextureChannel::MetallicRoughness),
    ("metallic_roughness", TextureChannel::MetallicRoughness),
    ("roughness", TextureChannel::Roughness),
    ("rough", TextureChannel::Roughness),
    ("metallic", TextureChannel::Metallic),
    ("metal", TextureChannel::Metallic),
    ("ao", TextureChannel::Ao),
    ("occlusion", TextureChannel::Ao),
    ("ambient", TextureChannel::Ao),
    ("emission", TextureChannel::Emission),
    ("emissive", TextureChannel::Emission),
];

/// Parameters for [`HostScript::UnpackGlb`]
pub fn unpack_params(input: &Path, output_dir: &Path) -> Value {
    let prefixes: Vec<(&str, &str)> = IMAGE_PREFIXES
        .iter()
        .map(|(prefix, channel)| (*prefix, channel.as_str()))
        .collect();
    let indexed: Vec<&str> = TextureChannel::INDEXED.iter().map(|c| c.as_str()).collect();
    json!({
        "input": input.display().to_string(),
        "output_dir": output_dir.display().to_string(),
        "prefix_rules": prefixes,
        "indexed_names": indexed,
    })
}

/// Parameters for [`HostScript::PackObj`]
pub fn pack_params(input: &Path, textures: &[(String, TextureChannel)]) -> Value {
    let textures: Vec<(&str, &str)> = textures
        .iter()
        .map(|(file, channel)| (file.as_str(), channel.as_str()))
        .collect();
    json!({ "input": input.display().to_string(), "textures": textures })
}

/// Parameters for [`HostScript::Decimate`]
pub fn decimate_params(input: &Path, ratio: f64) -> Value {
    json!({ "input": input.display().to_string(), "ratio": ratio.clamp(0.0, 1.0) })
}

/// Runs worker scripts through the supervisor.
///
/// Script, parameter and signal files live in the request workspace.
pub struct AutomationHost<'a> {
    executable: Option<PathBuf>,
    workspace: &'a Workspace,
    supervisor: Supervisor<'a>,
}

impl<'a> AutomationHost<'a> {
    pub fn new(executable: Option<PathBuf>, workspace: &'a Workspace, supervisor: Supervisor<'a>) -> Self {
        Self {
            executable,
            workspace,
            supervisor,
        }
    }

    pub fn is_available(&self) -> bool {
        self.executable.is_some()
    }

    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    pub fn workspace(&self) -> &'a Workspace {
        self.workspace
    }

    pub fn clock(&self) -> &'a dyn meshpipe_core::Clock {
        self.supervisor.clock()
    }

    /// Run `script` until `output` is produced or `timeout` passes.
    ///
    /// `params` must be a JSON object; `output` and `signal` are added to it.
    pub fn run(
        &self,
        script: HostScript,
        mut params: Value,
        output: &Path,
        timeout: Duration,
    ) -> Result<InvocationState> {
        let Some(program) = &self.executable else {
            return Err(PipelineError::HostUnavailable(
                "no Blender executable configured or found".to_string(),
            ));
        };
        let script_path = self.workspace.temp_file(".py");
        let params_path = self.workspace.temp_file(".json");
        let signal_path = self.workspace.temp_file(".done");
        if let Some(map) = params.as_object_mut() {
            map.insert("output".into(), json!(output.display().to_string()));
            map.insert("signal".into(), json!(signal_path.display().to_string()));
        }
        std::fs::write(&params_path, serde_json::to_vec_pretty(&params)?)?;

        let invocation = ExternalInvocation {
            program: program.clone(),
            args: vec![
                "--background".to_string(),
                "--python".to_string(),
                script_path.display().to_string(),
                "--".to_string(),
                params_path.display().to_string(),
            ],
            script_path,
            script: script.source(),
            output_path: output.to_path_buf(),
            signal_path,
            timeout,
        };
        info!(operation = script.operation(), output = %output.display(), "Running host script");
        let state = self.supervisor.run(&invocation);
        if let Err(e) = std::fs::remove_file(&params_path) {
            debug!(path = %params_path.display(), error = %e, "Parameter file not removed");
        }
        state
    }

    /// Like [`AutomationHost::run`], but a failure or timeout becomes an error
    pub fn run_to_completion(
        &self,
        script: HostScript,
        params: Value,
        output: &Path,
        timeout: Duration,
    ) -> Result<()> {
        match self.run(script, params, output, timeout)? {
            InvocationState::Completed { .. } => Ok(()),
            InvocationState::Failed { reason, .. } => Err(PipelineError::ConversionFailed {
                operation: script.operation().to_string(),
                reason,
            }),
            _ => Err(PipelineError::ConversionTimeout {
                operation: script.operation().to_string(),
                timeout,
            }),
        }
    }
}
