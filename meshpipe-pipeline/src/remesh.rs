//! Instant Meshes invocation
//!
//! The remesher runs as a waited child process with a timeout. Every run is
//! followed by a sweep that kills leftover instances by process name, since
//! the tool has been seen to linger after exiting normally.

use crate::error::{PipelineError, Result};
use crate::log::ProcessingLog;
use crate::process::{wait_with_timeout, ProcessRegistry};
use chrono::Local;
use meshpipe_core::SystemClock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Caller-supplied command line options, appended after the mode flags
pub type RemeshOptions = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemeshMode {
    #[default]
    Balanced,
    Fine,
    Coarse,
    FixHoles,
}

impl RemeshMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemeshMode::Balanced => "balanced",
            RemeshMode::Fine => "fine",
            RemeshMode::Coarse => "coarse",
            RemeshMode::FixHoles => "fix_holes",
        }
    }

    /// Face count actually requested from the tool
    pub fn face_target(&self, target_faces: usize) -> usize {
        match self {
            RemeshMode::Coarse => ((target_faces as f64 * 0.8) as usize).max(1),
            _ => target_faces,
        }
    }

    fn flags(&self) -> &'static [&'static str] {
        match self {
            RemeshMode::Balanced => &["-d", "-b"],
            RemeshMode::Fine => &["-d", "-b", "-c"],
            RemeshMode::Coarse => &["-d"],
            RemeshMode::FixHoles => &["-d", "-b", "-s", "2"],
        }
    }
}

impl fmt::Display for RemeshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemeshMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "balanced" => Ok(RemeshMode::Balanced),
            "fine" => Ok(RemeshMode::Fine),
            "coarse" => Ok(RemeshMode::Coarse),
            "fix_holes" | "fix-holes" => Ok(RemeshMode::FixHoles),
            other => Err(PipelineError::Config(format!("unknown remesh mode: {other}"))),
        }
    }
}

/// Edge length matching `target_faces` on a mesh with the given bounding
/// box diagonal, clamped to `[0.001, diagonal * 0.1]`
pub fn target_edge_length(diagonal: f64, target_faces: usize) -> f64 {
    let faces = target_faces.max(1) as f64;
    let raw = diagonal / (faces.sqrt() * 10.0);
    let upper = (diagonal * 0.1).max(0.001);
    raw.clamp(0.001, upper)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemeshCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Face count passed with `--faces`
    pub faces: usize,
    /// Derived edge length, informational only since `--faces` and
    /// `--scale` are mutually exclusive
    pub edge_length: f64,
}

impl fmt::Display for RemeshCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn push_option(args: &mut Vec<String>, key: &str, value: &Value) {
    match value {
        Value::Bool(true) => args.push(key.to_string()),
        Value::Bool(false) | Value::Null => {}
        Value::String(s) => {
            args.push(key.to_string());
            args.push(s.clone());
        }
        other => {
            args.push(key.to_string());
            args.push(other.to_string());
        }
    }
}

pub fn build_command(
    program: &Path,
    input: &Path,
    output: &Path,
    target_faces: usize,
    mode: RemeshMode,
    diagonal: f64,
    options: &RemeshOptions,
) -> RemeshCommand {
    let faces = mode.face_target(target_faces);
    let mut args = vec![
        "-i".to_string(),
        input.display().to_string(),
        "-o".to_string(),
        output.display().to_string(),
        "--faces".to_string(),
        faces.to_string(),
    ];
    args.extend(mode.flags().iter().map(|f| f.to_string()));
    for (key, value) in options {
        push_option(&mut args, key, value);
    }
    RemeshCommand {
        program: program.to_path_buf(),
        args,
        faces,
        edge_length: target_edge_length(diagonal, target_faces),
    }
}

/// Runs a remesh command to completion
pub trait RemeshRunner: Send + Sync {
    /// Run `command`, appending its output to `log_file`
    fn run(&self, command: &RemeshCommand, log_file: &Path, timeout: Duration) -> Result<()>;
}

/// Runs the command as a child process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRemeshRunner;

impl RemeshRunner for ProcessRemeshRunner {
    fn run(&self, command: &RemeshCommand, log_file: &Path, timeout: Duration) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(log_file)?;
        writeln!(
            file,
            "\n===== {} Instant Meshes Run =====\nCommand: {command}",
            Local::now().format("%Y%m%d_%H%M%S")
        )?;
        let stderr = file.try_clone()?;
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| {
                PipelineError::Remesh(format!("cannot start {}: {e}", command.program.display()))
            })?;
        debug!(pid = child.id(), "Remesher started");
        match wait_with_timeout(&mut child, timeout, Duration::from_millis(500), &SystemClock)? {
            None => Err(PipelineError::Remesh(format!(
                "timed out after {}s",
                timeout.as_secs()
            ))),
            Some(status) if !status.success() => {
                Err(PipelineError::Remesh(format!("exited with {status}")))
            }
            Some(_) => Ok(()),
        }
    }
}

/// Remeshing with process cleanup
pub struct RemeshInvoker<'a> {
    runner: &'a dyn RemeshRunner,
    registry: &'a dyn ProcessRegistry,
    program: PathBuf,
    log_dir: PathBuf,
    timeout: Duration,
}

impl<'a> RemeshInvoker<'a> {
    pub fn new(
        runner: &'a dyn RemeshRunner,
        registry: &'a dyn ProcessRegistry,
        program: PathBuf,
        log_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            registry,
            program,
            log_dir,
            timeout,
        }
    }

    /// Name used to find leftover instances
    pub fn process_name(&self) -> String {
        self.program
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn remesh(
        &self,
        input: &Path,
        output: &Path,
        target_faces: usize,
        mode: RemeshMode,
        diagonal: f64,
        options: &RemeshOptions,
        log: &mut ProcessingLog,
    ) -> Result<RemeshCommand> {
        let command = build_command(&self.program, input, output, target_faces, mode, diagonal, options);
        log.info(
            "remesh",
            format!(
                "Remeshing in {mode} mode: target {target_faces} faces, passing {} faces, \
                 edge length {:.4} for bbox diagonal {diagonal:.4}",
                command.faces, command.edge_length
            ),
        );
        log.debug("remesh", format!("Command: {command}"));
        std::fs::create_dir_all(&self.log_dir)?;
        let log_file = self
            .log_dir
            .join(format!("instant_meshes_{}.log", Local::now().format("%Y%m%d_%H%M%S")));

        let result = self.runner.run(&command, &log_file, self.timeout);

        let killed = self.registry.kill_by_name(&self.process_name());
        if !killed.is_empty() {
            log.warn(
                "remesh",
                format!("Killed {} lingering {} processes", killed.len(), self.process_name()),
            );
        }
        result?;

        let size = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(PipelineError::Remesh(format!(
                "no output written to {}",
                output.display()
            )));
        }
        info!(output = %output.display(), "Remesh finished");
        Ok(command)
    }
}
