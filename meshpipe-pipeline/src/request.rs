//! Processing request parameters

use crate::error::{PipelineError, Result};
use crate::remesh::{RemeshMode, RemeshOptions};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Quadric decimation keeping the existing topology
    #[default]
    Simplify,
    /// Simplify clean meshes, remesh the rest
    Auto,
    /// Repair, then regenerate topology with the remesher
    Remesh,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Simplify => "simplify",
            Operation::Auto => "auto",
            Operation::Remesh => "remesh",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "simplify" => Ok(Operation::Simplify),
            "auto" => Ok(Operation::Auto),
            "remesh" => Ok(Operation::Remesh),
            other => Err(PipelineError::Config(format!("unknown operation: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRequest {
    /// Local file, folder package or URL
    pub input: String,
    /// Extra MTL or texture files to include with the input
    #[serde(default)]
    pub additional_files: Vec<PathBuf>,
    pub target_faces: usize,
    #[serde(default)]
    pub operation: Operation,
    /// Only used when remeshing
    #[serde(default)]
    pub mode: RemeshMode,
    pub preserve_boundaries: bool,
    pub preserve_uv: bool,
    /// Extra remesher options
    #[serde(default)]
    pub options: RemeshOptions,
    pub create_archive: bool,
}

impl ProcessingRequest {
    pub fn new(input: impl Into<String>, target_faces: usize) -> Self {
        Self {
            input: input.into(),
            additional_files: Vec::new(),
            target_faces,
            operation: Operation::Simplify,
            mode: RemeshMode::Balanced,
            preserve_boundaries: true,
            preserve_uv: true,
            options: RemeshOptions::new(),
            create_archive: true,
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_mode(mut self, mode: RemeshMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_archive(mut self, create_archive: bool) -> Self {
        self.create_archive = create_archive;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_faces == 0 {
            return Err(PipelineError::Config(
                "target face count must be greater than zero".to_string(),
            ));
        }
        if self.input.trim().is_empty() {
            return Err(PipelineError::input(&self.input, "empty input"));
        }
        Ok(())
    }
}
