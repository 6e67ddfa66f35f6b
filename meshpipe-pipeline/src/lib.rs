//! Model processing pipeline
//!
//! This crate turns heterogeneous model inputs into reduced, repaired and
//! self-contained GLB results:
//! - Input resolution for OBJ packages, GLB files and URLs
//! - Supervised external tools (Blender, Instant Meshes)
//! - Texture classification and material reconciliation
//! - Archive bundles with a processing log

pub mod analysis;
pub mod archive;
pub mod blender;
pub mod config;
pub mod convert;
pub mod error;
pub mod fetch;
pub mod input;
pub mod log;
pub mod material;
pub mod pipeline;
pub mod process;
pub mod remesh;
pub mod request;
pub mod supervisor;
pub mod textures;
pub mod workspace;

pub use analysis::{AnalysisReport, AnalysisType, Analyzer};
pub use archive::ArchiveManager;
pub use blender::{find_blender, AutomationHost, BlenderInfo};
pub use config::PipelineConfig;
pub use error::{FetchError, PipelineError, Result};
pub use fetch::{Fetcher, HttpFetcher, RetryPolicy};
pub use log::ProcessingLog;
pub use pipeline::{Pipeline, ProcessingOutcome, Services, SystemServices};
pub use process::{ProcessRegistry, RecordingRegistry, SystemProcessRegistry};
pub use remesh::{RemeshMode, RemeshRunner};
pub use request::{Operation, ProcessingRequest};
pub use supervisor::{InvocationState, Launcher, Supervisor, SupervisorSettings};
pub use textures::{TextureChannel, TextureSet};
pub use workspace::Workspace;
