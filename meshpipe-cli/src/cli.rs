//! Argument parsing and command dispatch

use crate::telemetry::{LogFormat, DEFAULT_LOG_LEVEL};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use meshpipe_pipeline::archive::ArchiveManager;
use meshpipe_pipeline::remesh::RemeshOptions;
use meshpipe_pipeline::{
    find_blender, AnalysisType, Operation, Pipeline, PipelineConfig, ProcessingRequest, RemeshMode,
    SystemServices,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(name = "meshpipe", version, about = "Reduce, repair and convert 3D models")]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "MESHPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, env = "MESHPIPE_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[arg(long, global = true, env = "MESHPIPE_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "MESHPIPE_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "MESHPIPE_ARCHIVE_DIR")]
    pub archive_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "BLENDER_EXECUTABLE")]
    pub blender: Option<PathBuf>,

    #[arg(long, global = true, env = "INSTANT_MESHES_PATH")]
    pub instant_meshes: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Reduce or remesh a model and pack it to GLB
    Process(ProcessArgs),
    /// Inspect a model, folder package or URL without changing it
    Analyze(AnalyzeArgs),
    /// Manage result archives
    #[command(subcommand)]
    Archives(ArchivesCommand),
    /// Report the external tools that were found
    DetectTools,
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// OBJ or GLB file, folder package, or http(s) URL
    pub input: String,

    /// Defaults to the configured target
    #[arg(long)]
    pub target_faces: Option<usize>,

    #[arg(long, value_enum, default_value_t = OperationArg::Simplify)]
    pub operation: OperationArg,

    #[arg(long, value_enum, default_value_t = ModeArg::Balanced)]
    pub mode: ModeArg,

    #[arg(long)]
    pub no_preserve_boundaries: bool,

    #[arg(long)]
    pub no_preserve_uv: bool,

    /// Extra remesher option, KEY=VALUE or a bare flag
    #[arg(long = "option", value_name = "KEY=VALUE", allow_hyphen_values = true)]
    pub options: Vec<String>,

    /// Extra MTL or texture files to include
    #[arg(long = "with-file", value_name = "PATH")]
    pub additional_files: Vec<PathBuf>,

    #[arg(long)]
    pub no_archive: bool,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    pub input: String,

    #[arg(long = "type", value_enum, default_value_t = AnalysisArg::Auto)]
    pub analysis_type: AnalysisArg,
}

#[derive(Debug, Subcommand)]
pub enum ArchivesCommand {
    /// Most recent archives first
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete archives older than the retention period (dry run unless --execute)
    Clean {
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long)]
        execute: bool,
    },
    /// Copy an archive out of the archive root
    Copy {
        name: String,
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// Archive root statistics, or one archive's info.json when named
    Info { name: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OperationArg {
    Simplify,
    Auto,
    Remesh,
}

impl From<OperationArg> for Operation {
    fn from(arg: OperationArg) -> Self {
        match arg {
            OperationArg::Simplify => Operation::Simplify,
            OperationArg::Auto => Operation::Auto,
            OperationArg::Remesh => Operation::Remesh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Balanced,
    Fine,
    Coarse,
    #[value(name = "fix_holes", alias = "fix-holes")]
    FixHoles,
}

impl From<ModeArg> for RemeshMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Balanced => RemeshMode::Balanced,
            ModeArg::Fine => RemeshMode::Fine,
            ModeArg::Coarse => RemeshMode::Coarse,
            ModeArg::FixHoles => RemeshMode::FixHoles,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AnalysisArg {
    Auto,
    Quality,
    Folder,
    Validation,
    Full,
}

impl From<AnalysisArg> for AnalysisType {
    fn from(arg: AnalysisArg) -> Self {
        match arg {
            AnalysisArg::Auto => AnalysisType::Auto,
            AnalysisArg::Quality => AnalysisType::Quality,
            AnalysisArg::Folder => AnalysisType::Folder,
            AnalysisArg::Validation => AnalysisType::Validation,
            AnalysisArg::Full => AnalysisType::Full,
        }
    }
}

/// Parse `KEY=VALUE` remesher options. Values that read as JSON (numbers,
/// booleans) keep their type; a bare key is a flag.
pub fn parse_options(raw: &[String]) -> Result<RemeshOptions> {
    let mut options = RemeshOptions::new();
    for item in raw {
        let (key, value) = match item.split_once('=') {
            Some((key, value)) => {
                let value = serde_json::from_str::<Value>(value)
                    .ok()
                    .filter(|v| !v.is_object() && !v.is_array())
                    .unwrap_or_else(|| Value::String(value.to_string()));
                (key, value)
            }
            None => (item.as_str(), Value::Bool(true)),
        };
        if key.trim().is_empty() {
            return Err(anyhow!("invalid option {item:?}: empty key"));
        }
        options.insert(key.to_string(), value);
    }
    Ok(options)
}

impl Cli {
    /// Configuration file and environment, then command line flags
    pub fn load_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::load(self.config.as_deref()).context("failed to load configuration")?;
        if let Some(dir) = &self.temp_dir {
            config.temp_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(dir) = &self.archive_dir {
            config.archive_dir = dir.clone();
        }
        if let Some(path) = &self.blender {
            config.blender_executable = Some(path.clone());
        }
        if let Some(path) = &self.instant_meshes {
            config.instant_meshes_path = Some(path.clone());
        }
        Ok(config)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("failed to encode result")?);
    Ok(())
}

pub fn dispatch(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;
    match cli.command {
        Command::Process(args) => handle_process(config, args),
        Command::Analyze(args) => handle_analyze(config, args),
        Command::Archives(command) => handle_archives(&config, command),
        Command::DetectTools => handle_detect_tools(&config),
    }
}

fn handle_process(config: PipelineConfig, args: ProcessArgs) -> Result<()> {
    let request = ProcessingRequest {
        input: args.input,
        additional_files: args.additional_files,
        target_faces: args.target_faces.unwrap_or(config.default_target_faces),
        operation: args.operation.into(),
        mode: args.mode.into(),
        preserve_boundaries: !args.no_preserve_boundaries,
        preserve_uv: !args.no_preserve_uv,
        options: parse_options(&args.options)?,
        create_archive: !args.no_archive,
    };
    let system = SystemServices::new(&config).context("failed to set up services")?;
    let pipeline = Pipeline::new(config, system.services());
    let outcome = pipeline
        .process_model(&request)
        .with_context(|| format!("failed to process {}", request.input))?;
    print_json(&json!({
        "result": outcome.result_path(),
        "output_path": outcome.output_path,
        "archive_path": outcome.archive_path,
        "archive_error": outcome.archive_error,
        "operation": outcome.operation,
        "faces_before": outcome.quality_before.faces,
        "faces_after": outcome.quality_after.faces,
        "mesh_quality_before": outcome.quality_before,
        "mesh_quality_after": outcome.quality_after,
        "problems": outcome.log.problems().map(ToString::to_string).collect::<Vec<_>>(),
    }))
}

fn handle_analyze(config: PipelineConfig, args: AnalyzeArgs) -> Result<()> {
    let system = SystemServices::new(&config).context("failed to set up services")?;
    let pipeline = Pipeline::new(config, system.services());
    let report = pipeline
        .analyze_model(&args.input, args.analysis_type.into())
        .with_context(|| format!("failed to analyze {}", args.input))?;
    print_json(&report)
}

fn handle_archives(config: &PipelineConfig, command: ArchivesCommand) -> Result<()> {
    let manager = ArchiveManager::new(&config.archive_dir, &config.output_dir);
    match command {
        ArchivesCommand::List { limit } => print_json(&manager.list(limit)),
        ArchivesCommand::Clean { days, execute } => print_json(&manager.clean(days, !execute)),
        ArchivesCommand::Copy { name, dest } => {
            let path = manager
                .copy_out(&name, dest.as_deref())
                .with_context(|| format!("failed to copy archive {name}"))?;
            print_json(&json!({ "archive": name, "copied_to": path }))
        }
        ArchivesCommand::Info { name: Some(name) } => {
            let info = manager
                .read_info(&name)
                .with_context(|| format!("failed to read archive {name}"))?;
            print_json(&info)
        }
        ArchivesCommand::Info { name: None } => print_json(&manager.stats()),
    }
}

/// Look `name` up on `PATH` unless it already names a path
fn locate_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn handle_detect_tools(config: &PipelineConfig) -> Result<()> {
    let blender = find_blender(config.blender_executable.as_deref());
    let instant_meshes = config.instant_meshes();
    let located = locate_program(&instant_meshes);
    print_json(&json!({
        "blender": blender,
        "instant_meshes": {
            "configured": instant_meshes,
            "found": located,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_process_command() {
        let cli = Cli::try_parse_from([
            "meshpipe",
            "process",
            "chair.glb",
            "--target-faces",
            "5000",
            "--operation",
            "auto",
            "--mode",
            "fix_holes",
            "--option",
            "--smooth=4",
            "--no-archive",
        ])
        .unwrap();
        let Command::Process(args) = cli.command else {
            panic!("expected process command");
        };
        assert_eq!(args.input, "chair.glb");
        assert_eq!(args.target_faces, Some(5000));
        assert_eq!(Operation::from(args.operation), Operation::Auto);
        assert_eq!(RemeshMode::from(args.mode), RemeshMode::FixHoles);
        assert!(args.no_archive);
        assert!(!args.no_preserve_uv);
        assert_eq!(args.options, vec!["--smooth=4"]);
    }

    #[test]
    fn test_parse_archives_and_analyze() {
        let cli = Cli::try_parse_from(["meshpipe", "archives", "clean", "--days", "7"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Archives(ArchivesCommand::Clean { days: 7, execute: false })
        ));
        let cli = Cli::try_parse_from(["meshpipe", "analyze", "models/", "--type", "full"]).unwrap();
        let Command::Analyze(args) = cli.command else {
            panic!("expected analyze command");
        };
        assert_eq!(AnalysisType::from(args.analysis_type), AnalysisType::Full);
        assert!(Cli::try_parse_from(["meshpipe", "process", "a.obj", "--operation", "melt"]).is_err());
    }

    #[test]
    fn test_parse_options() {
        let options = parse_options(&[
            "-S=2".to_string(),
            "--deterministic".to_string(),
            "--label=chair v2".to_string(),
            "--flag=true".to_string(),
        ])
        .unwrap();
        assert_eq!(options["-S"], 2);
        assert_eq!(options["--deterministic"], true);
        assert_eq!(options["--label"], "chair v2");
        assert_eq!(options["--flag"], true);
        assert!(parse_options(&["=3".to_string()]).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let cli = Cli::try_parse_from([
            "meshpipe",
            "--output-dir",
            out.to_str().unwrap(),
            "archives",
            "info",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.output_dir, out);
    }

    #[test]
    fn test_locate_program_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("Instant Meshes");
        std::fs::write(&tool, b"").unwrap();
        assert_eq!(locate_program(&tool), Some(tool.clone()));
        assert_eq!(locate_program(&dir.path().join("missing")), None);
    }
}
