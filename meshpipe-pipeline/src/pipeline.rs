//! Request orchestration
//!
//! One request runs as a strictly ordered sequence inside its own
//! [`Workspace`]: resolve the input, analyze it, reduce or repair and
//! remesh, reconcile materials, pack to GLB, archive. The workspace is
//! released on every exit path.

use crate::analysis::{analyze_file, AnalysisReport, AnalysisType, Analyzer};
use crate::archive::{ArchiveContents, ArchiveManager};
use crate::blender::{decimate_params, find_blender, AutomationHost, HostScript};
use crate::config::PipelineConfig;
use crate::convert::pack_obj;
use crate::error::{PipelineError, Result};
use crate::fetch::{Fetcher, HttpFetcher, RetryPolicy};
use crate::input::{InputResolver, ResolvedInput};
use crate::log::ProcessingLog;
use crate::material::{reconcile_materials, restore_material};
use crate::process::{ProcessRegistry, SystemProcessRegistry};
use crate::remesh::{ProcessRemeshRunner, RemeshInvoker, RemeshRunner};
use crate::request::{Operation, ProcessingRequest};
use crate::supervisor::{DetachedLauncher, Launcher, Supervisor, SupervisorSettings};
use crate::textures::TextureSet;
use crate::workspace::Workspace;
use meshpipe_core::{analyze_mesh, Clock, MeshQualityReport, SystemClock, TriangleMesh};
use meshpipe_io::{ObjReader, ObjWriter};
use meshpipe_repair::{repair_mesh, RepairOptions};
use meshpipe_simplification::{Checkpoint, ProgressiveDecimator};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Collaborators used by the pipeline
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub clock: &'a dyn Clock,
    pub registry: &'a dyn ProcessRegistry,
    pub launcher: &'a dyn Launcher,
    pub fetcher: &'a dyn Fetcher,
    pub remesher: &'a dyn RemeshRunner,
    /// Automation host executable; `None` forces the minimal conversions
    pub blender: Option<&'a Path>,
}

/// Owns the production implementations of [`Services`]
pub struct SystemServices {
    clock: SystemClock,
    registry: SystemProcessRegistry,
    launcher: DetachedLauncher,
    fetcher: HttpFetcher,
    remesher: ProcessRemeshRunner,
    blender: Option<PathBuf>,
}

impl SystemServices {
    /// Build the HTTP client and look for Blender
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let blender = find_blender(config.blender_executable.as_deref());
        match &blender {
            Some(info) => info!(path = %info.path.display(), version = %info.version, "Found Blender"),
            None => warn!("Blender not found; conversions will use the minimal path"),
        }
        Ok(Self {
            clock: SystemClock,
            registry: SystemProcessRegistry,
            launcher: DetachedLauncher,
            fetcher: HttpFetcher::new(config.fetch_timeout())?,
            remesher: ProcessRemeshRunner,
            blender: blender.map(|info| info.path),
        })
    }

    pub fn services(&self) -> Services<'_> {
        Services {
            clock: &self.clock,
            registry: &self.registry,
            launcher: &self.launcher,
            fetcher: &self.fetcher,
            remesher: &self.remesher,
            blender: self.blender.as_deref(),
        }
    }
}

/// Result of [`Pipeline::process_model`]
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingOutcome {
    /// Final GLB in the output directory
    pub output_path: PathBuf,
    pub archive_path: Option<PathBuf>,
    /// Set when archiving was requested and failed
    pub archive_error: Option<String>,
    /// Operation actually applied, after `auto` resolution and fallbacks
    pub operation: Operation,
    pub quality_before: MeshQualityReport,
    pub quality_after: MeshQualityReport,
    pub log: ProcessingLog,
}

impl ProcessingOutcome {
    /// The archive root when one was created, otherwise the output model
    pub fn result_path(&self) -> &Path {
        self.archive_path.as_deref().unwrap_or(&self.output_path)
    }
}

/// Whether the repair stage should run before remeshing
pub fn needs_repair(report: &MeshQualityReport) -> bool {
    !report.watertight || report.has_hole_issue()
}

/// Resolve `auto` against the analysis: clean meshes are simplified,
/// everything else is remeshed
pub fn resolve_operation(
    requested: Operation,
    report: &MeshQualityReport,
    log: &mut ProcessingLog,
) -> Operation {
    if requested != Operation::Auto {
        return requested;
    }
    if report.watertight && report.issues.is_empty() {
        log.info("decision", "Auto mode: mesh is watertight without issues, using simplify");
        Operation::Simplify
    } else {
        let reasons = if report.issues.is_empty() {
            "not watertight".to_string()
        } else {
            report.issues.join(", ")
        };
        log.info("decision", format!("Auto mode: mesh has issues ({reasons}), using remesh"));
        Operation::Remesh
    }
}

/// Writes every intermediate to disk and continues from the reloaded file
struct DiskCheckpoint {
    dir: PathBuf,
    material_libs: Vec<String>,
}

impl Checkpoint for DiskCheckpoint {
    fn persist(&mut self, step: usize, mesh: TriangleMesh) -> meshpipe_core::Result<TriangleMesh> {
        let path = self.dir.join(format!("step_{step:02}.obj"));
        ObjWriter::write_document(&mesh, &self.material_libs, &path)?;
        drop(mesh);
        let reloaded = ObjReader::read_document(&path)?.mesh;
        debug!(step, path = %path.display(), faces = reloaded.face_count(), "Checkpoint written");
        Ok(reloaded)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string())
}

/// Move `from` to `to`, copying when a rename is not possible
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        std::fs::remove_file(to)?;
    }
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to)?;
        if let Err(e) = std::fs::remove_file(from) {
            debug!(path = %from.display(), error = %e, "Source left after copy");
        }
    }
    Ok(())
}

pub struct Pipeline<'a> {
    config: PipelineConfig,
    services: Services<'a>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: PipelineConfig, services: Services<'a>) -> Self {
        Self { config, services }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.config.fetch_retries,
            initial_delay: self.config.fetch_initial_delay(),
        }
    }

    fn host<'w>(&self, workspace: &'w Workspace) -> AutomationHost<'w>
    where
        'a: 'w,
    {
        let supervisor = Supervisor::new(
            self.services.clock,
            self.services.registry,
            self.services.launcher,
            SupervisorSettings {
                poll_interval: self.config.poll_interval(),
                stability_grace: self.config.stability_grace(),
            },
        );
        AutomationHost::new(self.services.blender.map(Path::to_path_buf), workspace, supervisor)
    }

    /// Process one request.
    ///
    /// Stage failures are absorbed and logged; only input resolution
    /// failures and the absence of any usable output are returned as errors.
    pub fn process_model(&self, request: &ProcessingRequest) -> Result<ProcessingOutcome> {
        request.validate()?;
        self.config.ensure_dirs()?;
        let workspace = Workspace::acquire(&self.config.temp_dir)?;
        let result = self.run(request, &workspace);
        let failed = workspace.release();
        if failed > 0 {
            warn!(failed, "Some workspace entries could not be removed");
        }
        match &result {
            Ok(outcome) => info!(result = %outcome.result_path().display(), "Request finished"),
            Err(e) => warn!(error = %e, "Request failed"),
        }
        result
    }

    /// Read-only analysis of a file, folder or URL
    pub fn analyze_model(&self, input: &str, analysis_type: AnalysisType) -> Result<AnalysisReport> {
        let workspace = Workspace::acquire(&self.config.temp_dir)?;
        let result = {
            let host = self.host(&workspace);
            let analyzer = Analyzer::new(
                &host,
                self.services.fetcher,
                self.retry_policy(),
                self.config.conversion_timeout(),
            );
            analyzer.analyze(input, analysis_type)
        };
        workspace.release();
        result
    }

    fn run(&self, request: &ProcessingRequest, workspace: &Workspace) -> Result<ProcessingOutcome> {
        let host = self.host(workspace);
        let mut log = ProcessingLog::new();
        log.info(
            "request",
            format!(
                "Processing {} to {} faces ({})",
                request.input, request.target_faces, request.operation
            ),
        );
        if !host.is_available() {
            log.warn("host", "Blender not available; conversions use the minimal path");
        }

        let resolver = InputResolver::new(
            &host,
            self.services.fetcher,
            self.retry_policy(),
            self.config.conversion_timeout(),
        );
        let resolved = resolver.resolve(&request.input, &request.additional_files, &mut log)?;
        if let Some(reason) = &resolved.degraded {
            log.warn("input", format!("Input converted without textures: {reason}"));
        }

        let before = analyze_file(&resolved.mesh_path);
        if let Some(error) = &before.error {
            return Err(PipelineError::input(&request.input, format!("cannot load mesh: {error}")));
        }
        log.info(
            "analysis",
            format!(
                "Before: {} vertices, {} faces, watertight: {}",
                before.vertices, before.faces, before.watertight
            ),
        );
        for issue in &before.issues {
            log.warn("analysis", format!("Issue: {issue}"));
        }
        for warning in &before.warnings {
            log.warn("analysis", format!("Warning: {warning}"));
        }

        let stem = resolved.source.stem();
        let requested = resolve_operation(request.operation, &before, &mut log);
        let (operation, processed) = if before.faces <= request.target_faces {
            log.info(
                "decision",
                format!(
                    "Mesh has {} faces, target is {}: no processing needed",
                    before.faces, request.target_faces
                ),
            );
            (requested, resolved.mesh_path.clone())
        } else {
            self.reduce(&host, request, requested, &resolved, &before, &mut log)?
        };

        let mut textures = resolved.textures.clone();
        match reconcile_materials(&processed, &textures) {
            Ok(report) => log.info(
                "materials",
                format!(
                    "Material file {} has {} texture directives, {} textures co-located",
                    report.mtl_path.display(),
                    report.directives,
                    report.copied.len()
                ),
            ),
            Err(e) => log.error("materials", format!("Material reconciliation failed: {e}")),
        }
        if let Some(dir) = processed.parent() {
            if let Err(e) = textures.scan_dir(dir) {
                log.warn("materials", format!("Cannot list {}: {e}", dir.display()));
            }
        }

        let quality_after = analyze_file(&processed);
        log.info(
            "analysis",
            format!(
                "After: {} vertices, {} faces ({} before), watertight: {}",
                quality_after.vertices, quality_after.faces, before.faces, quality_after.watertight
            ),
        );
        if before.has_hole_issue() && !quality_after.has_hole_issue() && !quality_after.is_error() {
            log.info("analysis", "Hole-related issues resolved");
        }

        let packed = workspace.subdir("final")?.join(format!("{stem}_{operation}.glb"));
        let conversion = pack_obj(&host, &processed, &packed, self.config.conversion_timeout(), &mut log)
            .map_err(|e| PipelineError::Exhausted(format!("cannot pack final model: {e}")))?;
        let output_path = self.config.output_dir.join(format!("{stem}_{operation}.glb"));
        move_file(&conversion.output, &output_path)?;
        log.info("output", format!("Final model written to {}", output_path.display()));

        let mut outcome = ProcessingOutcome {
            output_path,
            archive_path: None,
            archive_error: None,
            operation,
            quality_before: before,
            quality_after,
            log: ProcessingLog::new(),
        };

        if let Err(e) = log.flush_to(&workspace.log_file()) {
            warn!(error = %e, "Cannot write processing log");
        }
        if request.create_archive {
            match self.archive(request, &resolved, &textures, &outcome, &log) {
                Ok(path) => {
                    log.info("archive", format!("Archive created at {}", path.display()));
                    outcome.archive_path = Some(path);
                }
                Err(e) => {
                    log.error("archive", format!("Archive creation failed: {e}"));
                    outcome.archive_error = Some(e.to_string());
                }
            }
        }
        outcome.log = log;
        Ok(outcome)
    }

    /// Apply the operation, falling back from remesh to simplify
    fn reduce(
        &self,
        host: &AutomationHost<'_>,
        request: &ProcessingRequest,
        operation: Operation,
        resolved: &ResolvedInput,
        before: &MeshQualityReport,
        log: &mut ProcessingLog,
    ) -> Result<(Operation, PathBuf)> {
        if operation == Operation::Remesh {
            match self.remesh(host.workspace(), request, resolved, before, log) {
                Ok(path) => return Ok((Operation::Remesh, path)),
                Err(e) => log.error("remesh", format!("{e}; falling back to simplify")),
            }
        }
        self.simplify(host, request, resolved, before, log)
            .map(|path| (Operation::Simplify, path))
            .map_err(|e| PipelineError::Exhausted(e.to_string()))
    }

    fn simplify(
        &self,
        host: &AutomationHost<'_>,
        request: &ProcessingRequest,
        resolved: &ResolvedInput,
        before: &MeshQualityReport,
        log: &mut ProcessingLog,
    ) -> Result<PathBuf> {
        let input = &resolved.mesh_path;
        let workspace = host.workspace();
        let output = workspace
            .subdir("simplify")?
            .join(format!("{}_simplified.obj", file_stem(input)));

        if before.faces > self.config.large_mesh_threshold {
            let ratio = request.target_faces as f64 / before.faces as f64;
            log.info(
                "decimate",
                format!("{} faces exceeds {}, decimating with Blender", before.faces, self.config.large_mesh_threshold),
            );
            let attempt = host.run_to_completion(
                HostScript::Decimate,
                decimate_params(input, ratio),
                &output,
                self.config.decimation_host_timeout(),
            );
            match attempt {
                Ok(()) => {
                    restore_material(&output, input)?;
                    log.info("decimate", "Blender decimation finished");
                    return Ok(output);
                }
                Err(e) => log.warn("decimate", format!("{e}; using library decimation")),
            }
        }

        let document = ObjReader::read_document(input)?;
        let mut options = self.config.progressive_options(request.preserve_boundaries);
        if !request.preserve_uv {
            options.uv_step_ratio = options.step_ratio;
        }
        let mut checkpoint = DiskCheckpoint {
            dir: workspace.subdir("steps")?,
            material_libs: document.material_libs.clone(),
        };
        let decimator = ProgressiveDecimator::new(options, self.services.clock);
        let (mesh, report) = decimator
            .decimate(&document.mesh, request.target_faces, &mut checkpoint)
            .map_err(|e| PipelineError::Decimation(e.to_string()))?;
        for step in &report.steps {
            log.debug(
                "decimate",
                format!("Step {}: {} -> {} faces", step.index, step.faces_before, step.faces_after),
            );
        }
        if let Some(reason) = report.early_exit() {
            log.warn(
                "decimate",
                format!("Stopped early ({reason}); keeping the best result with {} faces", report.final_faces),
            );
        }
        log.info(
            "decimate",
            format!(
                "Decimated {} -> {} faces in {} steps (target {})",
                report.original_faces,
                report.final_faces,
                report.steps.len(),
                report.target_faces
            ),
        );
        ObjWriter::write_document(&mesh, &document.material_libs, &output)?;
        restore_material(&output, input)?;
        Ok(output)
    }

    fn remesh(
        &self,
        workspace: &Workspace,
        request: &ProcessingRequest,
        resolved: &ResolvedInput,
        before: &MeshQualityReport,
        log: &mut ProcessingLog,
    ) -> Result<PathBuf> {
        let input = &resolved.mesh_path;
        let mut source = input.clone();
        if needs_repair(before) {
            match self.repair(workspace, input, log) {
                Ok(repaired) => source = repaired,
                Err(e) => log.error("repair", format!("Repair failed, remeshing the unrepaired mesh: {e}")),
            }
        }

        let output = workspace
            .subdir("remesh")?
            .join(format!("{}_remeshed.obj", file_stem(input)));
        let invoker = RemeshInvoker::new(
            self.services.remesher,
            self.services.registry,
            self.config.instant_meshes(),
            self.config.log_dir.clone(),
            self.config.remesh_timeout(),
        );
        invoker.remesh(
            &source,
            &output,
            request.target_faces,
            request.mode,
            before.bbox_diagonal,
            &request.options,
            log,
        )?;
        restore_material(&output, input)?;
        Ok(output)
    }

    fn repair(&self, workspace: &Workspace, input: &Path, log: &mut ProcessingLog) -> Result<PathBuf> {
        let document = ObjReader::read_document(input)?;
        let (mesh, report) = repair_mesh(&document.mesh, &RepairOptions::default());
        for outcome in &report.steps {
            match &outcome.error {
                Some(error) => log.error("repair", format!("{} failed: {error}", outcome.step)),
                None => log.debug("repair", format!("{}: {} changed", outcome.step, outcome.changed)),
            }
        }
        let after = analyze_mesh(&mesh);
        log.info(
            "repair",
            format!(
                "Repaired {} -> {} faces, watertight: {}",
                report.faces_before, report.faces_after, after.watertight
            ),
        );
        if after.has_hole_issue() {
            log.warn("repair", "Mesh still has holes after repair");
        }

        let output = workspace
            .subdir("repair")?
            .join(format!("{}_repaired.obj", file_stem(input)));
        ObjWriter::write_document(&mesh, &document.material_libs, &output)?;
        restore_material(&output, input)?;
        Ok(output)
    }

    fn archive(
        &self,
        request: &ProcessingRequest,
        resolved: &ResolvedInput,
        textures: &TextureSet,
        outcome: &ProcessingOutcome,
        log: &ProcessingLog,
    ) -> Result<PathBuf> {
        let manager = ArchiveManager::new(&self.config.archive_dir, &self.config.output_dir);
        let processing_info = json!({
            "request": request,
            "operation": outcome.operation,
            "source": resolved.source,
            "degraded_input_conversion": resolved.degraded,
            "mesh_quality_before": outcome.quality_before,
            "mesh_quality_after": outcome.quality_after,
        });
        let contents = ArchiveContents {
            model: &outcome.output_path,
            material: None,
            original_input: &request.input,
            processing_info,
            textures: textures.iter().map(|record| record.source.clone()).collect(),
            log,
        };
        manager.create(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(watertight: bool, issues: &[&str]) -> MeshQualityReport {
        MeshQualityReport {
            faces: 100,
            watertight,
            issues: issues.iter().map(|s| s.to_string()).collect(),
            ..MeshQualityReport::default()
        }
    }

    #[test]
    fn test_auto_resolution() {
        let mut log = ProcessingLog::new();
        assert_eq!(resolve_operation(Operation::Auto, &report(true, &[]), &mut log), Operation::Simplify);
        let holes = report(false, &["Not watertight (has holes)"]);
        assert_eq!(resolve_operation(Operation::Auto, &holes, &mut log), Operation::Remesh);
        assert!(log.mentions("using remesh"));
        assert_eq!(resolve_operation(Operation::Simplify, &holes, &mut log), Operation::Simplify);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_needs_repair() {
        assert!(!needs_repair(&report(true, &[])));
        assert!(needs_repair(&report(false, &[])));
        assert!(needs_repair(&report(true, &["Not watertight (has holes)"])));
    }

    #[test]
    fn test_result_path_prefers_archive() {
        let mut outcome = ProcessingOutcome {
            output_path: PathBuf::from("out/chair_simplify.glb"),
            archive_path: None,
            archive_error: None,
            operation: Operation::Simplify,
            quality_before: MeshQualityReport::default(),
            quality_after: MeshQualityReport::default(),
            log: ProcessingLog::new(),
        };
        assert_eq!(outcome.result_path(), Path::new("out/chair_simplify.glb"));
        outcome.archive_path = Some(PathBuf::from("archives/chair_20240101_120000"));
        assert_eq!(outcome.result_path(), Path::new("archives/chair_20240101_120000"));
    }

    #[test]
    fn test_disk_checkpoint_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = TriangleMesh::from_vertices_and_faces(
            vec![
                meshpipe_core::Point3f::new(0.0, 0.0, 0.0),
                meshpipe_core::Point3f::new(1.0, 0.0, 0.0),
                meshpipe_core::Point3f::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2]],
        );
        let mut checkpoint = DiskCheckpoint {
            dir: dir.path().to_path_buf(),
            material_libs: vec!["chair.mtl".to_string()],
        };
        let reloaded = checkpoint.persist(1, mesh).unwrap();
        assert_eq!(reloaded.face_count(), 1);
        let text = std::fs::read_to_string(dir.path().join("step_01.obj")).unwrap();
        assert!(text.contains("mtllib chair.mtl"));
    }

    #[test]
    fn test_move_file_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.glb");
        let to = dir.path().join("b.glb");
        std::fs::write(&from, b"new").unwrap();
        std::fs::write(&to, b"old").unwrap();
        move_file(&from, &to).unwrap();
        assert_eq!(std::fs::read(&to).unwrap(), b"new");
        assert!(!from.exists());
    }
}
