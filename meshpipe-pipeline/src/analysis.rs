//! Read-only model analysis
//!
//! Quality statistics for a mesh file, inventory of an OBJ package folder,
//! and validation of an OBJ's material references. Sub-analyses fail
//! independently: an error in one is recorded under `<name>_error` and the
//! others still run.

use crate::blender::AutomationHost;
use crate::convert::unpack_glb;
use crate::error::{PipelineError, Result};
use crate::fetch::{download_to, Fetcher, RetryPolicy};
use crate::input::first_obj;
use crate::log::ProcessingLog;
use crate::request::Operation;
use crate::textures::{is_texture_file, is_url};
use chrono::Local;
use meshpipe_core::{analyze_mesh, MeshQualityReport};
use meshpipe_io::obj::read_material_libs;
use meshpipe_io::{extension_of, read_mesh, MaterialLibrary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Load a mesh file and analyze it. Load failures become a report carrying
/// only the error.
pub fn analyze_file(path: &Path) -> MeshQualityReport {
    match read_mesh(path) {
        Ok(mesh) => analyze_mesh(&mesh),
        Err(e) => MeshQualityReport::load_failure(e.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    #[default]
    Auto,
    Quality,
    Folder,
    Validation,
    Full,
}

impl FromStr for AnalysisType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(AnalysisType::Auto),
            "quality" => Ok(AnalysisType::Quality),
            "folder" => Ok(AnalysisType::Folder),
            "validation" => Ok(AnalysisType::Validation),
            "full" => Ok(AnalysisType::Full),
            other => Err(PipelineError::Config(format!("unknown analysis type: {other}"))),
        }
    }
}

/// One analysis that can be run on an input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Analysis {
    Quality,
    Folder,
    Validation,
}

impl fmt::Display for Analysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Analysis::Quality => "quality",
            Analysis::Folder => "folder",
            Analysis::Validation => "validation",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputKind {
    Folder,
    Obj,
    /// GLB file or URL
    Model,
    Other,
}

fn input_kind(input: &str) -> InputKind {
    if is_url(input) {
        return InputKind::Model;
    }
    let path = Path::new(input);
    if path.is_dir() {
        return InputKind::Folder;
    }
    match (path.is_file(), extension_of(path).as_deref()) {
        (true, Some("obj")) => InputKind::Obj,
        (true, Some("glb")) => InputKind::Model,
        _ => InputKind::Other,
    }
}

/// Analyses to run for `analysis_type` on `input`
pub fn plan(analysis_type: AnalysisType, input: &str) -> Result<Vec<Analysis>> {
    use Analysis::*;
    let kind = input_kind(input);
    let plan = match (analysis_type, kind) {
        (AnalysisType::Quality, _) => vec![Quality],
        (AnalysisType::Folder, _) => vec![Folder],
        (AnalysisType::Validation, _) => vec![Validation],
        (_, InputKind::Folder) => vec![Folder, Quality],
        (AnalysisType::Auto, InputKind::Obj) => vec![Quality, Validation],
        (AnalysisType::Full, InputKind::Obj) => vec![Quality, Validation, Folder],
        (_, InputKind::Model) => vec![Quality],
        (_, InputKind::Other) => {
            return Err(PipelineError::UnsupportedFormat(format!("unsupported input type: {input}")))
        }
    };
    Ok(plan)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReductionSuggestions {
    pub aggressive: usize,
    pub moderate: usize,
    pub conservative: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Recommendations {
    pub recommended_target_faces: usize,
    pub complexity_level: ComplexityLevel,
    pub recommended_operation: Operation,
    pub reduction_suggestions: ReductionSuggestions,
}

impl Recommendations {
    pub fn for_report(report: &MeshQualityReport) -> Self {
        let faces = report.faces;
        Self {
            recommended_target_faces: if faces > 5000 { faces / 5 } else { faces },
            complexity_level: if faces > 20_000 {
                ComplexityLevel::High
            } else if faces > 5000 {
                ComplexityLevel::Medium
            } else {
                ComplexityLevel::Low
            },
            recommended_operation: if report.watertight {
                Operation::Simplify
            } else {
                Operation::Remesh
            },
            reduction_suggestions: ReductionSuggestions {
                aggressive: faces / 10,
                moderate: faces / 5,
                conservative: faces / 2,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityAnalysis {
    #[serde(flatten)]
    pub report: MeshQualityReport,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Recommendations>,
}

impl From<MeshQualityReport> for QualityAnalysis {
    fn from(report: MeshQualityReport) -> Self {
        let recommendations = (!report.is_error()).then(|| Recommendations::for_report(&report));
        Self {
            report,
            recommendations,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObjRelationship {
    pub obj_file: String,
    pub referenced_mtl: Vec<String>,
    pub missing_mtl: Vec<String>,
    pub available_textures: Vec<String>,
    pub missing_textures: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FolderAnalysis {
    pub folder_path: PathBuf,
    pub obj_files: Vec<String>,
    pub mtl_files: Vec<String>,
    pub texture_files: Vec<String>,
    pub other_files: Vec<String>,
    pub relationships: Vec<ObjRelationship>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

fn base_name(reference: &str) -> String {
    reference
        .replace('\\', "/")
        .rsplit('/')
        .next()
        .unwrap_or(reference)
        .to_string()
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Inventory of an OBJ package folder
pub fn analyze_folder(dir: &Path) -> Result<FolderAnalysis> {
    if !dir.is_dir() {
        return Err(PipelineError::input(
            dir.display().to_string(),
            "folder not found or not a directory",
        ));
    }
    let mut result = FolderAnalysis {
        folder_path: dir.to_path_buf(),
        ..FolderAnalysis::default()
    };
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .flatten()
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    for name in names {
        match extension_of(Path::new(&name)).as_deref() {
            Some("obj") => result.obj_files.push(name),
            Some("mtl") => result.mtl_files.push(name),
            _ if is_texture_file(&name) => result.texture_files.push(name),
            _ => result.other_files.push(name),
        }
    }

    for obj in &result.obj_files {
        let mut relationship = ObjRelationship {
            obj_file: obj.clone(),
            ..ObjRelationship::default()
        };
        match read_material_libs(dir.join(obj)) {
            Ok(libs) => {
                for lib in libs {
                    let name = base_name(&lib);
                    if !result.mtl_files.contains(&name) {
                        push_unique(&mut relationship.missing_mtl, name.clone());
                    }
                    push_unique(&mut relationship.referenced_mtl, name);
                }
            }
            Err(_) => {
                result.errors.push(format!("Failed to read OBJ file: {obj}"));
                continue;
            }
        }
        for mtl in relationship.referenced_mtl.clone() {
            if !result.mtl_files.contains(&mtl) {
                continue;
            }
            match MaterialLibrary::read(dir.join(&mtl)) {
                Ok(library) => {
                    for texture in library.texture_files() {
                        let name = base_name(&texture);
                        if result.texture_files.contains(&name) {
                            push_unique(&mut relationship.available_textures, name);
                        } else {
                            push_unique(&mut relationship.missing_textures, name);
                        }
                    }
                }
                Err(_) => result.errors.push(format!("Failed to read MTL file: {mtl}")),
            }
        }
        result.relationships.push(relationship);
    }

    match result.obj_files.len() {
        0 => result.warnings.push("No OBJ files found in folder".to_string()),
        1 => {}
        _ => result
            .warnings
            .push(format!("Multiple OBJ files found: {}", result.obj_files.join(", "))),
    }
    if result.mtl_files.is_empty() {
        result.warnings.push("No MTL files found in folder".to_string());
    }
    if result.texture_files.is_empty() {
        result.warnings.push("No texture files found in folder".to_string());
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjFileStatus {
    pub path: PathBuf,
    pub exists: bool,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageValidation {
    pub obj_file: ObjFileStatus,
    pub referenced_mtl_files: Vec<String>,
    pub missing_mtl_files: Vec<String>,
    pub texture_files: Vec<String>,
    pub missing_textures: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Check that an OBJ's material libraries and their textures exist
pub fn validate_package(obj: &Path) -> PackageValidation {
    let mut result = PackageValidation {
        obj_file: ObjFileStatus {
            path: obj.to_path_buf(),
            exists: obj.is_file(),
            valid: false,
        },
        referenced_mtl_files: Vec::new(),
        missing_mtl_files: Vec::new(),
        texture_files: Vec::new(),
        missing_textures: Vec::new(),
        warnings: Vec::new(),
        errors: Vec::new(),
        note: None,
    };
    if !result.obj_file.exists {
        result.errors.push(format!("OBJ file not found: {}", obj.display()));
        return result;
    }
    let libs = match read_material_libs(obj) {
        Ok(libs) => libs,
        Err(e) => {
            result.errors.push(format!("Failed to read OBJ file: {e}"));
            return result;
        }
    };
    result.obj_file.valid = true;
    let dir = obj.parent().unwrap_or_else(|| Path::new("."));
    for lib in libs {
        let name = base_name(&lib);
        let path = dir.join(&name);
        push_unique(&mut result.referenced_mtl_files, name.clone());
        if !path.is_file() {
            push_unique(&mut result.missing_mtl_files, name);
            continue;
        }
        match MaterialLibrary::read(&path) {
            Ok(library) => {
                for texture in library.texture_files() {
                    let texture = base_name(&texture);
                    if dir.join(&texture).is_file() {
                        push_unique(&mut result.texture_files, texture);
                    } else {
                        push_unique(&mut result.missing_textures, texture);
                    }
                }
            }
            Err(e) => result.errors.push(format!("Failed to read MTL file {name}: {e}")),
        }
    }
    if result.referenced_mtl_files.is_empty() {
        result.warnings.push("OBJ file references no material library".to_string());
    }
    result
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub input_path: String,
    pub analysis_timestamp: String,
    pub analyses_performed: Vec<Analysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_quality: Option<QualityAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_analysis: Option<FolderAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_validation: Option<PackageValidation>,
    /// `<analysis>_error` to message
    #[serde(flatten)]
    pub errors: BTreeMap<String, String>,
}

/// Runs analyses; GLB and remote inputs are converted inside the host's
/// workspace
pub struct Analyzer<'a> {
    host: &'a AutomationHost<'a>,
    fetcher: &'a dyn Fetcher,
    retry: RetryPolicy,
    conversion_timeout: Duration,
}

impl<'a> Analyzer<'a> {
    pub fn new(
        host: &'a AutomationHost<'a>,
        fetcher: &'a dyn Fetcher,
        retry: RetryPolicy,
        conversion_timeout: Duration,
    ) -> Self {
        Self {
            host,
            fetcher,
            retry,
            conversion_timeout,
        }
    }

    pub fn analyze(&self, input: &str, analysis_type: AnalysisType) -> Result<AnalysisReport> {
        let analyses = plan(analysis_type, input)?;
        let mut report = AnalysisReport {
            input_path: input.to_string(),
            analysis_timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            analyses_performed: Vec::new(),
            mesh_quality: None,
            folder_analysis: None,
            package_validation: None,
            errors: BTreeMap::new(),
        };
        for analysis in analyses {
            let outcome = match analysis {
                Analysis::Quality => self.quality(input).map(|q| report.mesh_quality = Some(q)),
                Analysis::Folder => self.folder(input).map(|f| report.folder_analysis = Some(f)),
                Analysis::Validation => {
                    self.validation(input).map(|v| report.package_validation = Some(v))
                }
            };
            match outcome {
                Ok(()) => report.analyses_performed.push(analysis),
                Err(e) => {
                    debug!(%analysis, error = %e, "Analysis failed");
                    report.errors.insert(format!("{analysis}_error"), e.to_string());
                }
            }
        }
        Ok(report)
    }

    fn quality(&self, input: &str) -> Result<QualityAnalysis> {
        let path = if is_url(input) {
            let dir = self.host.workspace().subdir("download")?;
            download_to(self.fetcher, input, &dir, self.retry, self.host.clock())?
        } else {
            PathBuf::from(input)
        };
        let mesh_path = if path.is_dir() {
            first_obj(&path)?.ok_or_else(|| PipelineError::input(input, "No OBJ files found in folder"))?
        } else if extension_of(&path).as_deref() == Some("glb") {
            let dir = self.host.workspace().subdir("analysis")?;
            let mut log = ProcessingLog::new();
            unpack_glb(self.host, &path, &dir, self.conversion_timeout, &mut log)?.output
        } else {
            path
        };
        Ok(analyze_file(&mesh_path).into())
    }

    fn folder(&self, input: &str) -> Result<FolderAnalysis> {
        let path = Path::new(input);
        match input_kind(input) {
            InputKind::Folder => analyze_folder(path),
            InputKind::Obj => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let mut result = analyze_folder(dir)?;
                result.note = Some(format!(
                    "Analysis of folder containing {}",
                    path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
                ));
                Ok(result)
            }
            _ => Err(PipelineError::input(input, "folder analysis not applicable for this input type")),
        }
    }

    fn validation(&self, input: &str) -> Result<PackageValidation> {
        let path = Path::new(input);
        match input_kind(input) {
            InputKind::Obj => Ok(validate_package(path)),
            InputKind::Folder => {
                let obj = first_obj(path)?
                    .ok_or_else(|| PipelineError::input(input, "No OBJ files found for validation"))?;
                let mut result = validate_package(&obj);
                result.note = Some(format!(
                    "Validation of main OBJ file: {}",
                    obj.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
                ));
                Ok(result)
            }
            _ => Err(PipelineError::input(input, "package validation only applicable for OBJ files")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetch::FetchedAsset;
    use crate::process::RecordingRegistry;
    use crate::supervisor::{DetachedLauncher, Supervisor, SupervisorSettings};
    use crate::workspace::Workspace;
    use meshpipe_core::ManualClock;
    use url::Url;

    struct NoNetwork;

    impl Fetcher for NoNetwork {
        fn fetch(&self, url: &Url) -> std::result::Result<FetchedAsset, FetchError> {
            Err(FetchError::Connection {
                url: url.to_string(),
                message: "offline".into(),
            })
        }
    }

    const TETRA: &str = "mtllib tetra.mtl\nv 0 0 0\nv 1 0 0\nv 0 1 0\nv 0 0 1\nf 1 3 2\nf 1 2 4\nf 2 3 4\nf 1 4 3\n";

    fn package(dir: &Path) -> PathBuf {
        std::fs::write(dir.join("tetra.obj"), TETRA).unwrap();
        std::fs::write(dir.join("tetra.mtl"), "newmtl m\nmap_Kd tex/stone_albedo.png\nmap_Bump stone_normal.png\n").unwrap();
        std::fs::write(dir.join("stone_albedo.png"), b"a").unwrap();
        std::fs::write(dir.join("notes.txt"), b"hi").unwrap();
        dir.join("tetra.obj")
    }

    fn with_analyzer<T>(f: impl FnOnce(&Analyzer<'_>) -> T) -> T {
        let scratch = tempfile::tempdir().unwrap();
        let workspace = Workspace::acquire(scratch.path().join("ws")).unwrap();
        let clock = ManualClock::new();
        let registry = RecordingRegistry::new();
        let launcher = DetachedLauncher;
        let supervisor = Supervisor::new(&clock, &registry, &launcher, SupervisorSettings::default());
        let host = AutomationHost::new(None, &workspace, supervisor);
        let analyzer = Analyzer::new(&host, &NoNetwork, RetryPolicy { attempts: 1, ..RetryPolicy::default() }, Duration::from_secs(180));
        f(&analyzer)
    }

    // ---- planning ----

    #[test]
    fn test_plan_by_input_kind() {
        let dir = tempfile::tempdir().unwrap();
        let obj = package(dir.path());
        let obj = obj.to_str().unwrap();
        let folder = dir.path().to_str().unwrap();
        use Analysis::*;
        assert_eq!(plan(AnalysisType::Auto, folder).unwrap(), vec![Folder, Quality]);
        assert_eq!(plan(AnalysisType::Auto, obj).unwrap(), vec![Quality, Validation]);
        assert_eq!(plan(AnalysisType::Full, obj).unwrap(), vec![Quality, Validation, Folder]);
        assert_eq!(plan(AnalysisType::Full, "https://x.com/a.glb").unwrap(), vec![Quality]);
        assert_eq!(plan(AnalysisType::Validation, "https://x.com/a.glb").unwrap(), vec![Validation]);
        assert!(matches!(
            plan(AnalysisType::Auto, "/no/such/thing.fbx"),
            Err(PipelineError::UnsupportedFormat(_))
        ));
    }

    // ---- recommendations ----

    #[test]
    fn test_recommendations() {
        let report = MeshQualityReport {
            faces: 50_000,
            watertight: true,
            ..MeshQualityReport::default()
        };
        let r = Recommendations::for_report(&report);
        assert_eq!(r.recommended_target_faces, 10_000);
        assert_eq!(r.complexity_level, ComplexityLevel::High);
        assert_eq!(r.recommended_operation, Operation::Simplify);
        assert_eq!(r.reduction_suggestions, ReductionSuggestions { aggressive: 5000, moderate: 10_000, conservative: 25_000 });

        let small = MeshQualityReport { faces: 4000, ..MeshQualityReport::default() };
        let r = Recommendations::for_report(&small);
        assert_eq!(r.recommended_target_faces, 4000);
        assert_eq!(r.complexity_level, ComplexityLevel::Low);
        assert_eq!(r.recommended_operation, Operation::Remesh);
    }

    #[test]
    fn test_load_failure_has_no_recommendations() {
        let q: QualityAnalysis = analyze_file(Path::new("/no/such/file.obj")).into();
        assert!(q.report.is_error());
        assert!(q.recommendations.is_none());
        let json = serde_json::to_value(&q).unwrap();
        assert!(json.get("error").is_some());
        assert!(json.get("complexity_level").is_none());
    }

    // ---- folder and validation ----

    #[test]
    fn test_folder_inventory() {
        let dir = tempfile::tempdir().unwrap();
        package(dir.path());
        let f = analyze_folder(dir.path()).unwrap();
        assert_eq!(f.obj_files, vec!["tetra.obj"]);
        assert_eq!(f.mtl_files, vec!["tetra.mtl"]);
        assert_eq!(f.texture_files, vec!["stone_albedo.png"]);
        assert_eq!(f.other_files, vec!["notes.txt"]);
        let rel = &f.relationships[0];
        assert_eq!(rel.referenced_mtl, vec!["tetra.mtl"]);
        assert_eq!(rel.available_textures, vec!["stone_albedo.png"]);
        assert_eq!(rel.missing_textures, vec!["stone_normal.png"]);
        assert!(f.warnings.is_empty());
    }

    #[test]
    fn test_empty_folder_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let f = analyze_folder(dir.path()).unwrap();
        assert_eq!(
            f.warnings,
            vec!["No OBJ files found in folder", "No MTL files found in folder", "No texture files found in folder"]
        );
    }

    #[test]
    fn test_validate_package() {
        let dir = tempfile::tempdir().unwrap();
        let obj = package(dir.path());
        std::fs::write(dir.path().join("broken.obj"), "mtllib gone.mtl\nv 0 0 0\n").unwrap();
        let v = validate_package(&obj);
        assert!(v.obj_file.valid);
        assert_eq!(v.texture_files, vec!["stone_albedo.png"]);
        assert_eq!(v.missing_textures, vec!["stone_normal.png"]);
        let broken = validate_package(&dir.path().join("broken.obj"));
        assert_eq!(broken.missing_mtl_files, vec!["gone.mtl"]);
        let missing = validate_package(&dir.path().join("none.obj"));
        assert!(!missing.obj_file.exists);
        assert_eq!(missing.errors.len(), 1);
    }

    // ---- full runs ----

    #[test]
    fn test_analyze_obj_auto() {
        let dir = tempfile::tempdir().unwrap();
        let obj = package(dir.path());
        with_analyzer(|analyzer| {
            let report = analyzer.analyze(obj.to_str().unwrap(), AnalysisType::Auto).unwrap();
            assert_eq!(report.analyses_performed, vec![Analysis::Quality, Analysis::Validation]);
            let quality = report.mesh_quality.unwrap();
            assert_eq!(quality.report.faces, 4);
            assert!(quality.report.watertight);
            assert_eq!(quality.recommendations.unwrap().recommended_operation, Operation::Simplify);
        });
    }

    #[test]
    fn test_failed_sub_analysis_is_recorded() {
        with_analyzer(|analyzer| {
            let report = analyzer
                .analyze("https://models.example.com/robot.glb", AnalysisType::Full)
                .unwrap();
            assert!(report.analyses_performed.is_empty());
            assert!(report.errors["quality_error"].contains("could not connect"));
            let json = serde_json::to_value(&report).unwrap();
            assert!(json.get("quality_error").is_some());
        });
    }
}
