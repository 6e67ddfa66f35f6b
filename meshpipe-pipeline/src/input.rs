//! Input normalisation
//!
//! Every request input (a local OBJ or GLB, a folder package, or a URL) is
//! turned into a working OBJ package under the request workspace before any
//! stage touches it.

use crate::blender::AutomationHost;
use crate::convert::unpack_glb;
use crate::error::{PipelineError, Result};
use crate::fetch::{download_to, Fetcher, RetryPolicy};
use crate::log::ProcessingLog;
use crate::material::{copy_beside, find_material_file, rename_tripo_textures};
use crate::textures::{is_texture_file, is_url, TextureSet};
use meshpipe_io::obj::{read_material_libs, set_material_lib};
use meshpipe_io::{extension_of, MaterialLibrary};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Where a request's model comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum ModelSource {
    File(PathBuf),
    Folder(PathBuf),
    Url(String),
}

impl ModelSource {
    pub fn detect(input: &str) -> Result<Self> {
        if is_url(input) {
            return Ok(ModelSource::Url(input.to_string()));
        }
        let path = PathBuf::from(input);
        if path.is_dir() {
            Ok(ModelSource::Folder(path))
        } else if path.is_file() {
            Ok(ModelSource::File(path))
        } else {
            Err(PipelineError::input(input, "no such file or directory"))
        }
    }

    /// Base name of the input as the caller gave it
    pub fn original_name(&self) -> String {
        let name = match self {
            ModelSource::File(path) | ModelSource::Folder(path) => {
                path.file_name().map(|n| n.to_string_lossy().into_owned())
            }
            ModelSource::Url(raw) => url::Url::parse(raw).ok().and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            }),
        };
        name.unwrap_or_else(|| "model".to_string())
    }

    /// Original name without its extension, used to name outputs
    pub fn stem(&self) -> String {
        let name = self.original_name();
        match self {
            ModelSource::Folder(_) => name,
            _ => Path::new(&name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or(name),
        }
    }
}

/// A working OBJ package inside the workspace
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedInput {
    pub source: ModelSource,
    pub mesh_path: PathBuf,
    pub material_path: Option<PathBuf>,
    pub textures: TextureSet,
    /// Set when the model was converted from GLB with the minimal path
    pub degraded: Option<String>,
}

impl ResolvedInput {
    pub fn directory(&self) -> &Path {
        self.mesh_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Locate a file named in an MTL or OBJ relative to `dir`, falling back to
/// its base name in `dir`
fn locate(dir: &Path, reference: &str) -> Option<PathBuf> {
    let normalized = reference.replace('\\', "/");
    let direct = if Path::new(&normalized).is_absolute() {
        PathBuf::from(&normalized)
    } else {
        dir.join(&normalized)
    };
    if direct.is_file() {
        return Some(direct);
    }
    let base = normalized.rsplit('/').next()?;
    let beside = dir.join(base);
    beside.is_file().then_some(beside)
}

/// Copy `obj` with its material libraries, their textures and the loose
/// textures of its directory into `dest`. Returns the copied OBJ path.
pub fn copy_obj_package(obj: &Path, dest: &Path, additional: &[PathBuf]) -> Result<PathBuf> {
    let source_dir = obj.parent().unwrap_or_else(|| Path::new("."));
    let name = file_name(obj).ok_or_else(|| PipelineError::input(obj.display().to_string(), "not a file"))?;
    std::fs::create_dir_all(dest)?;
    let target = dest.join(&name);
    std::fs::copy(obj, &target)?;

    let mut libraries: Vec<PathBuf> = Vec::new();
    let referenced = read_material_libs(obj).unwrap_or_default();
    for lib in &referenced {
        match locate(source_dir, lib) {
            Some(path) if !libraries.contains(&path) => libraries.push(path),
            Some(_) => {}
            None => warn!(obj = %obj.display(), mtl = %lib, "Referenced material library not found"),
        }
    }
    let same_stem = obj.with_extension("mtl");
    if same_stem.is_file() && !libraries.contains(&same_stem) {
        libraries.push(same_stem);
    }

    let mut copied = 0usize;
    for lib in &libraries {
        if copy_beside(lib, dest)? {
            copied += 1;
        }
        let lib_dir = lib.parent().unwrap_or(source_dir);
        let library = MaterialLibrary::read(lib)?;
        for texture in library.texture_files() {
            match locate(lib_dir, &texture).or_else(|| locate(source_dir, &texture)) {
                Some(path) => {
                    if copy_beside(&path, dest)? {
                        copied += 1;
                    }
                }
                None => warn!(mtl = %lib.display(), texture = %texture, "Referenced texture not found"),
            }
        }
    }

    // the copy sits next to its libraries, so references become bare names
    if let Some(first) = libraries.first().and_then(|p| file_name(p)) {
        if referenced.first() != Some(&first) {
            set_material_lib(&target, &first)?;
        }
    }

    let mut loose = TextureSet::new();
    loose.scan_dir(source_dir)?;
    for record in loose.iter() {
        if copy_beside(&record.source, dest)? {
            copied += 1;
        }
    }
    for extra in additional {
        if extra.is_file() && copy_beside(extra, dest)? {
            copied += 1;
        }
    }
    debug!(obj = %target.display(), copied, "OBJ package copied");
    Ok(target)
}

/// First `.obj` in `dir` by file name
pub fn first_obj(dir: &Path) -> Result<Option<PathBuf>> {
    let mut objs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && extension_of(p).as_deref() == Some("obj"))
        .collect();
    objs.sort();
    Ok(objs.into_iter().next())
}

/// Turns request inputs into working OBJ packages
pub struct InputResolver<'a> {
    host: &'a AutomationHost<'a>,
    fetcher: &'a dyn Fetcher,
    retry: RetryPolicy,
    conversion_timeout: Duration,
}

impl<'a> InputResolver<'a> {
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

    /// Resolve `input` and copy it, plus `additional` files, into the
    /// workspace's `input/` directory
    pub fn resolve(
        &self,
        input: &str,
        additional: &[PathBuf],
        log: &mut ProcessingLog,
    ) -> Result<ResolvedInput> {
        let source = ModelSource::detect(input)?;
        let workspace = self.host.workspace();
        let input_dir = workspace.subdir("input")?;

        let (mesh_path, degraded) = match &source {
            ModelSource::Folder(dir) => {
                let obj = first_obj(dir)?
                    .ok_or_else(|| PipelineError::input(input, "no OBJ file found in folder"))?;
                log.info("input", format!("Folder package, primary mesh {}", obj.display()));
                (copy_obj_package(&obj, &input_dir, additional)?, None)
            }
            ModelSource::File(path) => self.resolve_file(input, path, &input_dir, additional, log)?,
            ModelSource::Url(raw) => {
                let downloads = workspace.subdir("download")?;
                let path = download_to(self.fetcher, raw, &downloads, self.retry, self.host.clock())?;
                log.info("input", format!("Downloaded {} to {}", raw, path.display()));
                self.resolve_file(input, &path, &input_dir, additional, log)?
            }
        };

        let renamed = rename_tripo_textures(&input_dir)?;
        if !renamed.is_empty() {
            log.info("input", format!("Renamed {} Tripo textures", renamed.len()));
        }

        let mut textures = TextureSet::new();
        textures.scan_dir(&input_dir)?;
        for extra in additional {
            let is_texture = extra
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_texture_file);
            if is_texture && extra.is_file() {
                textures.insert(extra.clone());
            }
        }
        let material_path = find_material_file(&mesh_path);
        log.info(
            "input",
            format!(
                "Working mesh {} with {} textures{}",
                mesh_path.display(),
                textures.len(),
                if material_path.is_some() { "" } else { " and no material library" }
            ),
        );
        Ok(ResolvedInput {
            source,
            mesh_path,
            material_path,
            textures,
            degraded,
        })
    }

    fn resolve_file(
        &self,
        input: &str,
        path: &Path,
        input_dir: &Path,
        additional: &[PathBuf],
        log: &mut ProcessingLog,
    ) -> Result<(PathBuf, Option<String>)> {
        match extension_of(path).as_deref() {
            Some("obj") => Ok((copy_obj_package(path, input_dir, additional)?, None)),
            Some("glb") => {
                let staged = self.host.workspace().subdir("source")?;
                let local = staged.join(file_name(path).unwrap_or_else(|| "model.glb".to_string()));
                if local != path {
                    std::fs::copy(path, &local)?;
                }
                let outcome = unpack_glb(self.host, &local, input_dir, self.conversion_timeout, log)
                    .map_err(|e| match e {
                        PipelineError::Fetch(_) | PipelineError::Io(_) => e,
                        other => PipelineError::input(input, other.to_string()),
                    })?;
                for extra in additional {
                    if extra.is_file() {
                        copy_beside(extra, input_dir)?;
                    }
                }
                Ok((outcome.output, outcome.degraded))
            }
            Some(ext) => Err(PipelineError::UnsupportedFormat(format!(".{ext}"))),
            None => Err(PipelineError::UnsupportedFormat(format!(
                "{} has no file extension",
                path.display()
            ))),
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
    use meshpipe_core::{ManualClock, Point3f, TriangleMesh};
    use meshpipe_io::{GlbMaterial, GlbWriter};
    use url::Url;

    struct StaticFetcher(Vec<u8>, &'static str);

    impl Fetcher for StaticFetcher {
        fn fetch(&self, _url: &Url) -> std::result::Result<FetchedAsset, FetchError> {
            Ok(FetchedAsset {
                bytes: self.0.clone(),
                content_type: Some(self.1.to_string()),
            })
        }
    }

    const OBJ: &str = "mtllib maps/house.mtl\nv 0 0 0\nv 1 0 0\nv 0 1 0\nusemtl wall\nf 1 2 3\n";

    fn package(dir: &Path) -> PathBuf {
        std::fs::create_dir_all(dir.join("maps")).unwrap();
        std::fs::write(dir.join("house.obj"), OBJ).unwrap();
        std::fs::write(dir.join("maps/house.mtl"), "newmtl wall\nKd 1 1 1\nmap_Kd ..\\tex\\wall_albedo.png\n").unwrap();
        std::fs::create_dir_all(dir.join("tex")).unwrap();
        std::fs::write(dir.join("tex/wall_albedo.png"), b"png").unwrap();
        std::fs::write(dir.join("wall_normal.png"), b"png2").unwrap();
        std::fs::write(dir.join("preview.png"), b"thumb").unwrap();
        dir.join("house.obj")
    }

    fn with_resolver<T>(fetcher: &dyn Fetcher, f: impl FnOnce(&InputResolver<'_>, &Workspace) -> T) -> T {
        let scratch = tempfile::tempdir().unwrap();
        let workspace = Workspace::acquire(scratch.path().join("ws")).unwrap();
        let clock = ManualClock::new();
        let registry = RecordingRegistry::new();
        let launcher = DetachedLauncher;
        let supervisor = Supervisor::new(&clock, &registry, &launcher, SupervisorSettings::default());
        let host = AutomationHost::new(None, &workspace, supervisor);
        let resolver = InputResolver::new(&host, fetcher, RetryPolicy::default(), Duration::from_secs(180));
        f(&resolver, &workspace)
    }

    // ---- source detection ----

    #[test]
    fn test_detect_and_names() {
        let dir = tempfile::tempdir().unwrap();
        let obj = package(dir.path());
        let src = ModelSource::detect(obj.to_str().unwrap()).unwrap();
        assert_eq!(src.stem(), "house");
        let url = ModelSource::detect("https://cdn.example.com/a/robot.glb?sig=1").unwrap();
        assert_eq!(url.original_name(), "robot.glb");
        assert_eq!(url.stem(), "robot");
        assert!(matches!(
            ModelSource::detect("/definitely/missing.obj"),
            Err(PipelineError::InputResolution { .. })
        ));
    }

    // ---- packages ----

    #[test]
    fn test_copy_obj_package_collects_references() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let obj = package(src.path());
        let copied = copy_obj_package(&obj, dest.path(), &[]).unwrap();
        assert_eq!(copied, dest.path().join("house.obj"));
        assert!(dest.path().join("house.mtl").is_file());
        assert!(dest.path().join("wall_albedo.png").is_file());
        assert!(dest.path().join("wall_normal.png").is_file());
        // thumbnails are not textures
        assert!(!dest.path().join("preview.png").exists());
    }

    #[test]
    fn test_resolve_local_obj() {
        let src = tempfile::tempdir().unwrap();
        let obj = package(src.path());
        let fetcher = StaticFetcher(Vec::new(), "text/plain");
        with_resolver(&fetcher, |resolver, workspace| {
            let mut log = ProcessingLog::new();
            let resolved = resolver.resolve(obj.to_str().unwrap(), &[], &mut log).unwrap();
            assert!(resolved.mesh_path.starts_with(workspace.root()));
            assert_eq!(resolved.textures.len(), 2);
            assert!(resolved.material_path.is_some());
            assert!(resolved.degraded.is_none());
        });
    }

    #[test]
    fn test_resolve_folder_uses_first_obj() {
        let src = tempfile::tempdir().unwrap();
        package(src.path());
        std::fs::write(src.path().join("zz_extra.obj"), "v 0 0 0\n").unwrap();
        let fetcher = StaticFetcher(Vec::new(), "text/plain");
        with_resolver(&fetcher, |resolver, _| {
            let mut log = ProcessingLog::new();
            let resolved = resolver.resolve(src.path().to_str().unwrap(), &[], &mut log).unwrap();
            assert_eq!(resolved.mesh_path.file_name().unwrap(), "house.obj");
        });
    }

    #[test]
    fn test_empty_folder_is_input_error() {
        let src = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher(Vec::new(), "text/plain");
        with_resolver(&fetcher, |resolver, _| {
            let mut log = ProcessingLog::new();
            let err = resolver.resolve(src.path().to_str().unwrap(), &[], &mut log).unwrap_err();
            assert!(err.to_string().contains("no OBJ file found"));
        });
    }

    #[test]
    fn test_unsupported_extension() {
        let src = tempfile::tempdir().unwrap();
        let fbx = src.path().join("model.fbx");
        std::fs::write(&fbx, b"fbx").unwrap();
        let fetcher = StaticFetcher(Vec::new(), "text/plain");
        with_resolver(&fetcher, |resolver, _| {
            let mut log = ProcessingLog::new();
            let err = resolver.resolve(fbx.to_str().unwrap(), &[], &mut log).unwrap_err();
            assert!(matches!(err, PipelineError::UnsupportedFormat(ref e) if e == ".fbx"));
        });
    }

    // ---- conversion and download ----

    fn triangle_glb() -> Vec<u8> {
        let mesh = TriangleMesh::from_vertices_and_faces(
            vec![Point3f::new(0.0, 0.0, 0.0), Point3f::new(1.0, 0.0, 0.0), Point3f::new(0.0, 1.0, 0.0)],
            vec![[0, 1, 2]],
        );
        GlbWriter::to_bytes(&mesh, &[GlbMaterial::default()]).unwrap()
    }

    #[test]
    fn test_resolve_glb_url_with_fallback_unpack() {
        let fetcher = StaticFetcher(triangle_glb(), "model/gltf-binary");
        with_resolver(&fetcher, |resolver, workspace| {
            let mut log = ProcessingLog::new();
            let resolved = resolver
                .resolve("https://cdn.example.com/models/robot?token=abc", &[], &mut log)
                .unwrap();
            assert_eq!(resolved.mesh_path, workspace.root().join("input").join("robot.obj"));
            assert!(resolved.degraded.is_some());
            assert!(log.mentions("minimal GLB to OBJ conversion"));
            assert_eq!(resolved.source.stem(), "robot");
        });
    }

    #[test]
    fn test_resolve_tripo_textures_are_renamed() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("bot.obj"), "mtllib bot.mtl\nv 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n").unwrap();
        std::fs::write(src.path().join("bot.mtl"), "newmtl m\nmap_Kd tripo_image_abc_0.png\n").unwrap();
        std::fs::write(src.path().join("tripo_image_abc_0.png"), b"png").unwrap();
        let fetcher = StaticFetcher(Vec::new(), "text/plain");
        with_resolver(&fetcher, |resolver, workspace| {
            let mut log = ProcessingLog::new();
            let resolved = resolver
                .resolve(src.path().join("bot.obj").to_str().unwrap(), &[], &mut log)
                .unwrap();
            let names = resolved.textures.names();
            assert_eq!(names.len(), 1);
            assert!(names[0].ends_with("_basecolor.png"), "{names:?}");
            let mtl = std::fs::read_to_string(workspace.root().join("input/bot.mtl")).unwrap();
            assert!(mtl.contains(&names[0]));
        });
    }
}
