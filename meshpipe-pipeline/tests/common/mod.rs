#![allow(dead_code)]

use meshpipe_core::{ManualClock, Point3f, TriangleMesh};
use meshpipe_io::ObjWriter;
use meshpipe_pipeline::error::FetchError;
use meshpipe_pipeline::fetch::FetchedAsset;
use meshpipe_pipeline::remesh::RemeshCommand;
use meshpipe_pipeline::supervisor::{DetachedLauncher, ExternalInvocation};
use meshpipe_pipeline::{
    Fetcher, Launcher, Pipeline, PipelineConfig, PipelineError, RecordingRegistry, RemeshRunner, Services,
};
use std::f32::consts::PI;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;

pub const TETRA_OBJ: &str = "v 0 0 0\nv 1 0 0\nv 0 1 0\nv 0 0 1\nf 1 3 2\nf 1 2 4\nf 2 3 4\nf 1 4 3\n";

/// Closed latitude/longitude sphere
pub fn make_uv_sphere(segments: usize, rings: usize) -> TriangleMesh {
    let mut vertices = vec![Point3f::new(0.0, 1.0, 0.0)];
    for r in 1..rings {
        let phi = PI * r as f32 / rings as f32;
        for s in 0..segments {
            let theta = 2.0 * PI * s as f32 / segments as f32;
            vertices.push(Point3f::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin()));
        }
    }
    vertices.push(Point3f::new(0.0, -1.0, 0.0));
    let bottom = vertices.len() - 1;
    let ring = |r: usize, s: usize| 1 + (r - 1) * segments + s % segments;

    let mut faces = Vec::new();
    for s in 0..segments {
        faces.push([0, ring(1, s + 1), ring(1, s)]);
    }
    for r in 1..rings - 1 {
        for s in 0..segments {
            let (a, b) = (ring(r, s), ring(r, s + 1));
            let (c, d) = (ring(r + 1, s), ring(r + 1, s + 1));
            faces.push([a, b, d]);
            faces.push([a, d, c]);
        }
    }
    for s in 0..segments {
        faces.push([bottom, ring(rings - 1, s), ring(rings - 1, s + 1)]);
    }
    TriangleMesh::from_vertices_and_faces(vertices, faces)
}

/// Write `mesh` as `<dir>/<name>.obj` with a textured MTL next to it
pub fn write_package(dir: &Path, name: &str, mesh: &TriangleMesh) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let obj = dir.join(format!("{name}.obj"));
    ObjWriter::write_document(mesh, &[format!("{name}.mtl")], &obj).unwrap();
    std::fs::write(
        dir.join(format!("{name}.mtl")),
        format!("newmtl stone\nKd 0.8 0.8 0.8\nmap_Kd {name}_albedo.png\n"),
    )
    .unwrap();
    std::fs::write(dir.join(format!("{name}_albedo.png")), b"\x89PNG albedo").unwrap();
    std::fs::write(dir.join(format!("{name}_normal.png")), b"\x89PNG normal").unwrap();
    obj
}

pub struct Offline;

impl Fetcher for Offline {
    fn fetch(&self, url: &Url) -> Result<FetchedAsset, FetchError> {
        Err(FetchError::Connection {
            url: url.to_string(),
            message: "offline".into(),
        })
    }
}

/// Remesher that writes a tetrahedron instead of running the tool
#[derive(Default)]
pub struct FakeRemesher {
    pub fail: bool,
    pub calls: Mutex<Vec<RemeshCommand>>,
}

impl FakeRemesher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl RemeshRunner for FakeRemesher {
    fn run(&self, command: &RemeshCommand, _log_file: &Path, _timeout: Duration) -> Result<(), PipelineError> {
        self.calls.lock().unwrap().push(command.clone());
        if self.fail {
            return Err(PipelineError::Remesh("exited with exit status: 1".into()));
        }
        let out = command.args.iter().position(|a| a == "-o").unwrap() + 1;
        std::fs::write(&command.args[out], TETRA_OBJ)?;
        Ok(())
    }
}

/// Launcher for a worker that never finishes; registers it as a running
/// process so timeouts can be checked for termination
pub struct HangingLauncher<'r> {
    pub registry: &'r RecordingRegistry,
    pub launches: Mutex<u32>,
}

impl Launcher for HangingLauncher<'_> {
    fn launch(&self, invocation: &ExternalInvocation) -> std::io::Result<()> {
        let mut n = self.launches.lock().unwrap();
        *n += 1;
        self.registry.spawn(
            9000 + *n,
            "blender",
            &format!("blender --background --python {}", invocation.script_path.display()),
        );
        Ok(())
    }
}

/// Directories and fakes for one test
pub struct Harness {
    pub dir: TempDir,
    pub clock: ManualClock,
    pub registry: RecordingRegistry,
    pub remesher: FakeRemesher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_remesher(FakeRemesher::default())
    }

    pub fn with_remesher(remesher: FakeRemesher) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            clock: ManualClock::new(),
            registry: RecordingRegistry::new(),
            remesher,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            temp_dir: self.path("temp"),
            output_dir: self.path("output"),
            archive_dir: self.path("archives"),
            log_dir: self.path("logs"),
            ..PipelineConfig::default()
        }
    }

    pub fn pipeline<'a>(&'a self, launcher: &'a dyn Launcher, blender: Option<&'a Path>) -> Pipeline<'a> {
        let services = Services {
            clock: &self.clock,
            registry: &self.registry,
            launcher,
            fetcher: &Offline,
            remesher: &self.remesher,
            blender,
        };
        Pipeline::new(self.config(), services)
    }

    /// Pipeline without an automation host
    pub fn offline_pipeline(&self) -> Pipeline<'_> {
        self.pipeline(&DetachedLauncher, None)
    }

    pub fn temp_is_empty(&self) -> bool {
        std::fs::read_dir(self.path("temp"))
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}
