//! Best-effort mesh repair
//!
//! [`repair_mesh`] runs a fixed sequence of cleanup operations. Each step
//! works on a copy; if it fails the copy is dropped, the failure is recorded
//! in the [`RepairReport`], and the next step continues from the last good
//! mesh.

pub mod cleanup;
pub mod holes;
pub mod smoothing;

pub use cleanup::*;
pub use holes::*;
pub use smoothing::*;

use meshpipe_core::{Result, TriangleMesh};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Parameters for [`repair_mesh`]
#[derive(Debug, Clone)]
pub struct RepairOptions {
    /// Largest hole (in boundary edges) closed on the first attempt
    pub max_hole_size: usize,
    /// Bound used when the first attempt fails
    pub fallback_hole_size: usize,
    pub smoothing_iterations: usize,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            max_hole_size: 30,
            fallback_hole_size: 10,
            smoothing_iterations: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStep {
    DuplicateVertices,
    DuplicateFaces,
    NullFaces,
    NonManifoldEdges,
    CloseHoles,
    Smoothing,
}

impl fmt::Display for RepairStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepairStep::DuplicateVertices => "remove duplicate vertices",
            RepairStep::DuplicateFaces => "remove duplicate faces",
            RepairStep::NullFaces => "remove null faces",
            RepairStep::NonManifoldEdges => "remove non-manifold edges",
            RepairStep::CloseHoles => "close holes",
            RepairStep::Smoothing => "laplacian smoothing",
        };
        f.write_str(name)
    }
}

/// Result of a single step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub step: RepairStep,
    /// Elements merged, removed or holes closed; iterations for smoothing
    pub changed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairReport {
    pub steps: Vec<StepOutcome>,
    pub faces_before: usize,
    pub faces_after: usize,
}

impl RepairReport {
    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.error.is_some())
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn outcome(&self, step: RepairStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == step)
    }
}

fn run_step<F>(mesh: &mut TriangleMesh, report: &mut RepairReport, step: RepairStep, op: F)
where
    F: FnOnce(&mut TriangleMesh) -> Result<usize>,
{
    let mut candidate = mesh.clone();
    let outcome = match op(&mut candidate) {
        Ok(changed) => {
            *mesh = candidate;
            debug!(%step, changed, "Repair step done");
            StepOutcome {
                step,
                changed,
                error: None,
            }
        }
        Err(e) => {
            warn!(%step, error = %e, "Repair step failed, continuing");
            StepOutcome {
                step,
                changed: 0,
                error: Some(e.to_string()),
            }
        }
    };
    report.steps.push(outcome);
}

/// Run the repair sequence on a copy of `mesh`
pub fn repair_mesh(mesh: &TriangleMesh, options: &RepairOptions) -> (TriangleMesh, RepairReport) {
    let mut working = mesh.clone();
    let mut report = RepairReport {
        faces_before: mesh.face_count(),
        ..RepairReport::default()
    };

    run_step(&mut working, &mut report, RepairStep::DuplicateVertices, remove_duplicate_vertices);
    run_step(&mut working, &mut report, RepairStep::DuplicateFaces, remove_duplicate_faces);
    run_step(&mut working, &mut report, RepairStep::NullFaces, remove_null_faces);
    run_step(&mut working, &mut report, RepairStep::NonManifoldEdges, remove_non_manifold_edges);

    let (max, fallback) = (options.max_hole_size, options.fallback_hole_size);
    run_step(&mut working, &mut report, RepairStep::CloseHoles, |m| {
        close_holes(m, max).or_else(|e| {
            warn!(error = %e, max, fallback, "Hole closing failed, retrying with smaller bound");
            close_holes(m, fallback)
        })
    });

    let iterations = options.smoothing_iterations;
    run_step(&mut working, &mut report, RepairStep::Smoothing, |m| {
        laplacian_smooth(m, iterations)
    });

    working.remove_unreferenced_vertices();
    report.faces_after = working.face_count();
    info!(
        faces_before = report.faces_before,
        faces_after = report.faces_after,
        failed_steps = report.failures().count(),
        "Mesh repair finished"
    );
    (working, report)
}
