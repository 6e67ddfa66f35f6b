//! Progressive decimation
//!
//! Large reductions are split into a series of bounded steps, each keeping
//! at least half of the current faces (60% when the mesh carries texture
//! coordinates), followed by one exact step to the requested count.
//!
//! Every step result is handed to a [`Checkpoint`], which may persist it and
//! hand back a reloaded copy. If anything stops the sequence early the best
//! result so far is returned together with the reason.

use crate::edge_collapse::EdgeCollapseSimplifier;
use crate::MeshSimplifier;
use meshpipe_core::{Clock, Result, TriangleMesh};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A finished run may land this far above its target and still count as complete
const TARGET_TOLERANCE: f64 = 1.1;

/// Tuning for [`ProgressiveDecimator`]
#[derive(Debug, Clone)]
pub struct ProgressiveOptions {
    /// Upper bound on simplification passes, final step included
    pub max_steps: usize,
    /// Cumulative wall-clock budget across all steps
    pub time_budget: Duration,
    /// Fraction of faces an intermediate step keeps
    pub step_ratio: f64,
    /// Fraction kept when the mesh has texture coordinates
    pub uv_step_ratio: f64,
    /// A step keeping more than this fraction of faces made no progress
    pub stall_ratio: f64,
    /// Weight of boundary constraint quadrics
    pub boundary_weight: f64,
    /// Double the boundary weight for the final exact step
    pub preserve_boundaries: bool,
}

impl Default for ProgressiveOptions {
    fn default() -> Self {
        Self {
            max_steps: 10,
            time_budget: Duration::from_secs(300),
            step_ratio: 0.5,
            uv_step_ratio: 0.6,
            stall_ratio: 0.95,
            boundary_weight: 1.0,
            preserve_boundaries: true,
        }
    }
}

/// Why the decimator stopped
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// The input was already at or below the target
    AlreadyBelowTarget,
    /// The final step completed
    Completed,
    /// The cumulative time budget ran out
    TimeBudget,
    /// A step removed too few faces
    NoProgress,
    /// A step produced no faces at all
    EmptyResult,
    /// A step or checkpoint failed
    StepFailed(String),
    /// Every step ran but the result stayed more than 10% above the target
    ShortOfTarget,
}

impl StopReason {
    pub fn is_early_exit(&self) -> bool {
        !matches!(self, StopReason::AlreadyBelowTarget | StopReason::Completed)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::AlreadyBelowTarget => write!(f, "already at or below target"),
            StopReason::Completed => write!(f, "completed"),
            StopReason::TimeBudget => write!(f, "time budget exceeded"),
            StopReason::NoProgress => write!(f, "step made no progress"),
            StopReason::EmptyResult => write!(f, "step produced an empty mesh"),
            StopReason::StepFailed(message) => write!(f, "step failed: {message}"),
            StopReason::ShortOfTarget => write!(f, "stopped short of the target face count"),
        }
    }
}

/// One simplification pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecimationStep {
    pub index: usize,
    pub target_faces: usize,
    pub faces_before: usize,
    pub faces_after: usize,
    pub elapsed: Duration,
}

/// Outcome of a progressive decimation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecimationReport {
    pub original_faces: usize,
    pub final_faces: usize,
    pub target_faces: usize,
    pub steps: Vec<DecimationStep>,
    pub stop: StopReason,
    pub elapsed: Duration,
}

impl DecimationReport {
    pub fn early_exit(&self) -> Option<&StopReason> {
        self.stop.is_early_exit().then_some(&self.stop)
    }
}

/// Receives every intermediate mesh.
///
/// Implementations typically write the mesh to disk and read it back, so
/// that each step starts from a file on disk. The returned mesh becomes the
/// input of the next step.
pub trait Checkpoint {
    fn persist(&mut self, step: usize, mesh: TriangleMesh) -> Result<TriangleMesh>;
}

/// Keeps intermediates in memory
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryCheckpoint;

impl Checkpoint for InMemoryCheckpoint {
    fn persist(&mut self, _step: usize, mesh: TriangleMesh) -> Result<TriangleMesh> {
        Ok(mesh)
    }
}

/// Stepwise QEM decimation with step, time and progress limits
pub struct ProgressiveDecimator<'c> {
    options: ProgressiveOptions,
    clock: &'c dyn Clock,
}

impl<'c> ProgressiveDecimator<'c> {
    pub fn new(options: ProgressiveOptions, clock: &'c dyn Clock) -> Self {
        Self { options, clock }
    }

    pub fn options(&self) -> &ProgressiveOptions {
        &self.options
    }

    /// Face count targeted by the next intermediate step
    pub fn step_target(&self, current_faces: usize, target_faces: usize, has_uvs: bool) -> usize {
        let ratio = if has_uvs {
            self.options.uv_step_ratio
        } else {
            self.options.step_ratio
        };
        let stepped = (current_faces as f64 * ratio).ceil() as usize;
        stepped.max(target_faces)
    }

    /// Reduce `mesh` towards `target_faces`.
    ///
    /// The returned mesh never has more faces than the input. When the
    /// report carries an early-exit reason the mesh is the last good
    /// intermediate.
    pub fn decimate(
        &self,
        mesh: &TriangleMesh,
        target_faces: usize,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<(TriangleMesh, DecimationReport)> {
        let start = self.clock.now();
        let original_faces = mesh.face_count();
        let mut report = DecimationReport {
            original_faces,
            final_faces: original_faces,
            target_faces,
            steps: Vec::new(),
            stop: StopReason::Completed,
            elapsed: Duration::ZERO,
        };

        if original_faces <= target_faces {
            report.stop = StopReason::AlreadyBelowTarget;
            return Ok((mesh.clone(), report));
        }

        let has_uvs = mesh.has_uvs();
        let step_simplifier = EdgeCollapseSimplifier::weighted(self.options.boundary_weight);
        let mut current = mesh.clone();
        let intermediate_limit = self.options.max_steps.saturating_sub(1);

        info!(
            original_faces,
            target_faces,
            has_uvs,
            "Starting progressive decimation"
        );

        while current.face_count() > target_faces.saturating_mul(2)
            && report.steps.len() < intermediate_limit
        {
            if self.clock.now().duration_since(start) >= self.options.time_budget {
                return Ok(self.finish(current, report, StopReason::TimeBudget, start));
            }

            let faces_before = current.face_count();
            let step_target = self.step_target(faces_before, target_faces, has_uvs);
            let index = report.steps.len() + 1;
            let step_start = self.clock.now();

            let reduced = match step_simplifier.simplify_to(&current, step_target) {
                Ok(reduced) => reduced,
                Err(e) => {
                    warn!(step = index, error = %e, "Decimation step failed");
                    return Ok(self.finish(current, report, StopReason::StepFailed(e.to_string()), start));
                }
            };
            let faces_after = reduced.face_count();

            report.steps.push(DecimationStep {
                index,
                target_faces: step_target,
                faces_before,
                faces_after,
                elapsed: self.clock.now().duration_since(step_start),
            });
            debug!(step = index, faces_before, faces_after, step_target, "Decimation step done");

            if faces_after == 0 {
                return Ok(self.finish(current, report, StopReason::EmptyResult, start));
            }

            let stalled = faces_after as f64 >= faces_before as f64 * self.options.stall_ratio;
            current = match checkpoint.persist(index, reduced) {
                Ok(reloaded) => reloaded,
                Err(e) => {
                    warn!(step = index, error = %e, "Could not checkpoint intermediate mesh");
                    return Ok(self.finish(current, report, StopReason::StepFailed(e.to_string()), start));
                }
            };

            if stalled {
                return Ok(self.finish(current, report, StopReason::NoProgress, start));
            }
            if self.clock.now().duration_since(start) >= self.options.time_budget {
                return Ok(self.finish(current, report, StopReason::TimeBudget, start));
            }
        }

        if current.face_count() > target_faces && report.steps.len() < self.options.max_steps {
            let weight = if self.options.preserve_boundaries {
                self.options.boundary_weight * 2.0
            } else {
                self.options.boundary_weight
            };
            let final_simplifier = EdgeCollapseSimplifier::weighted(weight);
            let faces_before = current.face_count();
            let step_start = self.clock.now();
            let index = report.steps.len() + 1;

            match final_simplifier.simplify_to(&current, target_faces) {
                Ok(reduced) if reduced.face_count() > 0 => {
                    report.steps.push(DecimationStep {
                        index,
                        target_faces,
                        faces_before,
                        faces_after: reduced.face_count(),
                        elapsed: self.clock.now().duration_since(step_start),
                    });
                    current = reduced;
                }
                Ok(_) => {
                    return Ok(self.finish(current, report, StopReason::EmptyResult, start));
                }
                Err(e) => {
                    warn!(step = index, error = %e, "Final decimation step failed");
                    return Ok(self.finish(current, report, StopReason::StepFailed(e.to_string()), start));
                }
            }
        }

        let stop = if current.face_count() as f64 > target_faces as f64 * TARGET_TOLERANCE {
            StopReason::ShortOfTarget
        } else {
            StopReason::Completed
        };
        Ok(self.finish(current, report, stop, start))
    }

    fn finish(
        &self,
        mesh: TriangleMesh,
        mut report: DecimationReport,
        stop: StopReason,
        start: std::time::Instant,
    ) -> (TriangleMesh, DecimationReport) {
        report.final_faces = mesh.face_count();
        report.elapsed = self.clock.now().duration_since(start);
        if stop.is_early_exit() {
            warn!(
                reason = %stop,
                final_faces = report.final_faces,
                steps = report.steps.len(),
                "Progressive decimation stopped early"
            );
        } else {
            info!(
                final_faces = report.final_faces,
                steps = report.steps.len(),
                "Progressive decimation finished"
            );
        }
        report.stop = stop;
        (mesh, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_meshes::*;
    use meshpipe_core::{Error, ManualClock, SystemClock, Uv};

    struct CountingCheckpoint {
        calls: Vec<(usize, usize)>,
    }

    impl Checkpoint for CountingCheckpoint {
        fn persist(&mut self, step: usize, mesh: TriangleMesh) -> Result<TriangleMesh> {
            self.calls.push((step, mesh.face_count()));
            Ok(mesh)
        }
    }

    struct FailingCheckpoint;

    impl Checkpoint for FailingCheckpoint {
        fn persist(&mut self, _step: usize, _mesh: TriangleMesh) -> Result<TriangleMesh> {
            Err(Error::Algorithm("disk full".to_string()))
        }
    }

    // ---- Step sizing ----

    #[test]
    fn test_step_target_ratios() {
        let clock = SystemClock;
        let d = ProgressiveDecimator::new(ProgressiveOptions::default(), &clock);
        assert_eq!(d.step_target(1000, 100, false), 500);
        assert_eq!(d.step_target(1000, 100, true), 600);
        assert_eq!(d.step_target(150, 100, false), 100);
    }

    // ---- Decimation ----

    #[test]
    fn test_noop_when_below_target() {
        let clock = SystemClock;
        let d = ProgressiveDecimator::new(ProgressiveOptions::default(), &clock);
        let mesh = make_plane_grid(5);
        let (out, report) = d.decimate(&mesh, 1000, &mut InMemoryCheckpoint).unwrap();
        assert_eq!(out, mesh);
        assert_eq!(report.stop, StopReason::AlreadyBelowTarget);
        assert!(report.steps.is_empty());
        assert!(report.early_exit().is_none());
    }

    #[test]
    fn test_reduces_grid_monotonically() {
        let clock = SystemClock;
        let d = ProgressiveDecimator::new(ProgressiveOptions::default(), &clock);
        let mesh = make_plane_grid(31); // 1800 faces
        let mut checkpoint = CountingCheckpoint { calls: Vec::new() };

        let (out, report) = d.decimate(&mesh, 200, &mut checkpoint).unwrap();

        assert!(out.face_count() < mesh.face_count());
        assert!(report.steps.len() <= 10);
        for step in &report.steps {
            assert!(step.faces_after <= step.faces_before);
        }
        assert!(!checkpoint.calls.is_empty(), "intermediates pass through the checkpoint");
        if report.early_exit().is_none() {
            assert!(out.face_count() <= 220, "got {}", out.face_count());
        }
        assert_eq!(report.final_faces, out.face_count());
    }

    #[test]
    fn test_uv_mesh_uses_gentler_steps() {
        let clock = SystemClock;
        let d = ProgressiveDecimator::new(ProgressiveOptions::default(), &clock);
        let mut mesh = make_plane_grid(21); // 800 faces
        let uvs: Vec<Uv> = mesh.vertices.iter().map(|p| [p.x / 20.0, p.y / 20.0]).collect();
        mesh.set_uvs(uvs);

        let (out, report) = d.decimate(&mesh, 50, &mut InMemoryCheckpoint).unwrap();
        assert_eq!(report.steps[0].target_faces, 480);
        assert!(out.has_uvs());
    }

    #[test]
    fn test_step_limit_includes_final_step() {
        let clock = SystemClock;
        let options = ProgressiveOptions {
            max_steps: 2,
            ..ProgressiveOptions::default()
        };
        let d = ProgressiveDecimator::new(options, &clock);
        let mesh = make_plane_grid(31);
        let (out, report) = d.decimate(&mesh, 20, &mut InMemoryCheckpoint).unwrap();
        assert!(report.steps.len() <= 2);
        assert!(out.face_count() <= mesh.face_count());
    }

    #[test]
    fn test_no_progress_returns_best_result() {
        let clock = SystemClock;
        let d = ProgressiveDecimator::new(ProgressiveOptions::default(), &clock);
        let mesh = make_scattered_triangles(30); // nothing can collapse
        let (out, report) = d.decimate(&mesh, 5, &mut InMemoryCheckpoint).unwrap();
        assert_eq!(report.stop, StopReason::NoProgress);
        assert_eq!(out.face_count(), mesh.face_count());
        assert_eq!(report.steps.len(), 1);
    }

    #[test]
    fn test_final_step_shortfall_is_reported() {
        let clock = SystemClock;
        let d = ProgressiveDecimator::new(ProgressiveOptions::default(), &clock);
        let mesh = make_scattered_triangles(12);
        let (out, report) = d.decimate(&mesh, 10, &mut InMemoryCheckpoint).unwrap();
        assert_eq!(out.face_count(), 12);
        assert_eq!(report.stop, StopReason::ShortOfTarget);
        assert!(report.early_exit().is_some());
    }

    #[test]
    fn test_flat_shaded_mesh_reaches_target() {
        let clock = SystemClock;
        let d = ProgressiveDecimator::new(ProgressiveOptions::default(), &clock);
        let mesh = make_flat_shaded(&make_curved_surface(31)); // 1800 faces, no shared vertices
        let (out, report) = d.decimate(&mesh, 200, &mut InMemoryCheckpoint).unwrap();
        assert_eq!(report.stop, StopReason::Completed);
        assert!(out.face_count() <= 220, "got {}", out.face_count());
        assert!(out.normals.is_some());
    }

    #[test]
    fn test_triangle_soup_is_not_a_stall() {
        let clock = SystemClock;
        let d = ProgressiveDecimator::new(ProgressiveOptions::default(), &clock);
        let mesh = make_triangle_soup(12); // 288 faces
        let (out, report) = d.decimate(&mesh, 60, &mut InMemoryCheckpoint).unwrap();
        assert_ne!(report.stop, StopReason::NoProgress);
        assert!(out.face_count() < mesh.face_count() / 2);
    }

    #[test]
    fn test_time_budget_stops_early() {
        // every clock read costs four virtual minutes
        let clock = ManualClock::with_tick(Duration::from_secs(240));
        let d = ProgressiveDecimator::new(ProgressiveOptions::default(), &clock);
        let mesh = make_plane_grid(31);
        let (out, report) = d.decimate(&mesh, 20, &mut InMemoryCheckpoint).unwrap();
        assert_eq!(report.stop, StopReason::TimeBudget);
        assert!(report.steps.len() <= 1);
        assert!(out.face_count() <= mesh.face_count());
        assert!(report.early_exit().is_some());
    }

    #[test]
    fn test_checkpoint_failure_keeps_last_good_mesh() {
        let clock = SystemClock;
        let d = ProgressiveDecimator::new(ProgressiveOptions::default(), &clock);
        let mesh = make_plane_grid(31);
        let (out, report) = d.decimate(&mesh, 100, &mut FailingCheckpoint).unwrap();
        assert!(matches!(report.stop, StopReason::StepFailed(_)));
        assert_eq!(out.face_count(), mesh.face_count());
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::TimeBudget.to_string(), "time budget exceeded");
        assert!(!StopReason::Completed.is_early_exit());
        assert!(StopReason::NoProgress.is_early_exit());
        assert!(StopReason::ShortOfTarget.is_early_exit());
    }
}
