//! Mesh quality statistics
//!
//! [`analyze_mesh`] computes a [`MeshQualityReport`]: counts, watertightness,
//! area, volume and extent, plus ordered issue and warning lists. Reports are
//! values; a new one is produced for every analysis.

use crate::mesh::TriangleMesh;
use crate::topology::WeldedTopology;
use crate::traits::Drawable;
use serde::{Deserialize, Serialize};

pub const ISSUE_NOT_WATERTIGHT: &str = "Not watertight (has holes)";
pub const ISSUE_NO_FACES: &str = "No faces";
pub const ISSUE_NO_VERTICES: &str = "No vertices";
pub const WARNING_SMALL_AREA: &str = "Very small surface area - model might be damaged";
pub const WARNING_EDGE_VARIATION: &str =
    "Extreme edge length variation - model might have artifacts";

/// Surface area below which a model is flagged as damaged
pub const SMALL_AREA_EPSILON: f64 = 0.001;
/// Minimum-to-maximum edge length ratio below which edges are flagged
pub const EDGE_RATIO_THRESHOLD: f64 = 0.001;

/// Statistics and findings for one mesh
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshQualityReport {
    pub vertices: usize,
    pub faces: usize,
    pub edges: usize,
    pub watertight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    pub surface_area: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<[[f32; 3]; 2]>,
    pub bbox_diagonal: f64,
    pub components: usize,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    /// Set alone when the mesh could not be loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MeshQualityReport {
    /// Report for a mesh that failed to load
    pub fn load_failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Any issue mentioning holes
    pub fn has_hole_issue(&self) -> bool {
        self.issues.iter().any(|i| i.to_lowercase().contains("hole"))
    }
}

/// Analyze a mesh that is already in memory
pub fn analyze_mesh(mesh: &TriangleMesh) -> MeshQualityReport {
    let topology = WeldedTopology::new(mesh);
    let watertight = topology.is_watertight();
    let surface_area = mesh.surface_area();
    let components = topology.component_count(mesh);

    let bounds = (!mesh.vertices.is_empty()).then(|| {
        let (min, max) = mesh.bounding_box();
        [[min.x, min.y, min.z], [max.x, max.y, max.z]]
    });

    let mut report = MeshQualityReport {
        vertices: topology.welded_count,
        faces: mesh.face_count(),
        edges: topology.edge_count(),
        watertight,
        volume: watertight.then(|| signed_volume(mesh).abs()),
        surface_area,
        bounds,
        bbox_diagonal: mesh.bbox_diagonal(),
        components,
        ..MeshQualityReport::default()
    };

    if !watertight {
        report.issues.push(ISSUE_NOT_WATERTIGHT.to_string());
    }
    if mesh.faces.is_empty() {
        report.issues.push(ISSUE_NO_FACES.to_string());
    }
    if mesh.vertices.is_empty() {
        report.issues.push(ISSUE_NO_VERTICES.to_string());
    }

    if components > 1 {
        report
            .warnings
            .push(format!("Model has {components} separate components"));
    }
    if surface_area < SMALL_AREA_EPSILON {
        report.warnings.push(WARNING_SMALL_AREA.to_string());
    }
    if let Some(ratio) = edge_length_ratio(mesh, &topology) {
        if ratio < EDGE_RATIO_THRESHOLD {
            report.warnings.push(WARNING_EDGE_VARIATION.to_string());
        }
    }

    report
}

/// Signed volume via the divergence theorem
fn signed_volume(mesh: &TriangleMesh) -> f64 {
    mesh.faces
        .iter()
        .map(|f| {
            let a = mesh.vertices[f[0]].coords.cast::<f64>();
            let b = mesh.vertices[f[1]].coords.cast::<f64>();
            let c = mesh.vertices[f[2]].coords.cast::<f64>();
            a.dot(&b.cross(&c)) / 6.0
        })
        .sum()
}

/// Shortest over longest unique edge
fn edge_length_ratio(mesh: &TriangleMesh, topology: &WeldedTopology) -> Option<f64> {
    // first render vertex for each welded id
    let mut position = vec![usize::MAX; topology.welded_count];
    for (render, &welded) in topology.welded.iter().enumerate() {
        if position[welded] == usize::MAX {
            position[welded] = render;
        }
    }

    let mut min = f64::INFINITY;
    let mut max = 0.0f64;
    for &(a, b) in topology.edge_faces.keys() {
        let len = (mesh.vertices[position[a]] - mesh.vertices[position[b]])
            .cast::<f64>()
            .norm();
        min = min.min(len);
        max = max.max(len);
    }
    (max > 0.0).then(|| min / max)
}
