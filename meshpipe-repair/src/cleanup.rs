//! Duplicate, degenerate and non-manifold element removal

use meshpipe_core::{position_key, triangle_area, Result, TriangleMesh, WeldedTopology};
use std::collections::{HashMap, HashSet};

/// Faces with area at or below this are treated as null
pub const NULL_AREA_EPSILON: f64 = 1e-12;

/// Merge render vertices that agree on position and every attribute.
///
/// Seam vertices differ in UV or normal and are kept apart.
pub fn remove_duplicate_vertices(mesh: &mut TriangleMesh) -> Result<usize> {
    let mut first: HashMap<([u32; 3], [u32; 2], [u32; 3]), usize> =
        HashMap::with_capacity(mesh.vertices.len());
    let mut remap = Vec::with_capacity(mesh.vertices.len());

    for (i, p) in mesh.vertices.iter().enumerate() {
        let uv = mesh
            .uvs
            .as_ref()
            .map(|uvs| [uvs[i][0].to_bits(), uvs[i][1].to_bits()])
            .unwrap_or_default();
        let normal = mesh
            .normals
            .as_ref()
            .map(|n| [n[i].x.to_bits(), n[i].y.to_bits(), n[i].z.to_bits()])
            .unwrap_or_default();
        let id = *first.entry((position_key(p), uv, normal)).or_insert(i);
        remap.push(id);
    }

    let merged = mesh.vertices.len() - first.len();
    if merged == 0 {
        return Ok(0);
    }
    for face in &mut mesh.faces {
        for i in face.iter_mut() {
            *i = remap[*i];
        }
    }
    mesh.remove_unreferenced_vertices();
    Ok(merged)
}

/// Drop faces spanning the same three positions as an earlier face,
/// regardless of winding
pub fn remove_duplicate_faces(mesh: &mut TriangleMesh) -> Result<usize> {
    let topology = WeldedTopology::new(mesh);
    let mut seen = HashSet::with_capacity(mesh.faces.len());
    let keep: Vec<bool> = mesh
        .faces
        .iter()
        .map(|face| {
            let mut key = topology.welded_face(face);
            key.sort_unstable();
            seen.insert(key)
        })
        .collect();
    Ok(mesh.retain_faces(&keep))
}

/// Drop faces with a repeated corner or (near) zero area
pub fn remove_null_faces(mesh: &mut TriangleMesh) -> Result<usize> {
    let topology = WeldedTopology::new(mesh);
    let keep: Vec<bool> = mesh
        .faces
        .iter()
        .map(|face| {
            let [a, b, c] = topology.welded_face(face);
            if a == b || b == c || a == c {
                return false;
            }
            let area = triangle_area(
                &mesh.vertices[face[0]],
                &mesh.vertices[face[1]],
                &mesh.vertices[face[2]],
            );
            area > NULL_AREA_EPSILON
        })
        .collect();
    Ok(mesh.retain_faces(&keep))
}

/// Make every edge border at most two faces by dropping the smallest
/// faces around each over-shared edge
pub fn remove_non_manifold_edges(mesh: &mut TriangleMesh) -> Result<usize> {
    let topology = WeldedTopology::new(mesh);
    let area = |fi: usize| {
        let f = mesh.faces[fi];
        triangle_area(&mesh.vertices[f[0]], &mesh.vertices[f[1]], &mesh.vertices[f[2]])
    };

    let mut keep = vec![true; mesh.faces.len()];
    let mut edges: Vec<_> = topology.non_manifold_edges().collect();
    // deterministic order across runs
    edges.sort_by_key(|(edge, _)| **edge);

    for (_, faces) in edges {
        let mut alive: Vec<usize> = faces.iter().copied().filter(|&f| keep[f]).collect();
        if alive.len() <= 2 {
            continue;
        }
        alive.sort_by(|&x, &y| area(y).total_cmp(&area(x)).then(x.cmp(&y)));
        for &f in &alive[2..] {
            keep[f] = false;
        }
    }
    Ok(mesh.retain_faces(&keep))
}
