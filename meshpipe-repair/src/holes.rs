//! Boundary loop detection and hole filling

use meshpipe_core::{edge_key, Error, Point3f, Result, TriangleMesh, Uv, Vector3f, WeldedTopology};
use std::collections::HashMap;

/// A face edge with no neighbor, oriented as in its face
#[derive(Debug, Clone, Copy)]
struct BoundaryEdge {
    from: usize,
    to: usize,
    face: usize,
    from_render: usize,
    to_render: usize,
}

/// One closed chain of boundary edges
#[derive(Debug, Clone)]
pub struct BoundaryLoop {
    edges: Vec<BoundaryEdge>,
    /// The chain passes through a vertex with several open fans
    pub ambiguous: bool,
}

impl BoundaryLoop {
    /// Number of edges around the hole
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Trace every boundary loop of the mesh
pub fn boundary_loops(mesh: &TriangleMesh) -> Vec<BoundaryLoop> {
    let topology = WeldedTopology::new(mesh);
    let mut edges = Vec::new();
    for (fi, face) in mesh.faces.iter().enumerate() {
        for j in 0..3 {
            let (ra, rb) = (face[j], face[(j + 1) % 3]);
            let (a, b) = (topology.welded[ra], topology.welded[rb]);
            if a == b {
                continue;
            }
            if topology.edge_faces.get(&edge_key(a, b)).map(Vec::len) == Some(1) {
                edges.push(BoundaryEdge {
                    from: a,
                    to: b,
                    face: fi,
                    from_render: ra,
                    to_render: rb,
                });
            }
        }
    }

    let mut outgoing: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, e) in edges.iter().enumerate() {
        outgoing.entry(e.from).or_default().push(i);
    }

    let mut used = vec![false; edges.len()];
    let mut loops = Vec::new();
    for start in 0..edges.len() {
        if used[start] {
            continue;
        }
        used[start] = true;
        let origin = edges[start].from;
        let mut chain = vec![edges[start]];
        let mut ambiguous = outgoing.get(&origin).map_or(false, |o| o.len() > 1);
        let mut current = edges[start].to;
        let mut closed = false;

        while chain.len() <= edges.len() {
            if current == origin {
                closed = true;
                break;
            }
            let candidates = outgoing.get(&current).map(Vec::as_slice).unwrap_or(&[]);
            if candidates.len() > 1 {
                ambiguous = true;
            }
            let Some(&next) = candidates.iter().find(|&&i| !used[i]) else {
                break;
            };
            used[next] = true;
            chain.push(edges[next]);
            current = edges[next].to;
        }

        if closed && chain.len() >= 3 {
            loops.push(BoundaryLoop {
                edges: chain,
                ambiguous,
            });
        }
    }
    loops
}

/// Close every hole bounded by at most `max_hole_size` edges.
///
/// Fails without touching the mesh when a hole within the bound cannot be
/// traced unambiguously. Returns the number of holes closed.
pub fn close_holes(mesh: &mut TriangleMesh, max_hole_size: usize) -> Result<usize> {
    let loops: Vec<BoundaryLoop> = boundary_loops(mesh)
        .into_iter()
        .filter(|l| l.len() <= max_hole_size)
        .collect();

    if let Some(bad) = loops.iter().find(|l| l.ambiguous) {
        return Err(Error::Algorithm(format!(
            "hole of {} edges touches a non-manifold boundary vertex",
            bad.len()
        )));
    }

    for hole in &loops {
        fill_loop(mesh, hole);
    }
    Ok(loops.len())
}

fn fill_loop(mesh: &mut TriangleMesh, hole: &BoundaryLoop) {
    let slot = |mesh: &TriangleMesh, face: usize| mesh.face_materials.as_ref().map(|s| s[face]);

    if let [e0, e1, e2] = hole.edges[..] {
        let material = slot(mesh, e0.face);
        push_face(mesh, [e0.from_render, e2.from_render, e1.from_render], material);
        return;
    }

    // fan around a new center vertex
    let n = hole.edges.len() as f32;
    let mut center = Vector3f::zeros();
    let mut uv: Uv = [0.0, 0.0];
    let mut normal = Vector3f::zeros();
    for e in &hole.edges {
        center += mesh.vertices[e.from_render].coords;
        if let Some(ref uvs) = mesh.uvs {
            uv[0] += uvs[e.from_render][0] / n;
            uv[1] += uvs[e.from_render][1] / n;
        }
        if let Some(ref normals) = mesh.normals {
            normal += normals[e.from_render];
        }
    }

    let c = mesh.add_vertex(Point3f::from(center / n));
    if let Some(ref mut uvs) = mesh.uvs {
        uvs.push(uv);
    }
    if let Some(ref mut normals) = mesh.normals {
        let len = normal.norm();
        normals.push(if len > f32::EPSILON {
            normal / len
        } else {
            Vector3f::new(0.0, 0.0, 1.0)
        });
    }

    for e in &hole.edges {
        let material = slot(mesh, e.face);
        push_face(mesh, [e.to_render, e.from_render, c], material);
    }
}

fn push_face(mesh: &mut TriangleMesh, face: [usize; 3], material: Option<usize>) {
    mesh.add_face(face);
    if let (Some(slots), Some(m)) = (mesh.face_materials.as_mut(), material) {
        slots.push(m);
    }
}
