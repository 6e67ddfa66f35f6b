//! Uniform Laplacian smoothing

use meshpipe_core::{Point3f, Result, TriangleMesh, Vector3f, WeldedTopology};
use std::collections::BTreeSet;

/// Move every position towards the average of its neighbors.
///
/// Works on welded positions so seams stay closed. Boundary vertices only
/// average their boundary neighbors, which keeps open borders from
/// collapsing inwards. Returns the number of iterations run.
pub fn laplacian_smooth(mesh: &mut TriangleMesh, iterations: usize) -> Result<usize> {
    if mesh.is_empty() || iterations == 0 {
        return Ok(0);
    }
    let topology = WeldedTopology::new(mesh);
    let n = topology.welded_count;

    let mut neighbors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    let mut boundary_neighbors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for (&(a, b), faces) in &topology.edge_faces {
        neighbors[a].insert(b);
        neighbors[b].insert(a);
        if faces.len() == 1 {
            boundary_neighbors[a].insert(b);
            boundary_neighbors[b].insert(a);
        }
    }

    let mut positions = vec![Point3f::origin(); n];
    for (render, &welded) in topology.welded.iter().enumerate() {
        positions[welded] = mesh.vertices[render];
    }

    for _ in 0..iterations {
        let previous = positions.clone();
        for v in 0..n {
            let ring = if boundary_neighbors[v].is_empty() {
                &neighbors[v]
            } else {
                &boundary_neighbors[v]
            };
            if ring.is_empty() {
                continue;
            }
            let sum: Vector3f = ring.iter().map(|&u| previous[u].coords).sum();
            positions[v] = Point3f::from(sum / ring.len() as f32);
        }
    }

    for (render, &welded) in topology.welded.iter().enumerate() {
        mesh.vertices[render] = positions[welded];
    }
    Ok(iterations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn make_bumped_grid() -> TriangleMesh {
        let size = 5;
        let mut vertices = Vec::new();
        for y in 0..size {
            for x in 0..size {
                let z = if x == 2 && y == 2 { 1.0 } else { 0.0 };
                vertices.push(Point3f::new(x as f32, y as f32, z));
            }
        }
        let mut faces = Vec::new();
        for y in 0..(size - 1) {
            for x in 0..(size - 1) {
                let tl = y * size + x;
                let tr = tl + 1;
                let bl = (y + 1) * size + x;
                let br = bl + 1;
                faces.push([tl, bl, tr]);
                faces.push([tr, bl, br]);
            }
        }
        TriangleMesh::from_vertices_and_faces(vertices, faces)
    }

    #[test]
    fn test_spike_is_flattened() {
        let mut mesh = make_bumped_grid();
        let ran = laplacian_smooth(&mut mesh, 3).unwrap();
        assert_eq!(ran, 3);
        assert!(mesh.vertices[12].z < 0.5);
        assert!(mesh.vertices.iter().all(|p| p.z.is_finite()));
    }

    #[test]
    fn test_boundary_stays_in_plane_of_border() {
        let mut mesh = make_bumped_grid();
        laplacian_smooth(&mut mesh, 3).unwrap();
        // border vertices only see border neighbors, all at z = 0
        for i in [0usize, 1, 2, 3, 4, 5, 9, 10, 14, 15, 19, 20, 21, 22, 23, 24] {
            assert_relative_eq!(mesh.vertices[i].z, 0.0);
        }
    }

    #[test]
    fn test_seam_copies_move_together() {
        let mut mesh = make_bumped_grid();
        // split the spike into a second render vertex used by one face
        mesh.vertices.push(mesh.vertices[12]);
        let face = mesh.faces.iter().position(|f| f.contains(&12)).unwrap();
        for i in mesh.faces[face].iter_mut() {
            if *i == 12 {
                *i = 25;
            }
        }
        laplacian_smooth(&mut mesh, 2).unwrap();
        assert_eq!(mesh.vertices[12], mesh.vertices[25]);
    }

    #[test]
    fn test_zero_iterations_is_noop() {
        let mut mesh = make_bumped_grid();
        let before = mesh.clone();
        assert_eq!(laplacian_smooth(&mut mesh, 0).unwrap(), 0);
        assert_eq!(mesh, before);
    }
}
