//! Small meshes shared by the unit tests

use meshpipe_core::{Point3f, TriangleMesh, Uv};
use nalgebra::Point3;

pub fn make_single_triangle() -> TriangleMesh {
    TriangleMesh::from_vertices_and_faces(
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.5, 1.0, 0.0),
        ],
        vec![[0, 1, 2]],
    )
}

pub fn make_tetrahedron() -> TriangleMesh {
    // Consistently wound: each shared edge appears in opposite directions
    TriangleMesh::from_vertices_and_faces(
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.5, 1.0, 0.0),
            Point3::new(0.5, 0.5, 1.0),
        ],
        vec![[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]],
    )
}

fn grid_faces(size: usize) -> Vec<[usize; 3]> {
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
    faces
}

pub fn make_plane_grid(size: usize) -> TriangleMesh {
    let mut vertices = Vec::new();
    for y in 0..size {
        for x in 0..size {
            vertices.push(Point3::new(x as f32, y as f32, 0.0));
        }
    }
    TriangleMesh::from_vertices_and_faces(vertices, grid_faces(size))
}

pub fn make_curved_surface(size: usize) -> TriangleMesh {
    let mut vertices = Vec::new();
    for y in 0..size {
        for x in 0..size {
            let fx = x as f32 / (size - 1) as f32 * std::f32::consts::PI;
            let fy = y as f32 / (size - 1) as f32 * std::f32::consts::PI;
            vertices.push(Point3::new(
                x as f32,
                y as f32,
                (fx.sin() * fy.sin()) * 2.0,
            ));
        }
    }
    TriangleMesh::from_vertices_and_faces(vertices, grid_faces(size))
}

pub fn make_diamond() -> TriangleMesh {
    // Two tetrahedra glued at base, consistently wound (6 faces)
    TriangleMesh::from_vertices_and_faces(
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.5, 1.0, 0.0),
            Point3::new(0.5, 0.5, 1.0),
            Point3::new(0.5, 0.5, -1.0),
        ],
        vec![
            [0, 1, 3],
            [1, 2, 3],
            [0, 3, 2],
            [0, 4, 1],
            [1, 4, 2],
            [0, 2, 4],
        ],
    )
}

/// Two quads whose shared column is split into separate render vertices
pub fn make_uv_seam_strip() -> TriangleMesh {
    let p = |x: f32, y: f32| Point3f::new(x, y, 0.0);
    TriangleMesh::from_vertices_and_faces(
        vec![
            p(0.0, 0.0),
            p(1.0, 0.0),
            p(0.0, 1.0),
            p(1.0, 1.0),
            p(1.0, 0.0),
            p(2.0, 0.0),
            p(1.0, 1.0),
            p(2.0, 1.0),
        ],
        vec![[0, 2, 1], [1, 2, 3], [4, 6, 5], [5, 6, 7]],
    )
}

/// Grid where every triangle owns its vertices
pub fn make_triangle_soup(cells: usize) -> TriangleMesh {
    let mut mesh = TriangleMesh::new();
    for y in 0..cells {
        for x in 0..cells {
            let (fx, fy) = (x as f32, y as f32);
            let tl = Point3f::new(fx, fy, 0.0);
            let tr = Point3f::new(fx + 1.0, fy, 0.0);
            let bl = Point3f::new(fx, fy + 1.0, 0.0);
            let br = Point3f::new(fx + 1.0, fy + 1.0, 0.0);
            for tri in [[tl, bl, tr], [tr, bl, br]] {
                let a = mesh.add_vertex(tri[0]);
                let b = mesh.add_vertex(tri[1]);
                let c = mesh.add_vertex(tri[2]);
                mesh.add_face([a, b, c]);
            }
        }
    }
    mesh
}

/// Disjoint triangles, none touching another
pub fn make_scattered_triangles(count: usize) -> TriangleMesh {
    let mut mesh = TriangleMesh::new();
    for i in 0..count {
        let x = i as f32 * 3.0;
        let a = mesh.add_vertex(Point3f::new(x, 0.0, 0.0));
        let b = mesh.add_vertex(Point3f::new(x + 1.0, 0.0, 0.0));
        let c = mesh.add_vertex(Point3f::new(x, 1.0, 0.0));
        mesh.add_face([a, b, c]);
    }
    mesh
}

/// Every face gets its own three vertices carrying the face normal
pub fn make_flat_shaded(mesh: &TriangleMesh) -> TriangleMesh {
    let face_normals = mesh.calculate_face_normals();
    let mut out = TriangleMesh::new();
    let mut normals = Vec::with_capacity(mesh.face_count() * 3);
    for (face, n) in mesh.faces.iter().zip(face_normals) {
        let [a, b, c] = face.map(|v| out.add_vertex(mesh.vertices[v]));
        out.add_face([a, b, c]);
        normals.extend([n, n, n]);
    }
    out.set_normals(normals);
    out
}

/// Planar grid cut into two UV islands along column `seam`.
///
/// Left of the seam `u = x / 16`, right of it `u = x / 16 + 0.5`; `v = y / 8`
/// on both sides. The seam column is duplicated for the right island.
pub fn make_seamed_grid(size: usize, seam: usize) -> TriangleMesh {
    let mut vertices = Vec::new();
    let mut uvs: Vec<Uv> = Vec::new();
    for y in 0..size {
        for x in 0..size {
            let (fx, fy) = (x as f32, y as f32);
            vertices.push(Point3::new(fx, fy, 0.0));
            let offset = if x > seam { 0.5 } else { 0.0 };
            uvs.push([fx / 16.0 + offset, fy / 8.0]);
        }
    }
    let first_copy = vertices.len();
    for y in 0..size {
        let (fx, fy) = (seam as f32, y as f32);
        vertices.push(Point3::new(fx, fy, 0.0));
        uvs.push([fx / 16.0 + 0.5, fy / 8.0]);
    }

    let mut faces = Vec::new();
    for y in 0..(size - 1) {
        for x in 0..(size - 1) {
            let right_island = x >= seam;
            let at = |cx: usize, cy: usize| {
                if right_island && cx == seam {
                    first_copy + cy
                } else {
                    cy * size + cx
                }
            };
            let (tl, tr, bl, br) = (at(x, y), at(x + 1, y), at(x, y + 1), at(x + 1, y + 1));
            faces.push([tl, bl, tr]);
            faces.push([tr, bl, br]);
        }
    }

    let mut mesh = TriangleMesh::from_vertices_and_faces(vertices, faces);
    mesh.set_uvs(uvs);
    mesh
}
