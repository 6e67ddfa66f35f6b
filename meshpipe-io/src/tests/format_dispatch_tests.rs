//! Reading and writing through the extension-dispatching entry points

use crate::{read_mesh, write_mesh, GlbReader, MaterialLibrary, MtlDocument, ObjReader};
use meshpipe_core::{Error, Point3f, TriangleMesh};
use tempfile::TempDir;

fn create_textured_pyramid() -> TriangleMesh {
    let mut mesh = TriangleMesh::from_vertices_and_faces(
        vec![
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(1.0, 0.0, 0.0),
            Point3f::new(1.0, 1.0, 0.0),
            Point3f::new(0.0, 1.0, 0.0),
            Point3f::new(0.5, 0.5, 1.0),
        ],
        vec![[0, 2, 1], [0, 3, 2], [0, 1, 4], [1, 2, 4], [2, 3, 4], [3, 0, 4]],
    );
    mesh.set_uvs(vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.5, 0.5]]);
    let normals = mesh.compute_vertex_normals();
    mesh.set_normals(normals);
    mesh.set_face_materials(
        vec!["base".into(), "sides".into()],
        vec![0, 0, 1, 1, 1, 1],
    );
    mesh
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;

    #[test]
    fn test_obj_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pyramid.obj");
        let mesh = create_textured_pyramid();
        write_mesh(&mesh, &path).unwrap();

        let loaded = read_mesh(&path).unwrap();
        assert_eq!(loaded.face_count(), 6);
        assert_eq!(loaded.vertex_count(), 5);
        assert!(loaded.has_uvs());
        assert_eq!(loaded.material_of(5), Some("sides"));
    }

    #[test]
    fn test_glb_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pyramid.glb");
        write_mesh(&create_textured_pyramid(), &path).unwrap();

        let scene = GlbReader::read_scene(&path).unwrap();
        assert_eq!(scene.mesh.face_count(), 6);
        assert_eq!(scene.materials.len(), 2);
        assert_eq!(scene.materials[0].name, "base");
    }

    #[test]
    fn test_unknown_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.fbx");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(read_mesh(&path), Err(Error::UnsupportedFormat(_))));
        assert!(matches!(
            write_mesh(&create_textured_pyramid(), dir.path().join("out.stl")),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(ObjReader::read_document(dir.path().join("absent.obj")).is_err());
    }

    #[test]
    fn test_uppercase_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("PYRAMID.OBJ");
        write_mesh(&create_textured_pyramid(), &path).unwrap();
        assert_eq!(read_mesh(&path).unwrap().face_count(), 6);
    }

    #[test]
    fn test_mtl_file_read_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.mtl");
        std::fs::write(&path, "newmtl base\nKd 1 0 0\nmap_Kd base.png\n").unwrap();
        let mut doc = MtlDocument::read(&path).unwrap();
        doc.materials[0].push("map_Bump -bm 1.0 base_normal.png");
        doc.write(&path).unwrap();
        let again = MaterialLibrary::read(&path).unwrap();
        assert_eq!(again.texture_files(), vec!["base.png", "base_normal.png"]);
    }
}
