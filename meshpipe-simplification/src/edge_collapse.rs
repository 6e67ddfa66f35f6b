//! Edge collapse simplification
//!
//! Implements iterative edge collapse mesh simplification using a half-edge
//! data structure for efficient topology operations and quadric error metrics
//! (QEM) for error-driven edge prioritization.
//!
//! Render vertices that share a position are welded before the topology is
//! built, so UV and normal seams never split the surface into islands.
//! Texture coordinates and normals live on face corners (wedges) instead of
//! vertices. A collapse carries every surviving corner along with it and is
//! only accepted when each texture wedge around the edge has a matching
//! wedge on the other side, which keeps the two sides of a UV seam together.
//! Normals are blended where wedges match and left alone otherwise.

use crate::MeshSimplifier;
use nalgebra::{Matrix4, Vector4};
use priority_queue::PriorityQueue;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use meshpipe_core::{Error, Point3f, Result, TriangleMesh, Uv, Vector3f, WeldedTopology};

const INVALID: usize = usize::MAX;

fn uv_bits(uv: Uv) -> [u32; 2] {
    [uv[0].to_bits(), uv[1].to_bits()]
}

fn normal_bits(n: &Vector3f) -> [u32; 3] {
    [n.x.to_bits(), n.y.to_bits(), n.z.to_bits()]
}

fn lerp_uv(a: Uv, b: Uv, t: f32) -> Uv {
    [a[0] + (b[0] - a[0]) * t, a[1] + (b[1] - a[1]) * t]
}

fn blend_normal(a: &Vector3f, b: &Vector3f, t: f32) -> Vector3f {
    let n = (a * (1.0 - t) + b * t).normalize();
    if n.iter().all(|x| x.is_finite()) {
        n
    } else {
        *a
    }
}

/// Record `key -> value`; false when the key already maps elsewhere.
fn insert_wedge<K: PartialEq, V: PartialEq>(map: &mut Vec<(K, V)>, key: K, value: V) -> bool {
    match map.iter().find(|(k, _)| *k == key) {
        Some((_, existing)) => *existing == value,
        None => {
            map.push((key, value));
            true
        }
    }
}

fn lookup_wedge<K: PartialEq, V: Copy>(map: &[(K, V)], key: &K) -> Option<V> {
    map.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
}

// ============================================================
// Half-Edge Data Structure
// ============================================================

#[derive(Debug, Clone)]
struct HalfEdge {
    target: usize,
    twin: usize,
    next: usize,
    prev: usize,
    face: usize,
}

/// Half-edge mesh for topology-aware edge collapse operations.
struct HalfEdgeMesh {
    half_edges: Vec<HalfEdge>,
    /// One outgoing half-edge per vertex (INVALID if removed)
    vertex_edge: Vec<usize>,
    /// One half-edge per face (INVALID if removed)
    face_edge: Vec<usize>,
    active_face_count: usize,
    /// Welded positions
    positions: Vec<Point3f>,
    /// Normal of the corner at each half-edge's target
    corner_normals: Option<Vec<Vector3f>>,
    /// Texture coordinate of the corner at each half-edge's target
    corner_uvs: Option<Vec<Uv>>,
    face_materials: Option<Vec<usize>>,
    materials: Vec<String>,
    quadrics: Vec<Matrix4<f64>>,
    vertex_removed: Vec<bool>,
    /// Vertices that must keep their position
    locked: Vec<bool>,
}

/// A chosen collapse: `remove` merges into `keep` at `position`
#[derive(Debug, Clone)]
struct CollapsePlan {
    keep: usize,
    remove: usize,
    position: Point3f,
    cost: f64,
    /// New texture coordinates of surviving corners, by half-edge
    uv_updates: Vec<(usize, Uv)>,
    normal_updates: Vec<(usize, Vector3f)>,
}

impl HalfEdgeMesh {
    fn from_triangle_mesh(mesh: &TriangleMesh, boundary_weight: f64) -> Self {
        // Weld by position; ids follow first appearance
        let topology = WeldedTopology::new(mesh);
        let welded_of = &topology.welded;
        let mut positions = vec![Point3f::origin(); topology.welded_count];
        for (render, &id) in welded_of.iter().enumerate().rev() {
            positions[id] = mesh.vertices[render];
        }

        let nv = positions.len();
        let mut half_edges = Vec::with_capacity(mesh.faces.len() * 3);
        let mut vertex_edge = vec![INVALID; nv];
        let mut face_edge = Vec::with_capacity(mesh.faces.len());
        let mut corner_normals = mesh.normals.as_ref().map(|_| Vec::with_capacity(mesh.faces.len() * 3));
        let mut corner_uvs = mesh.uvs.as_ref().map(|_| Vec::with_capacity(mesh.faces.len() * 3));
        let mut face_materials = mesh.face_materials.as_ref().map(|_| Vec::with_capacity(mesh.faces.len()));

        for (source_face, face) in mesh.faces.iter().enumerate() {
            let welded = face.map(|v| welded_of[v]);
            if welded[0] == welded[1] || welded[1] == welded[2] || welded[2] == welded[0] {
                continue;
            }
            let fi = face_edge.len();
            let base = fi * 3;
            for j in 0..3usize {
                let corner = face[(j + 1) % 3];
                half_edges.push(HalfEdge {
                    target: welded[(j + 1) % 3],
                    twin: INVALID,
                    next: base + (j + 1) % 3,
                    prev: base + (j + 2) % 3,
                    face: fi,
                });
                if vertex_edge[welded[j]] == INVALID {
                    vertex_edge[welded[j]] = base + j;
                }
                if let (Some(out), Some(normals)) = (corner_normals.as_mut(), mesh.normals.as_ref()) {
                    out.push(normals[corner]);
                }
                if let (Some(out), Some(uvs)) = (corner_uvs.as_mut(), mesh.uvs.as_ref()) {
                    out.push(uvs[corner]);
                }
            }
            face_edge.push(base);
            if let (Some(out), Some(slots)) = (face_materials.as_mut(), mesh.face_materials.as_ref()) {
                out.push(slots[source_face]);
            }
        }
        let nf = face_edge.len();

        // Build twin pointers; an edge used more than twice in one direction keeps no twin
        let mut edge_map: HashMap<(usize, usize), usize> = HashMap::with_capacity(nf * 3);
        for (he_idx, he) in half_edges.iter().enumerate() {
            let src = half_edges[he.prev].target;
            edge_map.insert((src, he.target), he_idx);
        }
        for he_idx in 0..half_edges.len() {
            if half_edges[he_idx].twin != INVALID {
                continue;
            }
            let src = half_edges[half_edges[he_idx].prev].target;
            let tgt = half_edges[he_idx].target;
            if let Some(&twin_idx) = edge_map.get(&(tgt, src)) {
                if half_edges[twin_idx].twin == INVALID && edge_map.get(&(src, tgt)) == Some(&he_idx) {
                    half_edges[he_idx].twin = twin_idx;
                    half_edges[twin_idx].twin = he_idx;
                }
            }
        }

        let mut hem = HalfEdgeMesh {
            half_edges,
            vertex_edge,
            face_edge,
            active_face_count: nf,
            positions,
            corner_normals,
            corner_uvs,
            face_materials,
            materials: mesh.materials.clone(),
            quadrics: vec![Matrix4::zeros(); nv],
            vertex_removed: vec![false; nv],
            locked: vec![false; nv],
        };
        hem.lock_non_manifold();
        hem.initialize_quadrics(boundary_weight);
        hem
    }

    /// Lock vertices whose faces form more than one fan; a collapse only
    /// sees one fan and would strand the others.
    fn lock_non_manifold(&mut self) {
        let mut out_degree = vec![0usize; self.positions.len()];
        for he in 0..self.half_edges.len() {
            out_degree[self.source(he)] += 1;
        }
        for v in 0..self.positions.len() {
            if out_degree[v] > 0 && self.outgoing_half_edges(v).len() != out_degree[v] {
                self.locked[v] = true;
            }
        }
    }

    #[inline]
    fn source(&self, he: usize) -> usize {
        self.half_edges[self.half_edges[he].prev].target
    }

    fn compute_plane(v0: &Point3f, v1: &Point3f, v2: &Point3f) -> Vector4<f64> {
        let e1 = v1 - v0;
        let e2 = v2 - v0;
        let n = e1.cross(&e2).normalize();
        if !n.iter().all(|x| x.is_finite()) {
            return Vector4::new(0.0, 0.0, 1.0, 0.0);
        }
        let d = -n.dot(&v0.coords);
        Vector4::new(n.x as f64, n.y as f64, n.z as f64, d as f64)
    }

    fn plane_to_quadric(p: &Vector4<f64>) -> Matrix4<f64> {
        let (a, b, c, d) = (p[0], p[1], p[2], p[3]);
        Matrix4::new(
            a * a, a * b, a * c, a * d,
            a * b, b * b, b * c, b * d,
            a * c, b * c, c * c, c * d,
            a * d, b * d, c * d, d * d,
        )
    }

    fn face_vertices(&self, fi: usize) -> Option<[usize; 3]> {
        let he0 = self.face_edge[fi];
        if he0 == INVALID {
            return None;
        }
        let he1 = self.half_edges[he0].next;
        Some([self.source(he0), self.half_edges[he0].target, self.half_edges[he1].target])
    }

    fn initialize_quadrics(&mut self, boundary_weight: f64) {
        for fi in 0..self.face_edge.len() {
            let Some([v0, v1, v2]) = self.face_vertices(fi) else {
                continue;
            };
            let plane =
                Self::compute_plane(&self.positions[v0], &self.positions[v1], &self.positions[v2]);
            let q = Self::plane_to_quadric(&plane);
            self.quadrics[v0] += q;
            self.quadrics[v1] += q;
            self.quadrics[v2] += q;
        }

        if boundary_weight <= 0.0 {
            return;
        }
        // Constraint planes through open edges, perpendicular to their face
        for he in 0..self.half_edges.len() {
            if self.half_edges[he].twin != INVALID {
                continue;
            }
            let fi = self.half_edges[he].face;
            let Some([a, b, c]) = self.face_vertices(fi) else {
                continue;
            };
            let s = self.source(he);
            let t = self.half_edges[he].target;
            let face_plane =
                Self::compute_plane(&self.positions[a], &self.positions[b], &self.positions[c]);
            let normal = Vector3f::new(face_plane[0] as f32, face_plane[1] as f32, face_plane[2] as f32);
            let edge = self.positions[t] - self.positions[s];
            let m = edge.cross(&normal);
            let len = m.norm();
            if !(len > f32::EPSILON) {
                continue;
            }
            let m = m / len;
            let d = -m.dot(&self.positions[s].coords);
            let plane = Vector4::new(m.x as f64, m.y as f64, m.z as f64, d as f64);
            let weight = boundary_weight * (edge.norm_squared() as f64);
            let q = Self::plane_to_quadric(&plane) * weight;
            self.quadrics[s] += q;
            self.quadrics[t] += q;
        }
    }

    /// Get all outgoing half-edges from a vertex (handles boundary vertices).
    fn outgoing_half_edges(&self, v: usize) -> Vec<usize> {
        let start = self.vertex_edge[v];
        if start == INVALID {
            return vec![];
        }

        let limit = self.half_edges.len();
        let mut result = Vec::new();
        let mut current = start;

        // Rotate counterclockwise: current.prev.twin
        loop {
            result.push(current);
            let prev = self.half_edges[current].prev;
            let twin = self.half_edges[prev].twin;
            if twin == INVALID || result.len() > limit {
                break;
            }
            current = twin;
            if current == start {
                return result;
            }
        }

        // Boundary: also rotate clockwise from start via twin.next
        let twin_of_start = self.half_edges[start].twin;
        if twin_of_start != INVALID {
            let mut current = self.half_edges[twin_of_start].next;
            loop {
                if current == start || result.len() > limit {
                    break;
                }
                result.push(current);
                let twin = self.half_edges[current].twin;
                if twin == INVALID {
                    break;
                }
                current = self.half_edges[twin].next;
            }
        }

        result
    }

    fn neighbors(&self, v: usize) -> HashSet<usize> {
        let mut set = HashSet::new();
        for he in self.outgoing_half_edges(v) {
            set.insert(self.half_edges[he].target);
            // the previous vertex closes the fan on boundaries
            set.insert(self.source(self.half_edges[he].prev));
        }
        set.remove(&v);
        set
    }

    fn is_boundary_vertex(&self, v: usize) -> bool {
        for &he in &self.outgoing_half_edges(v) {
            if self.half_edges[he].twin == INVALID
                || self.half_edges[self.half_edges[he].prev].twin == INVALID
            {
                return true;
            }
        }
        false
    }

    fn find_half_edge(&self, from: usize, to: usize) -> Option<usize> {
        for &he in &self.outgoing_half_edges(from) {
            if self.half_edges[he].target == to {
                return Some(he);
            }
        }
        None
    }

    /// A half-edge between the two vertices in either direction
    fn find_edge(&self, a: usize, b: usize) -> Option<usize> {
        self.find_half_edge(a, b).or_else(|| self.find_half_edge(b, a))
    }

    /// The live half-edges of the faces an (a, b) collapse removes
    fn collapse_sides(&self, a: usize, b: usize) -> Option<Vec<usize>> {
        let h = self.find_edge(a, b)?;
        let mut sides = vec![h];
        let twin = self.half_edges[h].twin;
        if twin != INVALID && self.half_edges[twin].face != INVALID {
            sides.push(twin);
        }
        Some(sides)
    }

    /// Check the link condition: common neighbors must equal exactly the
    /// face apices opposite the edge (2 for interior, 1 for boundary).
    fn check_link_condition(&self, v1: usize, v2: usize) -> bool {
        let h = match self.find_edge(v1, v2) {
            Some(h) => h,
            None => return false,
        };
        let is_boundary_edge = self.half_edges[h].twin == INVALID;
        if !is_boundary_edge && self.is_boundary_vertex(v1) && self.is_boundary_vertex(v2) {
            // would pinch the surface into a non-manifold vertex
            return false;
        }

        // a face with no neighbour across its other two edges would vanish entirely
        if let Some(sides) = self.collapse_sides(v1, v2) {
            for e in sides {
                let next = self.half_edges[e].next;
                let prev = self.half_edges[e].prev;
                if self.half_edges[next].twin == INVALID && self.half_edges[prev].twin == INVALID {
                    return false;
                }
            }
        }

        let n1 = self.neighbors(v1);
        let n2 = self.neighbors(v2);
        let common_count = n1.intersection(&n2).count();
        let expected = if is_boundary_edge { 1 } else { 2 };
        common_count == expected
    }

    fn quadric_cost(q: &Matrix4<f64>, p: &Point3f) -> f64 {
        let vh = Vector4::new(p.x as f64, p.y as f64, p.z as f64, 1.0);
        (vh.transpose() * q * vh)[0].max(0.0)
    }

    fn compute_collapse_cost(&self, v1: usize, v2: usize) -> (Point3f, f64) {
        let q = self.quadrics[v1] + self.quadrics[v2];
        let q3 = q.fixed_view::<3, 3>(0, 0);
        let q1 = q.fixed_view::<3, 1>(0, 3);

        let midpoint = Point3f::from((self.positions[v1].coords + self.positions[v2].coords) * 0.5);
        let optimal = match q3.try_inverse() {
            Some(inv) => {
                let p = -inv * q1;
                let candidate = Point3f::new(p[0] as f32, p[1] as f32, p[2] as f32);
                // far-away solutions come from near-singular systems
                let span = (self.positions[v1] - self.positions[v2]).norm();
                if candidate.iter().all(|x| x.is_finite())
                    && (candidate - midpoint).norm() <= span * 2.0
                {
                    candidate
                } else {
                    midpoint
                }
            }
            None => midpoint,
        };

        (optimal, Self::quadric_cost(&q, &optimal))
    }

    /// Interpolation parameter of `position` along keep -> remove
    fn interpolation(&self, keep: usize, remove: usize, position: &Point3f) -> f32 {
        let pk = self.positions[keep];
        let pr = self.positions[remove];
        let span = (pr - pk).norm_squared();
        if span > 0.0 {
            ((position - pk).dot(&(pr - pk)) / span).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Corners of `v` on live faces outside `collapsed`, as half-edges
    /// ending at `v`
    fn surviving_corners(&self, v: usize, collapsed: &[usize]) -> Vec<usize> {
        self.outgoing_half_edges(v)
            .into_iter()
            .filter(|&he| {
                let face = self.half_edges[he].face;
                face != INVALID && !collapsed.contains(&face)
            })
            .map(|he| self.half_edges[he].prev)
            .collect()
    }

    /// Work out the corner attributes after merging `remove` into `keep`.
    ///
    /// Each face removed by the collapse pairs a keep wedge with a remove
    /// wedge. Every surviving remove corner must find its wedge among those
    /// pairs, and so must every surviving keep corner unless `keep` stays
    /// put. Returns `None` when a texture wedge has no partner.
    fn carry_attributes(
        &self,
        keep: usize,
        remove: usize,
        position: &Point3f,
        sides: &[usize],
    ) -> Option<(Vec<(usize, Uv)>, Vec<(usize, Vector3f)>)> {
        let t = self.interpolation(keep, remove, position);
        let collapsed: Vec<usize> = sides.iter().map(|&e| self.half_edges[e].face).collect();
        let pairs: Vec<(usize, usize)> = sides
            .iter()
            .map(|&e| {
                let prev = self.half_edges[e].prev;
                if self.half_edges[e].target == keep {
                    (e, prev)
                } else {
                    (prev, e)
                }
            })
            .collect();
        let keep_corners = self.surviving_corners(keep, &collapsed);
        let remove_corners = self.surviving_corners(remove, &collapsed);

        let mut uv_updates = Vec::new();
        if let Some(uvs) = &self.corner_uvs {
            let mut keep_map = Vec::new();
            let mut remove_map = Vec::new();
            for &(k, r) in &pairs {
                let merged = lerp_uv(uvs[k], uvs[r], t);
                if !insert_wedge(&mut keep_map, uv_bits(uvs[k]), merged)
                    || !insert_wedge(&mut remove_map, uv_bits(uvs[r]), merged)
                {
                    return None;
                }
            }
            for &c in &keep_corners {
                match lookup_wedge(&keep_map, &uv_bits(uvs[c])) {
                    Some(uv) => uv_updates.push((c, uv)),
                    None if t == 0.0 => {}
                    None => return None,
                }
            }
            for &c in &remove_corners {
                uv_updates.push((c, lookup_wedge(&remove_map, &uv_bits(uvs[c]))?));
            }
        }

        let mut normal_updates = Vec::new();
        if let Some(normals) = &self.corner_normals {
            let mut keep_map = Vec::new();
            let mut remove_map = Vec::new();
            for &(k, r) in &pairs {
                let merged = blend_normal(&normals[k], &normals[r], t);
                // first wedge wins; hard edges keep their own normals
                insert_wedge(&mut keep_map, normal_bits(&normals[k]), merged);
                insert_wedge(&mut remove_map, normal_bits(&normals[r]), merged);
            }
            for (corners, map) in [(&keep_corners, &keep_map), (&remove_corners, &remove_map)] {
                for &c in corners {
                    if let Some(n) = lookup_wedge(map, &normal_bits(&normals[c])) {
                        normal_updates.push((c, n));
                    }
                }
            }
        }

        Some((uv_updates, normal_updates))
    }

    /// Decide which vertex survives and where it goes.
    ///
    /// Candidates are the quadric optimum and both endpoints, cheapest
    /// first; the first one that neither flips a face nor tears a texture
    /// seam wins. Locked vertices never move.
    fn plan_collapse(&self, a: usize, b: usize) -> Option<CollapsePlan> {
        let sides = self.collapse_sides(a, b)?;
        let q = self.quadrics[a] + self.quadrics[b];

        let mut candidates: Vec<(usize, usize, Point3f, f64)> = Vec::with_capacity(3);
        if !self.locked[a] && !self.locked[b] {
            let (p, cost) = self.compute_collapse_cost(a, b);
            candidates.push((a, b, p, cost));
        }
        if !self.locked[b] {
            let p = self.positions[a];
            candidates.push((a, b, p, Self::quadric_cost(&q, &p)));
        }
        if !self.locked[a] {
            let p = self.positions[b];
            candidates.push((b, a, p, Self::quadric_cost(&q, &p)));
        }
        candidates.sort_by(|x, y| x.3.total_cmp(&y.3));

        candidates.into_iter().find_map(|(keep, remove, position, cost)| {
            if self.causes_flip(keep, remove, &position) {
                return None;
            }
            let (uv_updates, normal_updates) = self.carry_attributes(keep, remove, &position, &sides)?;
            Some(CollapsePlan {
                keep,
                remove,
                position,
                cost,
                uv_updates,
                normal_updates,
            })
        })
    }

    /// Whether moving `keep` and `remove` to `new_pos` turns any surviving face over
    fn causes_flip(&self, keep: usize, remove: usize, new_pos: &Point3f) -> bool {
        let pos = |x: usize| {
            if x == keep || x == remove {
                *new_pos
            } else {
                self.positions[x]
            }
        };
        for v in [keep, remove] {
            for he in self.outgoing_half_edges(v) {
                let a = self.half_edges[he].target;
                let b = self.half_edges[self.half_edges[he].next].target;
                if a == keep || a == remove || b == keep || b == remove {
                    continue;
                }
                let old_n = (self.positions[a] - self.positions[v])
                    .cross(&(self.positions[b] - self.positions[v]));
                let new_n = (pos(a) - pos(v)).cross(&(pos(b) - pos(v)));
                if old_n.dot(&new_n) <= 0.0 {
                    return true;
                }
            }
        }
        false
    }

    fn first_live_outgoing(&self, v: usize, candidates: &[usize]) -> usize {
        for &he in candidates {
            if he != INVALID && self.half_edges[he].face != INVALID && self.source(he) == v {
                return he;
            }
        }
        self.find_valid_outgoing(v)
    }

    /// Find any valid outgoing half-edge from a vertex (linear scan fallback).
    fn find_valid_outgoing(&self, v: usize) -> usize {
        for (i, he) in self.half_edges.iter().enumerate() {
            if he.face != INVALID && self.source(i) == v {
                return i;
            }
        }
        INVALID
    }

    /// Remove the face owning `e` and stitch the twins of its other two edges.
    /// Returns the apex opposite `e`.
    fn remove_face_of(&mut self, e: usize) -> usize {
        let next = self.half_edges[e].next;
        let prev = self.half_edges[e].prev;
        let apex = self.half_edges[next].target;
        let next_twin = self.half_edges[next].twin;
        let prev_twin = self.half_edges[prev].twin;

        if next_twin != INVALID {
            self.half_edges[next_twin].twin = prev_twin;
        }
        if prev_twin != INVALID {
            self.half_edges[prev_twin].twin = next_twin;
        }

        let face = self.half_edges[e].face;
        self.half_edges[e].face = INVALID;
        self.half_edges[next].face = INVALID;
        self.half_edges[prev].face = INVALID;
        self.face_edge[face] = INVALID;
        self.active_face_count -= 1;
        apex
    }

    /// Apply a collapse plan, merging `remove` into `keep`.
    /// Returns true on success.
    fn collapse_edge(&mut self, plan: &CollapsePlan) -> bool {
        let (keep, remove) = (plan.keep, plan.remove);
        let Some(sides) = self.collapse_sides(keep, remove) else {
            return false;
        };

        // Corners first; half-edge indices survive the rewiring below
        if let Some(uvs) = self.corner_uvs.as_mut() {
            for &(corner, uv) in &plan.uv_updates {
                uvs[corner] = uv;
            }
        }
        if let Some(normals) = self.corner_normals.as_mut() {
            for &(corner, n) in &plan.normal_updates {
                normals[corner] = n;
            }
        }

        // Collect fans BEFORE any modifications
        let remove_outgoing = self.outgoing_half_edges(remove);
        let keep_outgoing = self.outgoing_half_edges(keep);
        let mut stitched = Vec::new();
        for &e in &sides {
            stitched.push(self.half_edges[self.half_edges[e].next].twin);
            stitched.push(self.half_edges[self.half_edges[e].prev].twin);
        }

        let apices: Vec<usize> = sides.iter().map(|&e| self.remove_face_of(e)).collect();

        // Redirect all `remove` references to `keep`
        for &he in &remove_outgoing {
            let prev = self.half_edges[he].prev;
            self.half_edges[prev].target = keep;

            let twin = self.half_edges[he].twin;
            if twin != INVALID && self.half_edges[twin].face != INVALID {
                self.half_edges[twin].target = keep;
            }
        }

        let mut candidates = stitched;
        candidates.extend(&remove_outgoing);
        candidates.extend(&keep_outgoing);

        for v in std::iter::once(keep).chain(apices) {
            let current = self.vertex_edge[v];
            if current == INVALID
                || self.half_edges[current].face == INVALID
                || self.source(current) != v
            {
                self.vertex_edge[v] = self.first_live_outgoing(v, &candidates);
            }
        }

        // Mark `remove` as removed
        self.vertex_edge[remove] = INVALID;
        self.vertex_removed[remove] = true;

        let removed_quadric = self.quadrics[remove];
        self.positions[keep] = plan.position;
        self.quadrics[keep] += removed_quadric;

        true
    }

    /// Split welded vertices back into render vertices, one per distinct
    /// (position, texture coordinate, normal) corner.
    fn to_triangle_mesh(&self) -> TriangleMesh {
        let mut render_index: HashMap<(usize, [u32; 2], [u32; 3]), usize> = HashMap::new();
        let mut new_positions = Vec::new();
        let mut new_normals = Vec::new();
        let mut new_uvs = Vec::new();
        let mut new_faces = Vec::new();
        let mut new_face_materials = Vec::new();

        for fi in 0..self.face_edge.len() {
            let he0 = self.face_edge[fi];
            if he0 == INVALID {
                continue;
            }
            let he1 = self.half_edges[he0].next;
            let he2 = self.half_edges[he1].next;
            let corners = [he2, he0, he1];
            let [v0, v1, v2] = corners.map(|c| self.half_edges[c].target);
            if v0 == v1 || v1 == v2 || v2 == v0 {
                continue;
            }

            let mut face = [0usize; 3];
            for (slot, &c) in corners.iter().enumerate() {
                let v = self.half_edges[c].target;
                let uv = self.corner_uvs.as_ref().map(|uvs| uvs[c]);
                let normal = self.corner_normals.as_ref().map(|normals| normals[c]);
                let key = (
                    v,
                    uv.map_or([0; 2], uv_bits),
                    normal.as_ref().map_or([0; 3], normal_bits),
                );
                face[slot] = *render_index.entry(key).or_insert_with(|| {
                    new_positions.push(self.positions[v]);
                    if let Some(uv) = uv {
                        new_uvs.push(uv);
                    }
                    if let Some(n) = normal {
                        new_normals.push(n);
                    }
                    new_positions.len() - 1
                });
            }
            new_faces.push(face);
            if let Some(ref slots) = self.face_materials {
                new_face_materials.push(slots[fi]);
            }
        }

        let mut mesh = TriangleMesh::from_vertices_and_faces(new_positions, new_faces);
        if self.corner_normals.is_some() {
            mesh.set_normals(new_normals);
        }
        if self.corner_uvs.is_some() {
            mesh.set_uvs(new_uvs);
        }
        if self.face_materials.is_some() {
            mesh.set_face_materials(self.materials.clone(), new_face_materials);
        }
        mesh
    }
}

// ============================================================
// Edge Cost for Priority Queue
// ============================================================

#[derive(Debug, Clone)]
struct EdgeCost {
    keep: usize,
    remove: usize,
    cost: f64,
}

impl PartialEq for EdgeCost {
    fn eq(&self, other: &Self) -> bool {
        self.cost.total_cmp(&other.cost) == Ordering::Equal
    }
}
impl Eq for EdgeCost {}

impl PartialOrd for EdgeCost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EdgeCost {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: smallest cost first
        other.cost.total_cmp(&self.cost)
    }
}

// ============================================================
// Edge Collapse Simplifier
// ============================================================

/// Edge collapse mesh simplifier using half-edge data structure and QEM.
///
/// This simplifier builds a half-edge mesh for efficient local topology
/// queries (neighbor iteration, boundary detection, link condition checks)
/// and uses quadric error metrics to prioritize edge collapses.
///
/// With `preserve_boundary` set, open-boundary vertices are locked. Otherwise
/// open edges contribute perpendicular constraint quadrics scaled by
/// `boundary_weight`, so boundaries may move but resist it. Seams between
/// render vertices are not boundaries: they are welded first.
#[derive(Debug, Clone)]
pub struct EdgeCollapseSimplifier {
    /// Stop when the minimum collapse cost exceeds this threshold
    pub error_threshold: Option<f64>,
    /// Lock mesh boundary vertices
    pub preserve_boundary: bool,
    /// Weight of boundary constraint quadrics
    pub boundary_weight: f64,
}

impl Default for EdgeCollapseSimplifier {
    fn default() -> Self {
        Self {
            error_threshold: None,
            preserve_boundary: true,
            boundary_weight: 100.0,
        }
    }
}

impl EdgeCollapseSimplifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(
        error_threshold: Option<f64>,
        preserve_boundary: bool,
        boundary_weight: f64,
    ) -> Self {
        Self {
            error_threshold,
            preserve_boundary,
            boundary_weight,
        }
    }

    /// Weighted (not locked) boundaries
    pub fn weighted(boundary_weight: f64) -> Self {
        Self::with_params(None, false, boundary_weight)
    }

    fn prepare(&self, mesh: &TriangleMesh) -> HalfEdgeMesh {
        let mut hem = HalfEdgeMesh::from_triangle_mesh(mesh, self.boundary_weight);
        if self.preserve_boundary {
            for v in 0..hem.positions.len() {
                if !hem.locked[v] && hem.is_boundary_vertex(v) {
                    hem.locked[v] = true;
                }
            }
        }
        hem
    }

    /// Build the priority queue of edge collapse candidates.
    fn build_queue(&self, hem: &HalfEdgeMesh, id_offset: usize) -> PriorityQueue<usize, EdgeCost> {
        let mut queue = PriorityQueue::new();
        let mut seen_edges: HashSet<(usize, usize)> = HashSet::new();
        let mut edge_id = id_offset;

        for vi in 0..hem.positions.len() {
            if hem.vertex_removed[vi] || hem.vertex_edge[vi] == INVALID {
                continue;
            }
            for &he in &hem.outgoing_half_edges(vi) {
                if hem.half_edges[he].face == INVALID {
                    continue;
                }
                let target = hem.half_edges[he].target;
                let key = (vi.min(target), vi.max(target));
                if !seen_edges.insert(key) {
                    continue;
                }

                let Some(plan) = hem.plan_collapse(vi, target) else {
                    continue;
                };

                queue.push(
                    edge_id,
                    EdgeCost {
                        keep: plan.keep,
                        remove: plan.remove,
                        cost: plan.cost,
                    },
                );
                edge_id += 1;
            }
        }

        queue
    }

    /// Collapse edges until at most `target_faces` faces remain or nothing
    /// more can be collapsed.
    pub fn simplify_to_count(&self, mesh: &TriangleMesh, target_faces: usize) -> Result<TriangleMesh> {
        if mesh.is_empty() {
            return Err(Error::InvalidData("Mesh is empty".to_string()));
        }
        if mesh.face_count() <= target_faces {
            return Ok(mesh.clone());
        }

        let mut hem = self.prepare(mesh);
        let mut queue = self.build_queue(&hem, 0);
        let mut collapse_count = 0usize;
        let mut collapses_since_rebuild = 0usize;

        while hem.active_face_count > target_faces {
            let (_, edge_cost) = match queue.pop() {
                Some(item) => item,
                None => {
                    // stale queue drained; retry once with fresh candidates
                    if collapses_since_rebuild == 0 {
                        break;
                    }
                    queue = self.build_queue(&hem, (collapse_count + 1) * 1000);
                    collapses_since_rebuild = 0;
                    continue;
                }
            };

            // Check error threshold
            if let Some(threshold) = self.error_threshold {
                if edge_cost.cost > threshold {
                    break;
                }
            }

            let (a, b) = (edge_cost.keep, edge_cost.remove);

            // Validate: both vertices still alive and still neighbors
            if hem.vertex_removed[a]
                || hem.vertex_removed[b]
                || hem.vertex_edge[a] == INVALID
                || hem.vertex_edge[b] == INVALID
            {
                continue;
            }

            if hem.find_edge(a, b).is_none() {
                continue;
            }

            // Check link condition to avoid non-manifold topology
            if !hem.check_link_condition(a, b) {
                continue;
            }

            // Recompute the plan (quadrics and wedges may have changed since queuing)
            let Some(plan) = hem.plan_collapse(a, b) else {
                continue;
            };

            if hem.collapse_edge(&plan) {
                collapse_count += 1;
                collapses_since_rebuild += 1;

                // Periodically rebuild queue for accuracy
                if collapse_count % 100 == 0 {
                    queue = self.build_queue(&hem, collapse_count * 1000);
                    collapses_since_rebuild = 0;
                }
            }
        }

        Ok(hem.to_triangle_mesh())
    }
}

impl MeshSimplifier for EdgeCollapseSimplifier {
    fn simplify(&self, mesh: &TriangleMesh, reduction_ratio: f32) -> Result<TriangleMesh> {
        if mesh.is_empty() {
            return Err(Error::InvalidData("Mesh is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&reduction_ratio) {
            return Err(Error::InvalidData(
                "Reduction ratio must be between 0.0 and 1.0".to_string(),
            ));
        }
        if reduction_ratio == 0.0 {
            return Ok(mesh.clone());
        }

        let target_faces = ((1.0 - reduction_ratio) * mesh.faces.len() as f32) as usize;
        self.simplify_to_count(mesh, target_faces)
    }

    fn simplify_to(&self, mesh: &TriangleMesh, target_faces: usize) -> Result<TriangleMesh> {
        self.simplify_to_count(mesh, target_faces)
    }
}
