use std::collections::VecDeque;

use glam::{U16Vec3, Vec3, Vec3A, Vec3Swizzles as _};
use thiserror::Error;

use crate::{
    CompactHeightfield, LogLevel, RegionId,
    context::stage_log,
    math::{
        cross_xz, dir_offset, dir_offset_x, dir_offset_z, distance_squared_between_point_and_segment,
        distance_squared_between_point_and_segment_xz, next, prev,
    },
    poly_mesh::PolygonNavmesh,
};

const MAX_VERTS: usize = 127;
// Max tris for delaunay is 2n-2-k (n=num verts, k=num hull verts).
const MAX_TRIS: usize = 255;
const MAX_VERTS_PER_EDGE: usize = 32;

const RC_UNSET_HEIGHT: u16 = 0xffff;

/// Edge flag of a detail triangle edge that lies on the boundary of its polygon.
/// The flag of edge `i` of a triangle is stored at bits `2 * i` of [`DetailNavmesh::triangle_flags`].
pub const DETAIL_EDGE_BOUNDARY: u8 = 0x1;

/// Contains triangle meshes that represent detailed height data associated
/// with the polygons in its associated polygon mesh object.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DetailNavmesh {
    /// The sub-mesh data, one per polygon of the source mesh
    pub meshes: Vec<SubMesh>,
    /// The mesh vertices in world space
    pub vertices: Vec<Vec3>,
    /// The mesh triangles. Indices are relative to [`SubMesh::first_vertex_index`] of their sub-mesh.
    pub triangles: Vec<[u8; 3]>,
    /// The edge flags of each triangle. See [`DETAIL_EDGE_BOUNDARY`].
    pub triangle_flags: Vec<u8>,
}

/// The range of vertices and triangles of [`DetailNavmesh`] that belong to one polygon.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SubMesh {
    /// Index of the first vertex of the sub-mesh
    pub first_vertex_index: usize,
    /// Number of vertices in the sub-mesh
    pub vertex_count: usize,
    /// Index of the first triangle of the sub-mesh
    pub first_triangle_index: usize,
    /// Number of triangles in the sub-mesh
    pub triangle_count: usize,
}

impl DetailNavmesh {
    /// Builds a detail mesh from the provided polygon mesh.
    ///
    /// The polygon edges are tessellated with height samples from `heightfield`, then points of a grid spaced
    /// `sample_distance` apart are added in order of how far they deviate from the surface, until every sample
    /// is within `sample_max_error`. A `sample_distance` of 0 disables sampling, which results in a plain
    /// triangulation of each polygon.
    ///
    /// # Errors
    ///
    /// Returns an error if the polygons have more vertices than a sub-mesh can index, or if no height data
    /// can be found for a polygon.
    pub fn new(
        mesh: &PolygonNavmesh,
        heightfield: &CompactHeightfield,
        sample_distance: f32,
        sample_max_error: f32,
    ) -> Result<Self, DetailNavmeshError> {
        let mut dmesh = DetailNavmesh::default();
        if mesh.vertices.is_empty() || mesh.polygon_count() == 0 {
            return Ok(dmesh);
        }
        let nvp = mesh.max_vertices_per_polygon;
        if nvp >= MAX_VERTS {
            return Err(DetailNavmeshError::TooManyVerticesPerPolygon { value: nvp });
        }
        let chf = heightfield;
        let cs = mesh.cell_size;
        let ch = mesh.cell_height;
        let orig = Vec3A::from(mesh.aabb.min);
        let border_size = mesh.border_size;
        let height_search_radius = 1.max(mesh.max_edge_error.ceil() as i32);

        let mut edges = Vec::with_capacity(64);
        let mut tris = Vec::with_capacity(512);
        let mut queue = VecDeque::with_capacity(512);
        let mut samples = Vec::with_capacity(512);
        let mut verts = Vec::with_capacity(256);
        let mut poly = Vec::with_capacity(nvp);

        // Find max size for a polygon area.
        let mut max_hw = 0;
        let mut max_hh = 0;
        let mut poly_vert_count = 0;
        let bounds: Vec<Bounds> = (0..mesh.polygon_count())
            .map(|i| {
                let mut bounds = Bounds {
                    xmin: chf.width,
                    xmax: 0,
                    zmin: chf.height,
                    zmax: 0,
                };
                let nv = mesh.polygon_vertex_count(i);
                for &index in &mesh.polygon(i)[..nv] {
                    let v = mesh.vertices[index as usize];
                    bounds.xmin = bounds.xmin.min(v.x);
                    bounds.xmax = bounds.xmax.max(v.x);
                    bounds.zmin = bounds.zmin.min(v.z);
                    bounds.zmax = bounds.zmax.max(v.z);
                }
                poly_vert_count += nv;
                bounds.xmin = bounds.xmin.saturating_sub(1);
                bounds.xmax = chf.width.min(bounds.xmax.saturating_add(1));
                bounds.zmin = bounds.zmin.saturating_sub(1);
                bounds.zmax = chf.height.min(bounds.zmax.saturating_add(1));
                if bounds.xmin < bounds.xmax && bounds.zmin < bounds.zmax {
                    max_hw = max_hw.max(bounds.width());
                    max_hh = max_hh.max(bounds.height());
                }
                bounds
            })
            .collect();
        let mut hp = HeightPatch {
            data: Vec::with_capacity(max_hw as usize * max_hh as usize),
            ..Default::default()
        };

        dmesh.meshes = Vec::with_capacity(mesh.polygon_count());
        dmesh.vertices = Vec::with_capacity(poly_vert_count + poly_vert_count / 2);
        dmesh.triangles = Vec::with_capacity(poly_vert_count * 2);
        dmesh.triangle_flags = Vec::with_capacity(poly_vert_count * 2);

        for (i, bounds) in bounds.iter().enumerate() {
            let nv = mesh.polygon_vertex_count(i);
            let indices = &mesh.polygon(i)[..nv];

            // Store polygon vertices for processing.
            poly.clear();
            poly.extend(indices.iter().map(|&index| {
                let v = mesh.vertices[index as usize].as_vec3();
                Vec3A::new(v.x * cs, v.y * ch, v.z * cs)
            }));

            // Get the height data from the area of the polygon.
            hp.xmin = bounds.xmin;
            hp.zmin = bounds.zmin;
            hp.width = bounds.xmax.saturating_sub(bounds.xmin);
            hp.height = bounds.zmax.saturating_sub(bounds.zmin);
            if hp.width == 0 || hp.height == 0 {
                stage_log(
                    LogLevel::Warn,
                    format!("Polygon {i} has an empty footprint, skipping its detail mesh."),
                );
                dmesh.meshes.push(SubMesh {
                    first_vertex_index: dmesh.vertices.len(),
                    vertex_count: 0,
                    first_triangle_index: dmesh.triangles.len(),
                    triangle_count: 0,
                });
                continue;
            }
            if !hp.fill(
                chf,
                indices,
                &mesh.vertices,
                border_size,
                mesh.regions[i],
                &mut queue,
            ) {
                return Err(DetailNavmeshError::MissingHeightData { polygon: i });
            }

            // Build detail mesh.
            build_poly_detail(
                &poly,
                sample_distance,
                sample_max_error,
                height_search_radius,
                chf,
                &hp,
                &mut verts,
                &mut tris,
                &mut edges,
                &mut samples,
            );

            // Move detail verts to world space.
            for vert in &mut verts {
                *vert += orig;
                // Is this offset necessary?
                vert.y += chf.cell_height;
            }
            // Offset poly too, will be used to flag checking.
            for vert in &mut poly {
                *vert += orig;
            }

            // Store detail submesh.
            dmesh.meshes.push(SubMesh {
                first_vertex_index: dmesh.vertices.len(),
                vertex_count: verts.len(),
                first_triangle_index: dmesh.triangles.len(),
                triangle_count: tris.len(),
            });
            dmesh.vertices.extend(verts.iter().map(|v| Vec3::from(*v)));
            for &[a, b, c] in &tris {
                dmesh.triangles.push([a as u8, b as u8, c as u8]);
                dmesh
                    .triangle_flags
                    .push(tri_flags(verts[a], verts[b], verts[c], &poly));
            }
        }

        Ok(dmesh)
    }

    /// The world-space triangles of the sub-mesh belonging to polygon `i`.
    pub fn submesh_triangles(&self, i: usize) -> impl Iterator<Item = [Vec3; 3]> + '_ {
        let submesh = self.meshes[i];
        let vertices = &self.vertices
            [submesh.first_vertex_index..submesh.first_vertex_index + submesh.vertex_count];
        self.triangles[submesh.first_triangle_index
            ..submesh.first_triangle_index + submesh.triangle_count]
            .iter()
            .map(move |triangle| triangle.map(|index| vertices[index as usize]))
    }
}

/// Errors that can occur when building a [`DetailNavmesh`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetailNavmeshError {
    /// The polygons can have more vertices than a sub-mesh is able to hold.
    #[error("polygons with up to {value} vertices cannot be tessellated, the maximum is {max}", max = MAX_VERTS - 1)]
    TooManyVerticesPerPolygon {
        /// The maximum number of vertices per polygon of the mesh
        value: usize,
    },
    /// No span close to the polygon was found to sample heights from.
    #[error("found no height data for polygon {polygon}")]
    MissingHeightData {
        /// Index of the polygon
        polygon: usize,
    },
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    x: i32,
    y: u16,
    z: i32,
    added: bool,
}

fn build_poly_detail(
    input: &[Vec3A],
    sample_dist: f32,
    sample_max_error: f32,
    height_search_radius: i32,
    chf: &CompactHeightfield,
    hp: &HeightPatch,
    verts: &mut Vec<Vec3A>,
    tris: &mut Vec<[usize; 3]>,
    edges: &mut Vec<[i32; 4]>,
    samples: &mut Vec<Sample>,
) {
    let nin = input.len();
    let mut edge = [Vec3A::ZERO; MAX_VERTS_PER_EDGE + 1];
    let mut hull = Vec::with_capacity(MAX_VERTS);

    verts.clear();
    verts.extend_from_slice(input);
    edges.clear();
    tris.clear();

    let cs = chf.cell_size;
    let ics = 1.0 / cs;

    // Calculate minimum extents of the polygon based on input data.
    let min_extent = poly_min_extent(verts);

    // Tessellate outlines.
    // This is done in separate pass in order to ensure
    // seamless height values across the poly boundaries.
    if sample_dist > 0.0 {
        let mut j = nin - 1;
        for i in 0..nin {
            let mut vj = input[j];
            let mut vi = input[i];
            let mut swapped = false;
            // Make sure the segments are always handled in same order
            // using lexological sort or else there will be seams.
            if (vj.x - vi.x).abs() < 1.0e-6 {
                if vj.z > vi.z {
                    std::mem::swap(&mut vj, &mut vi);
                    swapped = true;
                }
            } else if vj.x > vi.x {
                std::mem::swap(&mut vj, &mut vi);
                swapped = true;
            }
            // Create samples along the edge.
            let dij = vi - vj;
            let d = dij.xz().length();
            let mut nn = 1 + (d / sample_dist).floor() as usize;
            if nn >= MAX_VERTS_PER_EDGE {
                nn = MAX_VERTS_PER_EDGE - 1;
            }
            if verts.len() + nn >= MAX_VERTS {
                nn = (MAX_VERTS - 1).saturating_sub(verts.len()).max(1);
            }
            for (k, pos) in edge.iter_mut().enumerate().take(nn + 1) {
                let u = k as f32 / nn as f32;
                *pos = vj + dij * u;
                pos.y = hp.height_at(*pos, ics, chf.cell_height, height_search_radius) as f32
                    * chf.cell_height;
            }
            // Simplify samples.
            let mut idx = Vec::with_capacity(MAX_VERTS_PER_EDGE);
            idx.extend([0, nn]);
            let mut k = 0;
            while k + 1 < idx.len() {
                let a = idx[k];
                let b = idx[k + 1];
                let va = edge[a];
                let vb = edge[b];
                // Find maximum deviation along the segment.
                let mut max_d = 0.0;
                let mut max_i = None;
                for (m, sample) in edge.iter().enumerate().take(b).skip(a + 1) {
                    let dev = distance_squared_between_point_and_segment(*sample, (va, vb));
                    if dev > max_d {
                        max_d = dev;
                        max_i = Some(m);
                    }
                }
                // If the max deviation is larger than accepted error,
                // add new point, else continue to next segment.
                match max_i {
                    Some(max_i) if max_d > sample_max_error * sample_max_error => {
                        idx.insert(k + 1, max_i);
                    }
                    _ => k += 1,
                }
            }

            hull.push(j);
            // Add new vertices.
            let inner = &idx[1..idx.len() - 1];
            let mut add = |index: usize| {
                hull.push(verts.len());
                verts.push(edge[index]);
            };
            if swapped {
                inner.iter().rev().for_each(|&index| add(index));
            } else {
                inner.iter().for_each(|&index| add(index));
            }
            j = i;
        }
    } else {
        hull.extend(0..nin);
    }

    // If the polygon minimum extent is small (sliver or small triangle), do not try to add internal points.
    if min_extent < sample_dist * 2.0 {
        triangulate_hull(verts, &hull, nin, tris);
        return;
    }

    // Tessellate the base mesh.
    // We're using the triangulate_hull instead of delaunay_hull as it tends to
    // create a bit better triangulation for long thin triangles when there
    // are no internal points.
    triangulate_hull(verts, &hull, nin, tris);

    if tris.is_empty() {
        // Could not triangulate the poly, make sure there is some valid data there.
        stage_log(
            LogLevel::Warn,
            format!("Could not triangulate polygon ({} verts).", verts.len()),
        );
        return;
    }

    if sample_dist > 0.0 {
        // Create sample locations in a grid.
        let (min, max) = input[1..]
            .iter()
            .fold((input[0], input[0]), |(min, max), v| (min.min(*v), max.max(*v)));
        let x0 = (min.x / sample_dist).floor() as i32;
        let x1 = (max.x / sample_dist).ceil() as i32;
        let z0 = (min.z / sample_dist).floor() as i32;
        let z1 = (max.z / sample_dist).ceil() as i32;
        samples.clear();
        for z in z0..z1 {
            for x in x0..x1 {
                let pt = Vec3A::new(
                    x as f32 * sample_dist,
                    (max.y + min.y) * 0.5,
                    z as f32 * sample_dist,
                );
                // Make sure the samples are not too close to the edges.
                if dist_to_poly(input, pt) > -sample_dist / 2.0 {
                    continue;
                }
                samples.push(Sample {
                    x,
                    y: hp.height_at(pt, ics, chf.cell_height, height_search_radius),
                    z,
                    added: false,
                });
            }
        }

        // Add the samples starting from the one that has the most
        // error. The procedure stops when all samples are added
        // or when the max error is within treshold.
        for _ in 0..samples.len() {
            if verts.len() >= MAX_VERTS {
                break;
            }

            // Find sample with most error.
            let mut best_pt = Vec3A::ZERO;
            let mut best_d = 0.0;
            let mut best_i = None;
            for (i, sample) in samples.iter().enumerate() {
                if sample.added {
                    continue;
                }
                // The sample location is jittered to get rid of some bad triangulations
                // which are cause by symmetrical data from the grid structure.
                let pt = Vec3A::new(
                    sample.x as f32 * sample_dist + jitter_x(i) * cs * 0.1,
                    sample.y as f32 * chf.cell_height,
                    sample.z as f32 * sample_dist + jitter_z(i) * cs * 0.1,
                );
                let Some(d) = dist_to_tri_mesh(pt, verts, tris) else {
                    // did not hit the mesh.
                    continue;
                };
                if d > best_d {
                    best_d = d;
                    best_i = Some(i);
                    best_pt = pt;
                }
            }
            // If the max error is within accepted threshold, stop tesselating.
            let Some(best_i) = best_i.filter(|_| best_d > sample_max_error) else {
                break;
            };
            // Mark sample as added.
            samples[best_i].added = true;
            // Add the new sample point.
            verts.push(best_pt);

            // Create new triangulation.
            // TODO: Incremental add instead of full rebuild.
            edges.clear();
            tris.clear();
            delaunay_hull(verts, &hull, tris, edges);
        }
    }

    if tris.len() > MAX_TRIS {
        stage_log(LogLevel::Error, format!(
            "Shrinking triangle count from {} to max {MAX_TRIS}.",
            tris.len()
        ));
        tris.truncate(MAX_TRIS);
    }
}

/// Calculate minimum extend of the polygon.
fn poly_min_extent(verts: &[Vec3A]) -> f32 {
    let nverts = verts.len();
    let mut min_dist = f32::MAX;
    for i in 0..nverts {
        let ni = next(i, nverts);
        let p1 = verts[i].xz();
        let p2 = verts[ni].xz();
        let max_edge_dist = (0..nverts)
            .filter(|&j| j != i && j != ni)
            .map(|j| distance_squared_between_point_and_segment_xz(verts[j].xz(), (p1, p2)))
            .fold(0.0_f32, f32::max);
        min_dist = min_dist.min(max_edge_dist);
    }
    min_dist.sqrt()
}

fn jitter_x(i: usize) -> f32 {
    ((i as u32).wrapping_mul(0x8da6b343) & 0xffff) as f32 / 65535.0 * 2.0 - 1.0
}

fn jitter_z(i: usize) -> f32 {
    ((i as u32).wrapping_mul(0xd8163841) & 0xffff) as f32 / 65535.0 * 2.0 - 1.0
}

/// Signed distance from `p` to the polygon outline on the xz-plane. Negative inside.
fn dist_to_poly(verts: &[Vec3A], p: Vec3A) -> f32 {
    let nvert = verts.len();
    let mut dmin = f32::MAX;
    let mut inside = false;
    let mut j = nvert - 1;
    for i in 0..nvert {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > p.z) != (vj.z > p.z))
            && (p.x < (vj.x - vi.x) * (p.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        dmin = dmin.min(distance_squared_between_point_and_segment_xz(
            p.xz(),
            (vj.xz(), vi.xz()),
        ));
        j = i;
    }
    let dmin = dmin.sqrt();
    if inside { -dmin } else { dmin }
}

fn dist_to_tri_mesh(p: Vec3A, verts: &[Vec3A], tris: &[[usize; 3]]) -> Option<f32> {
    tris.iter()
        .filter_map(|&[a, b, c]| dist_pt_tri(p, verts[a], verts[b], verts[c]))
        .min_by(f32::total_cmp)
}

/// Vertical distance from point p to triangle defined by vertices a, b, and c.
/// Returns `None` if the point is outside the triangle on the xz-plane.
fn dist_pt_tri(p: Vec3A, a: Vec3A, b: Vec3A, c: Vec3A) -> Option<f32> {
    let v0 = c - a;
    let v1 = b - a;
    let v2 = p - a;

    let dot00 = v0.xz().dot(v0.xz());
    let dot01 = v0.xz().dot(v1.xz());
    let dot02 = v0.xz().dot(v2.xz());
    let dot11 = v1.xz().dot(v1.xz());
    let dot12 = v1.xz().dot(v2.xz());

    // Compute barycentric coordinates
    let inv_denom = 1.0 / (dot00 * dot11 - dot01 * dot01);
    let u = (dot11 * dot02 - dot01 * dot12) * inv_denom;
    let v = (dot00 * dot12 - dot01 * dot02) * inv_denom;

    // If point lies inside the triangle, return interpolated y-coord.
    const EPS: f32 = 1.0e-4;
    if u >= -EPS && v >= -EPS && (u + v) <= 1.0 + EPS {
        let y = a.y + v0.y * u + v1.y * v;
        Some((y - p.y).abs())
    } else {
        None
    }
}

fn triangulate_hull(verts: &[Vec3A], hull: &[usize], nin: usize, tris: &mut Vec<[usize; 3]>) {
    let nhull = hull.len();
    if nhull < 3 {
        return;
    }
    let mut start = 0;
    let mut left = 1;
    let mut right = nhull - 1;

    // Start from an ear with shortest perimeter.
    // This tends to favor well formed triangles as starting point.
    let mut dmin = f32::MAX;
    for i in 0..nhull {
        if hull[i] >= nin {
            // Ears are triangles with original vertices as middle vertex while others are actually line segments on edges
            continue;
        }
        let pi = prev(i, nhull);
        let ni = next(i, nhull);
        let pv = verts[hull[pi]].xz();
        let cv = verts[hull[i]].xz();
        let nv = verts[hull[ni]].xz();
        let d = pv.distance(cv) + cv.distance(nv) + nv.distance(pv);
        if d < dmin {
            start = i;
            left = ni;
            right = pi;
            dmin = d;
        }
    }

    // Add first triangle
    tris.push([hull[start], hull[left], hull[right]]);

    // Triangulate the polygon by moving left or right,
    // depending on which triangle has shorter perimeter.
    // This heuristic was chose empirically, since it seems
    // handle tessellated straight edges well.
    while next(left, nhull) != right {
        // Check to see if se should advance left or right.
        let nleft = next(left, nhull);
        let nright = prev(right, nhull);

        let cvleft = verts[hull[left]].xz();
        let nvleft = verts[hull[nleft]].xz();
        let cvright = verts[hull[right]].xz();
        let nvright = verts[hull[nright]].xz();
        let dleft = cvleft.distance(nvleft) + nvleft.distance(cvright);
        let dright = cvright.distance(nvright) + cvleft.distance(nvright);

        if dleft < dright {
            tris.push([hull[left], hull[nleft], hull[right]]);
            left = nleft;
        } else {
            tris.push([hull[left], hull[nright], hull[right]]);
            right = nright;
        }
    }
}

/// Edge entry value for a face that has not been found yet.
const EV_UNDEF: i32 = -1;
/// Edge entry value for the outside of the hull.
const EV_HULL: i32 = -2;

/// Triangulates `pts` with a Delaunay triangulation constrained to the outline `hull`.
/// Each edge is stored as `[start, end, left face, right face]`.
fn delaunay_hull(
    pts: &[Vec3A],
    hull: &[usize],
    tris: &mut Vec<[usize; 3]>,
    edges: &mut Vec<[i32; 4]>,
) {
    let max_edges = pts.len() * 10;
    let mut nfaces = 0;
    edges.clear();

    let mut j = hull.len() - 1;
    for i in 0..hull.len() {
        add_edge(edges, max_edges, hull[j] as i32, hull[i] as i32, EV_HULL, EV_UNDEF);
        j = i;
    }

    let mut current_edge = 0;
    while current_edge < edges.len() {
        if edges[current_edge][2] == EV_UNDEF {
            complete_facet(pts, edges, max_edges, &mut nfaces, current_edge);
        }
        if edges[current_edge][3] == EV_UNDEF {
            complete_facet(pts, edges, max_edges, &mut nfaces, current_edge);
        }
        current_edge += 1;
    }

    // Create tris
    let mut faces = vec![[-1_i32; 3]; nfaces as usize];
    for e in edges.iter() {
        if e[3] >= 0 {
            // Left face
            let t = &mut faces[e[3] as usize];
            if t[0] == -1 {
                t[0] = e[0];
                t[1] = e[1];
            } else if t[0] == e[1] {
                t[2] = e[0];
            } else if t[1] == e[0] {
                t[2] = e[1];
            }
        }
        if e[2] >= 0 {
            // Right
            let t = &mut faces[e[2] as usize];
            if t[0] == -1 {
                t[0] = e[1];
                t[1] = e[0];
            } else if t[0] == e[0] {
                t[2] = e[1];
            } else if t[1] == e[1] {
                t[2] = e[0];
            }
        }
    }

    tris.clear();
    for (i, t) in faces.iter().enumerate() {
        if t.iter().any(|&v| v < 0) {
            stage_log(
                LogLevel::Warn,
                format!("Removing dangling face {i} [{}, {}, {}].", t[0], t[1], t[2]),
            );
            continue;
        }
        tris.push(t.map(|v| v as usize));
    }
}

fn find_edge(edges: &[[i32; 4]], s: i32, t: i32) -> Option<usize> {
    edges
        .iter()
        .position(|e| (e[0] == s && e[1] == t) || (e[0] == t && e[1] == s))
}

fn add_edge(edges: &mut Vec<[i32; 4]>, max_edges: usize, s: i32, t: i32, l: i32, r: i32) {
    if edges.len() >= max_edges {
        stage_log(LogLevel::Error, format!("Too many edges ({}/{max_edges}).", edges.len()));
        return;
    }
    // Add edge if not already in the triangulation.
    if find_edge(edges, s, t).is_none() {
        edges.push([s, t, l, r]);
    }
}

fn update_left_face(e: &mut [i32; 4], s: i32, t: i32, f: i32) {
    if e[0] == s && e[1] == t && e[2] == EV_UNDEF {
        e[2] = f;
    } else if e[1] == s && e[0] == t && e[3] == EV_UNDEF {
        e[3] = f;
    }
}

fn overlap_seg_seg_2d(a: Vec3A, b: Vec3A, c: Vec3A, d: Vec3A) -> bool {
    let a1 = cross_xz(a, b, d);
    let a2 = cross_xz(a, b, c);
    if a1 * a2 < 0.0 {
        let a3 = cross_xz(c, d, a);
        let a4 = a3 + a2 - a1;
        if a3 * a4 < 0.0 {
            return true;
        }
    }
    false
}

fn overlap_edges(pts: &[Vec3A], edges: &[[i32; 4]], s1: i32, t1: i32) -> bool {
    edges.iter().any(|e| {
        let s0 = e[0];
        let t0 = e[1];
        // Same or connected edges do not overlap.
        if s0 == s1 || s0 == t1 || t0 == s1 || t0 == t1 {
            return false;
        }
        overlap_seg_seg_2d(
            pts[s0 as usize],
            pts[t0 as usize],
            pts[s1 as usize],
            pts[t1 as usize],
        )
    })
}

/// Returns the center and radius of the circle through the three points on the xz-plane,
/// or `None` if they are collinear.
fn circum_circle(p1: Vec3A, p2: Vec3A, p3: Vec3A) -> Option<(Vec3A, f32)> {
    const EPS: f32 = 1.0e-6;
    // Calculate the circle relative to p1, to avoid some precision issues.
    let v1 = Vec3A::ZERO;
    let v2 = p2 - p1;
    let v3 = p3 - p1;

    let cp = cross_xz(v1, v2, v3);
    if cp.abs() <= EPS {
        return None;
    }
    let v1_sq = v1.xz().length_squared();
    let v2_sq = v2.xz().length_squared();
    let v3_sq = v3.xz().length_squared();
    let c = Vec3A::new(
        (v1_sq * (v2.z - v3.z) + v2_sq * (v3.z - v1.z) + v3_sq * (v1.z - v2.z)) / (2.0 * cp),
        0.0,
        (v1_sq * (v3.x - v2.x) + v2_sq * (v1.x - v3.x) + v3_sq * (v2.x - v1.x)) / (2.0 * cp),
    );
    let r = c.xz().distance(v1.xz());
    Some((c + p1, r))
}

fn complete_facet(
    pts: &[Vec3A],
    edges: &mut Vec<[i32; 4]>,
    max_edges: usize,
    nfaces: &mut i32,
    e: usize,
) {
    const EPS: f32 = 1.0e-5;
    let edge = edges[e];

    // Cache s and t.
    let (s, t) = if edge[2] == EV_UNDEF {
        (edge[0], edge[1])
    } else if edge[3] == EV_UNDEF {
        (edge[1], edge[0])
    } else {
        // Edge already completed.
        return;
    };
    let (ps, pt_t) = (pts[s as usize], pts[t as usize]);

    // Find best point on left of edge.
    let mut pt = None;
    let mut c = Vec3A::ZERO;
    let mut r = -1.0;
    let update_circle = |u: usize, c: &mut Vec3A, r: &mut f32| {
        let (center, radius) = circum_circle(ps, pt_t, pts[u]).unwrap_or((ps, 0.0));
        *c = center;
        *r = radius;
    };
    for u in 0..pts.len() {
        let ui = u as i32;
        if ui == s || ui == t {
            continue;
        }
        if cross_xz(ps, pt_t, pts[u]) <= EPS {
            continue;
        }
        if r < 0.0 {
            // The circle is not updated yet, do it now.
            pt = Some(u);
            update_circle(u, &mut c, &mut r);
            continue;
        }
        let d = c.xz().distance(pts[u].xz());
        const TOL: f32 = 0.001;
        if d > r * (1.0 + TOL) {
            // Outside current circumcircle, skip.
            continue;
        } else if d < r * (1.0 - TOL) {
            // Inside safe circumcircle, update circle.
            pt = Some(u);
            update_circle(u, &mut c, &mut r);
        } else {
            // Inside epsilon circum circle, do extra tests to make sure the edge is valid.
            // s-u and t-u cannot overlap with s-pt nor t-pt if they exists.
            if overlap_edges(pts, edges, s, ui) || overlap_edges(pts, edges, t, ui) {
                continue;
            }
            // Edge is valid.
            pt = Some(u);
            update_circle(u, &mut c, &mut r);
        }
    }

    // Add new triangle or update edge info if s-t is on hull.
    let Some(pt) = pt else {
        update_left_face(&mut edges[e], s, t, EV_HULL);
        return;
    };
    let pt = pt as i32;
    // Update face information of edge being completed.
    update_left_face(&mut edges[e], s, t, *nfaces);

    // Add new edge or update face info of old edge.
    match find_edge(edges, pt, s) {
        None => add_edge(edges, max_edges, pt, s, *nfaces, EV_UNDEF),
        Some(e) => update_left_face(&mut edges[e], pt, s, *nfaces),
    }

    // Add new edge or update face info of old edge.
    match find_edge(edges, t, pt) {
        None => add_edge(edges, max_edges, t, pt, *nfaces, EV_UNDEF),
        Some(e) => update_left_face(&mut edges[e], t, pt, *nfaces),
    }

    *nfaces += 1;
}

/// Figures out whether edge (va, vb) is part of the polygon boundary.
fn edge_flags(va: Vec3A, vb: Vec3A, poly: &[Vec3A]) -> u8 {
    const THRESHOLD_SQUARED: f32 = 0.001 * 0.001;
    let npoly = poly.len();
    let mut j = npoly - 1;
    for i in 0..npoly {
        let segment = (poly[j].xz(), poly[i].xz());
        if distance_squared_between_point_and_segment_xz(va.xz(), segment) < THRESHOLD_SQUARED
            && distance_squared_between_point_and_segment_xz(vb.xz(), segment)
                < THRESHOLD_SQUARED
        {
            return DETAIL_EDGE_BOUNDARY;
        }
        j = i;
    }
    0
}

fn tri_flags(va: Vec3A, vb: Vec3A, vc: Vec3A, poly: &[Vec3A]) -> u8 {
    edge_flags(va, vb, poly) | edge_flags(vb, vc, poly) << 2 | edge_flags(vc, va, poly) << 4
}

/// Height samples of the compact heightfield underneath a polygon.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct HeightPatch {
    data: Vec<u16>,
    xmin: u16,
    zmin: u16,
    width: u16,
    height: u16,
}

impl HeightPatch {
    /// Fills the patch with the heights of the spans reachable from the polygon.
    /// Returns `false` if no span to start from was found.
    fn fill(
        &mut self,
        chf: &CompactHeightfield,
        poly: &[u16],
        vertices: &[U16Vec3],
        bs: u16,
        region: RegionId,
        queue: &mut VecDeque<(i32, i32, usize)>,
    ) -> bool {
        // Note: Reads to the compact heightfield are offset by border size (bs)
        // since border size offset is already removed from the polymesh vertices.
        queue.clear();
        // Set all heights to RC_UNSET_HEIGHT.
        self.data.clear();
        self.data
            .resize(self.width as usize * self.height as usize, RC_UNSET_HEIGHT);

        let mut empty = true;

        // We cannot sample from this poly if it was created from polys
        // of different regions. If it was then it could potentially be overlapping
        // with polys of that region and the heights sampled here could be wrong.
        if region != RegionId::NONE {
            // Copy the height from the same region, and mark region borders
            // as seed points to fill the rest.
            for hz in 0..self.height {
                let z = self.zmin + hz + bs;
                for hx in 0..self.width {
                    let x = self.xmin + hx + bs;
                    let Some(i) = chf
                        .cell_at(x, z)
                        .index_range()
                        .find(|&i| chf.spans[i].region == region)
                    else {
                        continue;
                    };
                    // Store height
                    let index = self.index(hx as i32, hz as i32);
                    self.data[index] = chf.spans[i].y;
                    empty = false;

                    // If any of the neighbours is not in same region,
                    // add the current location as flood fill start
                    let border = (0..4).any(|dir| {
                        chf.neighbor_index(x as i32, z as i32, i, dir)
                            .is_some_and(|ai| chf.spans[ai].region != region)
                    });
                    if border {
                        queue.push_back((x as i32, z as i32, i));
                    }
                }
            }
        }

        // if the polygon does not contain any points from the current region (rare, but happens)
        // or if it could potentially be overlapping polygons of the same region,
        // then use the center as the seed point.
        if empty && !self.seed_with_poly_center(chf, poly, vertices, bs, queue) {
            return false;
        }

        // We assume the seed is centered in the polygon, so a BFS to collect
        // height data will ensure we do not move onto overlapping polygons and
        // sample wrong heights.
        while let Some((cx, cz, ci)) = queue.pop_front() {
            for dir in 0..4 {
                let Some(con) = chf.spans[ci].con(dir) else {
                    continue;
                };
                let (ax, az, ai) = chf.con_indices(cx, cz, dir, con);
                let hx = ax - self.xmin as i32 - bs as i32;
                let hz = az - self.zmin as i32 - bs as i32;
                if hx < 0 || hz < 0 || hx >= self.width as i32 || hz >= self.height as i32 {
                    continue;
                }
                let index = self.index(hx, hz);
                if self.data[index] != RC_UNSET_HEIGHT {
                    continue;
                }
                self.data[index] = chf.spans[ai].y;
                queue.push_back((ax, az, ai));
            }
        }
        true
    }

    fn seed_with_poly_center(
        &mut self,
        chf: &CompactHeightfield,
        poly: &[u16],
        vertices: &[U16Vec3],
        bs: u16,
        queue: &mut VecDeque<(i32, i32, usize)>,
    ) -> bool {
        // Note: Reads to the compact heightfield are offset by border size (bs)
        // since border size offset is already removed from the polymesh vertices.
        const OFFSET: [(i32, i32); 9] = [
            (0, 0),
            (-1, -1),
            (0, -1),
            (1, -1),
            (1, 0),
            (1, 1),
            (0, 1),
            (-1, 1),
            (-1, 0),
        ];
        let (xmin, zmin) = (self.xmin as i32, self.zmin as i32);
        let (width, height) = (self.width as i32, self.height as i32);
        let bs = bs as i32;

        // Find cell closest to a poly vertex
        let mut start = None;
        let mut dmin = RC_UNSET_HEIGHT as i32;
        'search: for &index in poly {
            let v = vertices[index as usize];
            for (ox, oz) in OFFSET {
                if dmin <= 0 {
                    break 'search;
                }
                let ax = v.x as i32 + ox;
                let ay = v.y as i32;
                let az = v.z as i32 + oz;
                if ax < xmin || ax >= xmin + width || az < zmin || az >= zmin + height {
                    continue;
                }
                let cell = chf.cell_at((ax + bs) as u16, (az + bs) as u16);
                for i in cell.index_range() {
                    let d = (ay - chf.spans[i].y as i32).abs();
                    if d < dmin {
                        start = Some((ax, az, i));
                        dmin = d;
                    }
                }
            }
        }
        let Some(start) = start else {
            return false;
        };

        // Find center of the polygon
        let n = poly.len() as i32;
        let pcx = poly
            .iter()
            .map(|&index| vertices[index as usize].x as i32)
            .sum::<i32>()
            / n;
        let pcz = poly
            .iter()
            .map(|&index| vertices[index as usize].z as i32)
            .sum::<i32>()
            / n;

        // Use a stack for DFS
        let mut stack = vec![start];
        let (mut cx, mut cz, mut ci) = start;
        let mut dirs = [0, 1, 2, 3];
        self.data.fill(0);
        // DFS to move to the center. Note that we need a DFS here and can not just move
        // directly towards the center without recording intermediate nodes, even though the polygons
        // are convex. In very rare we can get stuck due to contour simplification if we do not
        // record nodes.
        loop {
            let Some(current) = stack.pop() else {
                stage_log(LogLevel::Warn, "Walk towards polygon center failed to reach center");
                break;
            };
            (cx, cz, ci) = current;
            if cx == pcx && cz == pcz {
                break;
            }

            // If we are already at the correct X-position, prefer direction
            // directly towards the center in the Y-axis; otherwise prefer
            // direction in the X-axis
            let direct_dir = if cx == pcx {
                dir_offset(0, if pcz > cz { 1 } else { -1 })
            } else {
                dir_offset(if pcx > cx { 1 } else { -1 }, 0)
            } as usize;

            // Push the direct dir last so we start with this on next iteration
            dirs.swap(direct_dir, 3);

            for dir in dirs {
                let Some(con) = chf.spans[ci].con(dir) else {
                    continue;
                };
                let new_x = cx + dir_offset_x(dir) as i32;
                let new_z = cz + dir_offset_z(dir) as i32;

                let hpx = new_x - xmin;
                let hpz = new_z - zmin;
                if hpx < 0 || hpx >= width || hpz < 0 || hpz >= height {
                    continue;
                }
                let index = self.index(hpx, hpz);
                if self.data[index] != 0 {
                    continue;
                }
                self.data[index] = 1;
                let (_, _, new_index) = chf.con_indices(cx + bs, cz + bs, dir, con);
                stack.push((new_x, new_z, new_index));
            }

            dirs.swap(direct_dir, 3);
        }

        // Height data seeds are given in coordinates with borders
        queue.clear();
        queue.push_back((cx + bs, cz + bs, ci));
        self.data.fill(RC_UNSET_HEIGHT);
        let index = self.index(cx - xmin, cz - zmin);
        self.data[index] = chf.spans[ci].y;
        true
    }

    /// Height at `f` in voxels. If the patch has no data there,
    /// the closest height in a spiral of up to `radius` cells is used.
    fn height_at(&self, f: Vec3A, ics: f32, ch: f32, radius: i32) -> u16 {
        let ix = (f.x * ics + 0.01).floor() as i32;
        let iz = (f.z * ics + 0.01).floor() as i32;
        let ix = (ix - self.xmin as i32).clamp(0, self.width as i32 - 1);
        let iz = (iz - self.zmin as i32).clamp(0, self.height as i32 - 1);
        let mut h = self.data[self.index(ix, iz)];
        if h != RC_UNSET_HEIGHT {
            return h;
        }

        // Special case when data might be bad.
        // Walk adjacent cells in a spiral up to 'radius', and look
        // for a pixel which has a valid height.
        let (mut x, mut z, mut dx, mut dz) = (1, 0, 1, 0);
        let max_size = radius * 2 + 1;
        let max_iter = max_size * max_size - 1;

        let mut next_ring_iter_start = 8;
        let mut next_ring_iters = 16;

        let mut dmin = f32::MAX;
        for i in 0..max_iter {
            let nx = ix + x;
            let nz = iz + z;
            if nx >= 0 && nz >= 0 && nx < self.width as i32 && nz < self.height as i32 {
                let nh = self.data[self.index(nx, nz)];
                if nh != RC_UNSET_HEIGHT {
                    let d = (nh as f32 * ch - f.y).abs();
                    if d < dmin {
                        h = nh;
                        dmin = d;
                    }
                }
            }

            // We are searching in a grid which looks approximately like this:
            //  __________
            // |2 ______ 2|
            // | |1 __ 1| |
            // | | |__| | |
            // | |______| |
            // |__________|
            // We want to find the best height as close to the center cell as possible. This means that
            // if we find a height in one of the neighbor cells to the center, we don't want to
            // expand further out than the 8 neighbors - we want to limit our search to the closest
            // of these "rings", but the best height in the ring.
            // Here we detect if we are about to enter the next ring, and if we are and we have found
            // a height, we abort the search.
            if i + 1 == next_ring_iter_start {
                if h != RC_UNSET_HEIGHT {
                    break;
                }
                next_ring_iter_start += next_ring_iters;
                next_ring_iters += 8;
            }

            if x == z || (x < 0 && x == -z) || (x > 0 && x == 1 - z) {
                (dx, dz) = (-dz, dx);
            }
            x += dx;
            z += dz;
        }
        h
    }

    #[inline]
    fn index(&self, x: i32, z: i32) -> usize {
        (x + z * self.width as i32) as usize
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    xmin: u16,
    xmax: u16,
    zmin: u16,
    zmax: u16,
}

impl Bounds {
    #[inline]
    fn width(&self) -> u16 {
        self.xmax - self.xmin
    }

    #[inline]
    fn height(&self) -> u16 {
        self.zmax - self.zmin
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::{
        AreaType, BuildContoursFlags,
        compact_heightfield::tests::flat_compact_heightfield,
        heightfield::tests::{height_field, insert, span},
    };

    fn detail_mesh(
        compact: &mut CompactHeightfield,
        sample_distance: f32,
        sample_max_error: f32,
    ) -> (PolygonNavmesh, DetailNavmesh) {
        compact.build_regions_monotone(0, 0, 0).unwrap();
        let mesh = compact
            .build_contours(1.3, 0, BuildContoursFlags::DEFAULT)
            .unwrap()
            .into_polygon_mesh(6)
            .unwrap();
        let detail = DetailNavmesh::new(&mesh, compact, sample_distance, sample_max_error).unwrap();
        (mesh, detail)
    }

    fn triangle_area_xz([a, b, c]: [Vec3; 3]) -> f32 {
        cross_xz(a.into(), b.into(), c.into()).abs() / 2.0
    }

    #[test]
    fn empty_mesh_gives_empty_detail_mesh() {
        let compact = flat_compact_heightfield(4);
        let mesh = PolygonNavmesh {
            vertices: Vec::new(),
            polygons: Vec::new(),
            polygon_neighbors: Vec::new(),
            regions: Vec::new(),
            flags: Vec::new(),
            areas: Vec::new(),
            max_vertices_per_polygon: 6,
            aabb: compact.aabb,
            cell_size: 1.0,
            cell_height: 1.0,
            border_size: 0,
            max_edge_error: 1.3,
        };
        let detail = DetailNavmesh::new(&mesh, &compact, 6.0, 1.0).unwrap();
        assert_eq!(detail, DetailNavmesh::default());
    }

    #[test]
    fn unsampled_polygons_are_fanned() {
        let mut compact = flat_compact_heightfield(8);
        let (mesh, detail) = detail_mesh(&mut compact, 0.0, 1.0);
        assert_eq!(detail.meshes.len(), mesh.polygon_count());
        for (i, submesh) in detail.meshes.iter().enumerate() {
            let nv = mesh.polygon_vertex_count(i);
            assert_eq!(submesh.vertex_count, nv);
            assert_eq!(submesh.triangle_count, nv - 2);
        }
        // Span floor at y = 1, lifted by one cell.
        for vertex in &detail.vertices {
            assert_relative_eq!(vertex.y, 2.0);
        }
    }

    #[test]
    fn flat_surface_needs_no_extra_samples() {
        let mut compact = flat_compact_heightfield(8);
        let (mesh, detail) = detail_mesh(&mut compact, 1.0, 0.5);
        assert_eq!(detail.vertices.len(), mesh.vertices.len());
        let area: f32 = (0..detail.meshes.len())
            .flat_map(|i| detail.submesh_triangles(i))
            .map(triangle_area_xz)
            .sum();
        assert_relative_eq!(area, 64.0, epsilon = 1.0e-3);
    }

    #[test]
    fn boundary_edges_are_flagged() {
        let mut compact = flat_compact_heightfield(8);
        let (_, detail) = detail_mesh(&mut compact, 0.0, 1.0);
        // A quad split into two triangles: two boundary edges each.
        assert_eq!(detail.triangles.len(), 2);
        for flags in &detail.triangle_flags {
            let boundary_edges = (0..3)
                .filter(|edge| (flags >> (edge * 2)) & DETAIL_EDGE_BOUNDARY != 0)
                .count();
            assert_eq!(boundary_edges, 2);
        }
    }

    #[test]
    fn bumps_are_sampled() {
        let mut heightfield = height_field(8.0);
        for z in 0..8 {
            for x in 0..8 {
                let top = if (3..5).contains(&x) && (3..5).contains(&z) {
                    2
                } else {
                    1
                };
                insert(&mut heightfield, x, z, span(0, top, 1));
            }
        }
        let mut compact = heightfield.into_compact(2, 1).unwrap();
        let (mesh, detail) = detail_mesh(&mut compact, 1.0, 0.5);
        assert_eq!(mesh.polygon_count(), 1);
        assert!(detail.vertices.len() > mesh.vertices.len());
        // The bump is at y = 2, lifted by one cell.
        assert!(detail.vertices.iter().any(|v| (v.y - 3.0).abs() < 1.0e-4));
        assert!(detail.triangles.len() <= MAX_TRIS);
        for triangle in &detail.triangles {
            assert!(triangle.iter().all(|&v| (v as usize) < detail.vertices.len()));
        }
        let area: f32 = detail.submesh_triangles(0).map(triangle_area_xz).sum();
        assert_relative_eq!(area, 64.0, epsilon = 1.0e-2);
        assert!(compact.areas.iter().all(|area| *area == AreaType(1)));
    }

    #[test]
    fn delaunay_triangulates_square_with_center() {
        let pts = vec![
            Vec3A::new(0.0, 0.0, 0.0),
            Vec3A::new(0.0, 0.0, 4.0),
            Vec3A::new(4.0, 0.0, 4.0),
            Vec3A::new(4.0, 0.0, 0.0),
            Vec3A::new(2.0, 1.0, 2.1),
        ];
        let mut tris = Vec::new();
        let mut edges = Vec::new();
        delaunay_hull(&pts, &[0, 1, 2, 3], &mut tris, &mut edges);
        assert_eq!(tris.len(), 4);
        assert!(tris.iter().all(|t| t.contains(&4)));
        let area: f32 = tris
            .iter()
            .map(|&[a, b, c]| cross_xz(pts[a], pts[b], pts[c]).abs() / 2.0)
            .sum();
        assert_relative_eq!(area, 16.0, epsilon = 1.0e-4);
    }
}
