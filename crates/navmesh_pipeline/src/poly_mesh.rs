use glam::{IVec3, U16Vec3};
use thiserror::Error;

use crate::{
    Aabb3d, AreaType, LogLevel, RegionId,
    context::stage_log,
    contours::{ContourSet, RegionVertexId},
    math::{grid, next, prev},
};

/// A value which indicates an invalid index within a mesh.
///
/// This does not necessarily indicate an error.
pub const RC_MESH_NULL_IDX: u16 = 0xffff;

/// Flag set on neighbor entries of edges that lie on the border of the field when it was built with a border.
/// The lower bits hold the direction of the border.
pub const RC_PORTAL_FLAG: u16 = 0x8000;

/// Region of polygons that were merged from several regions while removing border vertices.
const MULTIPLE_REGIONS: RegionId = RegionId::NONE;

const VERTEX_BUCKET_COUNT: usize = 1 << 12;

/// Represents a polygon mesh suitable for use in building a navigation mesh.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PolygonNavmesh {
    /// The mesh vertices in voxel coordinates.
    pub vertices: Vec<U16Vec3>,
    /// Polygon vertex indices. Each polygon occupies [`Self::max_vertices_per_polygon`] slots,
    /// unused slots are set to [`RC_MESH_NULL_IDX`]. [Length: `polygon_count * max_vertices_per_polygon`]
    pub polygons: Vec<u16>,
    /// Polygon neighbors, one slot per polygon edge, laid out like [`Self::polygons`].
    /// Edge `j` goes from vertex `j` to vertex `j + 1` of the polygon.
    /// Contains the index of the polygon on the other side of the edge, or [`RC_MESH_NULL_IDX`] for solid edges.
    pub polygon_neighbors: Vec<u16>,
    /// The region id assigned to each polygon.
    pub regions: Vec<RegionId>,
    /// The flags assigned to each polygon. Not used by the build, free for the user.
    pub flags: Vec<u16>,
    /// The area id assigned to each polygon.
    pub areas: Vec<AreaType>,
    /// The maximum number of vertices per polygon
    pub max_vertices_per_polygon: usize,
    /// The bounding box of the mesh in world space.
    pub aabb: Aabb3d,
    /// The size of each cell. (On the xz-plane.)
    pub cell_size: f32,
    /// The height of each cell. (The minimum increment along the y-axis.)
    pub cell_height: f32,
    /// The AABB border size used to generate the source data from which the mesh was derived.
    pub border_size: u16,
    /// The max error of the polygon edges in the mesh.
    pub max_edge_error: f32,
}

impl PolygonNavmesh {
    /// Number of polygons in the mesh.
    #[inline]
    pub fn polygon_count(&self) -> usize {
        self.regions.len()
    }

    /// The vertex slots of polygon `i`, including trailing [`RC_MESH_NULL_IDX`] entries.
    #[inline]
    pub fn polygon(&self, i: usize) -> &[u16] {
        let nvp = self.max_vertices_per_polygon;
        &self.polygons[i * nvp..(i + 1) * nvp]
    }

    /// The neighbor slots of polygon `i`.
    #[inline]
    pub fn neighbors(&self, i: usize) -> &[u16] {
        let nvp = self.max_vertices_per_polygon;
        &self.polygon_neighbors[i * nvp..(i + 1) * nvp]
    }

    /// Number of vertices of polygon `i`.
    #[inline]
    pub fn polygon_vertex_count(&self, i: usize) -> usize {
        count_poly_verts(self.polygon(i))
    }

    /// Builds a polygon mesh from the provided contours.
    ///
    /// Each contour is triangulated and the triangles are merged into convex polygons with at most
    /// `max_vertices_per_polygon` vertices. Vertices flagged as [`RegionVertexId::BORDER_VERTEX`] are removed
    /// where possible, and the neighbors of each polygon edge are resolved.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_vertices_per_polygon` is less than 3, or if the mesh would need
    /// more vertices or polygons than can be indexed with [`u16`].
    pub fn from_contours(
        contour_set: &ContourSet,
        max_vertices_per_polygon: usize,
    ) -> Result<Self, PolygonMeshError> {
        let nvp = max_vertices_per_polygon;
        if nvp < 3 {
            return Err(PolygonMeshError::InvalidVerticesPerPolygon { value: nvp });
        }

        let mut max_vertices = 0;
        let mut max_tris = 0;
        for contour in &contour_set.contours {
            if contour.vertices.len() < 3 {
                continue;
            }
            max_vertices += contour.vertices.len();
            max_tris += contour.vertices.len() - 2;
        }
        if max_vertices >= RC_MESH_NULL_IDX as usize - 1 {
            return Err(PolygonMeshError::TooManyVertices {
                count: max_vertices,
            });
        }

        let mut builder = MeshBuilder {
            vertices: Vec::with_capacity(max_vertices),
            polygons: Vec::with_capacity(max_tris),
            regions: Vec::with_capacity(max_tris),
            areas: Vec::with_capacity(max_tris),
            nvp,
            max_polygons: max_tris,
        };
        let mut vertex_flags = Vec::with_capacity(max_vertices);
        let mut first_vertex = vec![None; VERTEX_BUCKET_COUNT];
        let mut next_vertex: Vec<Option<usize>> = Vec::with_capacity(max_vertices);

        let mut indices = Vec::new();
        let mut triangles = Vec::new();
        for (i, contour) in contour_set.contours.iter().enumerate() {
            // Skip null contours.
            if contour.vertices.len() < 3 {
                continue;
            }
            let points: Vec<IVec3> = contour
                .vertices
                .iter()
                .map(|(vertex, _)| grid::from_u16(*vertex))
                .collect();

            // Triangulate contour
            triangles.clear();
            if !triangulate(&points, &mut triangles) {
                // Bad triangulation, should not happen.
                stage_log(LogLevel::Warn, format!("Bad triangulation of contour {i}."));
            }

            // Add and merge vertices.
            indices.clear();
            for (vertex, flags) in &contour.vertices {
                let index = add_vertex(
                    *vertex,
                    &mut builder.vertices,
                    &mut first_vertex,
                    &mut next_vertex,
                );
                if index == vertex_flags.len() {
                    vertex_flags.push(false);
                }
                if flags.contains(RegionVertexId::BORDER_VERTEX) {
                    // This vertex should be removed.
                    vertex_flags[index] = true;
                }
                indices.push(index as u16);
            }

            // Build initial polygons.
            let mut polys: Vec<Vec<u16>> = triangles
                .iter()
                .filter(|[a, b, c]| a != b && a != c && b != c)
                .map(|&[a, b, c]| {
                    let mut poly = vec![RC_MESH_NULL_IDX; nvp];
                    poly[0] = indices[a];
                    poly[1] = indices[b];
                    poly[2] = indices[c];
                    poly
                })
                .collect();
            if polys.is_empty() {
                continue;
            }

            // Merge polygons.
            if nvp > 3 {
                merge_polygons(&mut polys, &builder.vertices, nvp, |_, _| {});
            }

            // Store polygons.
            for poly in polys {
                builder.push(poly, contour.region, contour.area)?;
            }
        }

        // Remove edge vertices.
        let mut i = 0;
        while i < builder.vertices.len() {
            if !vertex_flags[i] || !builder.can_remove_vertex(i as u16) {
                i += 1;
                continue;
            }
            builder.remove_vertex(i as u16)?;
            // Note: the vertex has already been removed from the mesh.
            vertex_flags.remove(i);
        }

        let polygon_count = builder.polygons.len();
        let mut polygon_neighbors = vec![RC_MESH_NULL_IDX; polygon_count * nvp];
        // Calculate adjacency.
        build_mesh_adjacency(
            &builder.polygons,
            builder.vertices.len(),
            nvp,
            &mut polygon_neighbors,
        );

        // Find portal edges
        if contour_set.border_size > 0 {
            let w = contour_set.width;
            let h = contour_set.height;
            for (i, poly) in builder.polygons.iter().enumerate() {
                let nv = count_poly_verts(poly);
                for j in 0..nv {
                    // Skip connected edges.
                    if polygon_neighbors[i * nvp + j] != RC_MESH_NULL_IDX {
                        continue;
                    }
                    let va = builder.vertices[poly[j] as usize];
                    let vb = builder.vertices[poly[next(j, nv)] as usize];
                    let portal = if va.x == 0 && vb.x == 0 {
                        Some(0)
                    } else if va.z == h && vb.z == h {
                        Some(1)
                    } else if va.x == w && vb.x == w {
                        Some(2)
                    } else if va.z == 0 && vb.z == 0 {
                        Some(3)
                    } else {
                        None
                    };
                    if let Some(dir) = portal {
                        polygon_neighbors[i * nvp + j] = RC_PORTAL_FLAG | dir;
                    }
                }
            }
        }

        if polygon_count > RC_MESH_NULL_IDX as usize - 1 {
            return Err(PolygonMeshError::TooManyPolygons {
                count: polygon_count,
                max: RC_MESH_NULL_IDX as usize - 1,
            });
        }

        Ok(PolygonNavmesh {
            vertices: builder.vertices,
            polygons: builder.polygons.into_iter().flatten().collect(),
            polygon_neighbors,
            regions: builder.regions,
            // Just allocate the mesh flags array. The user is responsible to fill it.
            flags: vec![0; polygon_count],
            areas: builder.areas,
            max_vertices_per_polygon: nvp,
            aabb: contour_set.aabb,
            cell_size: contour_set.cell_size,
            cell_height: contour_set.cell_height,
            border_size: contour_set.border_size,
            max_edge_error: contour_set.max_error,
        })
    }
}

impl ContourSet {
    /// Builds a polygon mesh from the provided contours.
    /// See [`PolygonNavmesh::from_contours`].
    ///
    /// # Errors
    ///
    /// Returns an error if the polygon mesh cannot be built.
    pub fn into_polygon_mesh(
        self,
        max_vertices_per_polygon: usize,
    ) -> Result<PolygonNavmesh, PolygonMeshError> {
        PolygonNavmesh::from_contours(&self, max_vertices_per_polygon)
    }
}

/// Errors that can occur when building a [`PolygonNavmesh`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolygonMeshError {
    /// The maximum number of vertices per polygon is too small.
    #[error("polygons need at least 3 vertices, but the maximum was set to {value}")]
    InvalidVerticesPerPolygon {
        /// The configured maximum
        value: usize,
    },
    /// The contours have more vertices than can be indexed.
    #[error("too many vertices: {count}")]
    TooManyVertices {
        /// Number of vertices
        count: usize,
    },
    /// More polygons were created than can be indexed.
    #[error("too many polygons: {count} (max: {max})")]
    TooManyPolygons {
        /// Number of polygons
        count: usize,
        /// Maximum number of polygons
        max: usize,
    },
}

/// The mutable state of a polygon mesh under construction.
struct MeshBuilder {
    vertices: Vec<U16Vec3>,
    polygons: Vec<Vec<u16>>,
    regions: Vec<RegionId>,
    areas: Vec<AreaType>,
    nvp: usize,
    max_polygons: usize,
}

impl MeshBuilder {
    fn push(&mut self, poly: Vec<u16>, region: RegionId, area: AreaType) -> Result<(), PolygonMeshError> {
        if self.polygons.len() >= self.max_polygons {
            return Err(PolygonMeshError::TooManyPolygons {
                count: self.polygons.len() + 1,
                max: self.max_polygons,
            });
        }
        self.polygons.push(poly);
        self.regions.push(region);
        self.areas.push(area);
        Ok(())
    }

    fn can_remove_vertex(&self, rem: u16) -> bool {
        // Count number of polygons to remove.
        let mut num_touched_verts = 0;
        let mut num_remaining_edges = 0;
        for poly in &self.polygons {
            let nv = count_poly_verts(poly);
            let num_removed = poly[..nv].iter().filter(|&&v| v == rem).count();
            if num_removed > 0 {
                num_touched_verts += num_removed;
                num_remaining_edges += nv - (num_removed + 1);
            }
        }

        // There would be too few edges remaining to create a polygon.
        // This can happen for example when a tip of a triangle is marked
        // as deletion, but there are no other polys that share the vertex.
        // In this case, the vertex should not be removed.
        if num_remaining_edges <= 2 {
            return false;
        }

        // Find edges which share the removed vertex.
        // (the other vertex of the edge, share count)
        let mut edges: Vec<(u16, u32)> = Vec::with_capacity(num_touched_verts * 2);
        for poly in &self.polygons {
            let nv = count_poly_verts(poly);
            // Collect edges which touches the removed vertex.
            for j in 0..nv {
                let k = prev(j, nv);
                if poly[j] != rem && poly[k] != rem {
                    continue;
                }
                // Arrange edge so that a=rem.
                let b = if poly[k] == rem { poly[j] } else { poly[k] };
                // Check if the edge exists
                match edges.iter_mut().find(|(other, _)| *other == b) {
                    // Exists, increment vertex share count.
                    Some((_, count)) => *count += 1,
                    // Add new edge.
                    None => edges.push((b, 1)),
                }
            }
        }

        // There should be no more than 2 open edges.
        // This catches the case that two non-adjacent polygons
        // share the removed vertex. In that case, do not remove the vertex.
        let num_open_edges = edges.iter().filter(|(_, count)| *count < 2).count();
        num_open_edges <= 2
    }

    fn remove_vertex(&mut self, rem: u16) -> Result<(), PolygonMeshError> {
        let nvp = self.nvp;

        // Collect edges which do not touch the removed vertex: (from, to, region, area)
        let mut edges: Vec<(u16, u16, RegionId, AreaType)> = Vec::new();
        let mut i = 0;
        while i < self.polygons.len() {
            let poly = &self.polygons[i];
            let nv = count_poly_verts(poly);
            if !poly[..nv].contains(&rem) {
                i += 1;
                continue;
            }
            for j in 0..nv {
                let k = prev(j, nv);
                if poly[j] != rem && poly[k] != rem {
                    edges.push((poly[k], poly[j], self.regions[i], self.areas[i]));
                }
            }
            // Remove the polygon.
            self.polygons.swap_remove(i);
            self.regions.swap_remove(i);
            self.areas.swap_remove(i);
        }

        // Remove vertex.
        self.vertices.remove(rem as usize);

        // Adjust indices to match the removed vertex layout.
        for poly in &mut self.polygons {
            for v in poly.iter_mut() {
                if *v != RC_MESH_NULL_IDX && *v > rem {
                    *v -= 1;
                }
            }
        }
        for (a, b, _, _) in &mut edges {
            if *a > rem {
                *a -= 1;
            }
            if *b > rem {
                *b -= 1;
            }
        }

        if edges.is_empty() {
            return Ok(());
        }

        // Start with one vertex, keep appending connected
        // segments to the start and end of the hole.
        let mut hole = std::collections::VecDeque::new();
        let mut hole_regions = std::collections::VecDeque::new();
        let mut hole_areas = std::collections::VecDeque::new();
        let (first_a, _, first_region, first_area) = edges[0];
        hole.push_back(first_a);
        hole_regions.push_back(first_region);
        hole_areas.push_back(first_area);

        while !edges.is_empty() {
            let mut matched = false;
            let mut i = 0;
            while i < edges.len() {
                let (ea, eb, region, area) = edges[i];
                let added = if hole.front() == Some(&eb) {
                    // The segment matches the beginning of the hole boundary.
                    hole.push_front(ea);
                    hole_regions.push_front(region);
                    hole_areas.push_front(area);
                    true
                } else if hole.back() == Some(&ea) {
                    // The segment matches the end of the hole boundary.
                    hole.push_back(eb);
                    hole_regions.push_back(region);
                    hole_areas.push_back(area);
                    true
                } else {
                    false
                };
                if added {
                    // The edge segment was added, remove it.
                    edges.swap_remove(i);
                    matched = true;
                } else {
                    i += 1;
                }
            }
            if !matched {
                break;
            }
        }

        let hole: Vec<u16> = hole.into();
        let hole_regions: Vec<RegionId> = hole_regions.into();
        let hole_areas: Vec<AreaType> = hole_areas.into();

        // Generate temp vertex array for triangulation.
        let points: Vec<IVec3> = hole
            .iter()
            .map(|&v| grid::from_u16(self.vertices[v as usize]))
            .collect();

        // Triangulate the hole.
        let mut triangles = Vec::new();
        if !triangulate(&points, &mut triangles) {
            stage_log(
                LogLevel::Warn,
                format!("Triangulating the hole of removed vertex {rem} returned bad results."),
            );
        }

        // Merge the hole triangles back to polygons.
        let mut polys = Vec::with_capacity(triangles.len());
        let mut poly_regions = Vec::with_capacity(triangles.len());
        let mut poly_areas = Vec::with_capacity(triangles.len());
        // Build initial polygons.
        for &[a, b, c] in &triangles {
            if a == b || a == c || b == c {
                continue;
            }
            let mut poly = vec![RC_MESH_NULL_IDX; nvp];
            poly[0] = hole[a];
            poly[1] = hole[b];
            poly[2] = hole[c];
            polys.push(poly);
            // If this polygon covers multiple region types then mark it as such
            let region = if hole_regions[a] != hole_regions[b] || hole_regions[b] != hole_regions[c]
            {
                MULTIPLE_REGIONS
            } else {
                hole_regions[a]
            };
            poly_regions.push(region);
            poly_areas.push(hole_areas[a]);
        }
        if polys.is_empty() {
            return Ok(());
        }

        // Merge polygons.
        if nvp > 3 {
            merge_polygons(&mut polys, &self.vertices, nvp, |kept, removed| {
                if poly_regions[kept] != poly_regions[removed] {
                    poly_regions[kept] = MULTIPLE_REGIONS;
                }
                poly_regions.swap_remove(removed);
                poly_areas.swap_remove(removed);
            });
        }

        // Store polygons.
        for ((poly, region), area) in polys.into_iter().zip(poly_regions).zip(poly_areas) {
            self.push(poly, region, area)?;
        }
        Ok(())
    }
}

#[inline]
fn count_poly_verts(poly: &[u16]) -> usize {
    poly.iter()
        .position(|&v| v == RC_MESH_NULL_IDX)
        .unwrap_or(poly.len())
}

fn compute_vertex_hash(x: u16, y: u16, z: u16) -> usize {
    const H1: u32 = 0x8da6b343; // Large multiplicative constants;
    const H2: u32 = 0xd8163841; // here arbitrarily chosen primes
    const H3: u32 = 0xcb1ab31f;
    let n = H1
        .wrapping_mul(x as u32)
        .wrapping_add(H2.wrapping_mul(y as u32))
        .wrapping_add(H3.wrapping_mul(z as u32));
    n as usize & (VERTEX_BUCKET_COUNT - 1)
}

/// Adds a vertex to the mesh, reusing an existing one at the same xz-position within 2 cells in height.
fn add_vertex(
    vertex: U16Vec3,
    vertices: &mut Vec<U16Vec3>,
    first_vertex: &mut [Option<usize>],
    next_vertex: &mut Vec<Option<usize>>,
) -> usize {
    let bucket = compute_vertex_hash(vertex.x, 0, vertex.z);
    let mut i = first_vertex[bucket];
    while let Some(index) = i {
        let v = vertices[index];
        if v.x == vertex.x && v.y.abs_diff(vertex.y) <= 2 && v.z == vertex.z {
            return index;
        }
        // next
        i = next_vertex[index];
    }

    // Could not find, create new.
    let index = vertices.len();
    vertices.push(vertex);
    next_vertex.push(first_vertex[bucket]);
    first_vertex[bucket] = Some(index);
    index
}

/// Greedily merges polygons into convex polygons of at most `nvp` vertices.
/// `on_merge(kept, removed)` is called after polygon `removed` was merged into `kept`
/// and before `removed` is swap-removed from `polys`.
fn merge_polygons(
    polys: &mut Vec<Vec<u16>>,
    vertices: &[U16Vec3],
    nvp: usize,
    mut on_merge: impl FnMut(usize, usize),
) {
    loop {
        // Find best polygons to merge.
        let mut best: Option<(MergeValue, usize, usize, usize, usize)> = None;
        for j in 0..polys.len().saturating_sub(1) {
            for k in j + 1..polys.len() {
                let Some((value, ea, eb)) = poly_merge_value(&polys[j], &polys[k], vertices, nvp)
                else {
                    continue;
                };
                if best.is_none_or(|(best_value, ..)| value > best_value) {
                    best = Some((value, j, k, ea, eb));
                }
            }
        }

        let Some((_, pa, pb, ea, eb)) = best else {
            break;
        };
        // Found best, merge.
        polys[pa] = merge_poly_verts(&polys[pa], &polys[pb], ea, eb, nvp);
        on_merge(pa, pb);
        polys.swap_remove(pb);
    }
}

/// Merged polygon area, then squared length of the shared edge. Larger is better.
type MergeValue = (i32, i32);

/// Returns how good it would be to merge the two polygons, together with the shared edge of each.
/// `None` if they cannot be merged into a convex polygon of at most `nvp` vertices.
fn poly_merge_value(
    pa: &[u16],
    pb: &[u16],
    vertices: &[U16Vec3],
    nvp: usize,
) -> Option<(MergeValue, usize, usize)> {
    let na = count_poly_verts(pa);
    let nb = count_poly_verts(pb);

    // If the merged polygon would be too big, do not merge.
    if na + nb - 2 > nvp {
        return None;
    }

    // Check if the polygons share an edge.
    let ordered = |a: u16, b: u16| if a > b { (b, a) } else { (a, b) };
    let (ea, eb) = (0..na).find_map(|i| {
        let edge_a = ordered(pa[i], pa[(i + 1) % na]);
        (0..nb)
            .find(|&j| ordered(pb[j], pb[(j + 1) % nb]) == edge_a)
            .map(|j| (i, j))
    })?;

    // Check to see if the merged polygon would be convex.
    let v = |index: u16| grid::from_u16(vertices[index as usize]);
    if !grid::left(v(pa[(ea + na - 1) % na]), v(pa[ea]), v(pb[(eb + 2) % nb])) {
        return None;
    }
    if !grid::left(v(pb[(eb + nb - 1) % nb]), v(pb[eb]), v(pa[(ea + 2) % na])) {
        return None;
    }

    let a = v(pa[ea]);
    let b = v(pa[(ea + 1) % na]);
    let dx = a.x - b.x;
    let dz = a.z - b.z;
    let area = polygon_area2(&pa[..na], vertices) + polygon_area2(&pb[..nb], vertices);
    Some(((area, dx * dx + dz * dz), ea, eb))
}

/// Twice the unsigned area of a polygon on the xz-plane.
fn polygon_area2(poly: &[u16], vertices: &[U16Vec3]) -> i32 {
    let n = poly.len();
    let a = grid::from_u16(vertices[poly[0] as usize]);
    let area: i32 = (1..n.saturating_sub(1))
        .map(|i| {
            let b = grid::from_u16(vertices[poly[i] as usize]);
            let c = grid::from_u16(vertices[poly[i + 1] as usize]);
            grid::area2(a, b, c)
        })
        .sum();
    area.abs()
}

fn merge_poly_verts(pa: &[u16], pb: &[u16], ea: usize, eb: usize, nvp: usize) -> Vec<u16> {
    let na = count_poly_verts(pa);
    let nb = count_poly_verts(pb);
    let mut merged = Vec::with_capacity(nvp);
    // Add pa
    merged.extend((0..na - 1).map(|i| pa[(ea + 1 + i) % na]));
    // Add pb
    merged.extend((0..nb - 1).map(|i| pb[(eb + 1 + i) % nb]));
    merged.resize(nvp, RC_MESH_NULL_IDX);
    merged
}

/// Ear-clips the polygon `verts` into `triangles`, indexing into `verts`.
/// Returns `false` if the polygon could not be fully triangulated, in which case
/// `triangles` holds the triangles found so far.
pub(crate) fn triangulate(verts: &[IVec3], triangles: &mut Vec<[usize; 3]>) -> bool {
    // (vertex index, whether the vertex is the tip of an ear)
    let mut indices: Vec<(usize, bool)> = (0..verts.len()).map(|i| (i, false)).collect();
    let mut n = indices.len();
    if n < 3 {
        return false;
    }

    for i in 0..n {
        let i1 = next(i, n);
        let i2 = next(i1, n);
        if diagonal(i, i2, verts, &indices) {
            indices[i1].1 = true;
        }
    }

    while n > 3 {
        let mut min_len = None;
        let mut min_i = None;
        for i in 0..n {
            let i1 = next(i, n);
            if indices[i1].1 {
                let p0 = verts[indices[i].0];
                let p2 = verts[indices[next(i1, n)].0];
                let len = (p2.x - p0.x).pow(2) + (p2.z - p0.z).pow(2);
                if min_len.is_none_or(|min_len| len < min_len) {
                    min_len = Some(len);
                    min_i = Some(i);
                }
            }
        }

        if min_i.is_none() {
            // We might get here because the contour has overlapping segments, like this:
            //
            //  A o-o=====o---o B
            //   /  |C   D|    \.
            //  o   o     o     o
            //  :   :     :     :
            // We'll try to recover by loosing up the inCone test a bit so that a diagonal
            // like A-B or C-D can be found and we can continue.
            for i in 0..n {
                let i1 = next(i, n);
                let i2 = next(i1, n);
                if diagonal_loose(i, i2, verts, &indices) {
                    let p0 = verts[indices[i].0];
                    let p2 = verts[indices[i2].0];
                    let len = (p2.x - p0.x).pow(2) + (p2.z - p0.z).pow(2);
                    if min_len.is_none_or(|min_len| len < min_len) {
                        min_len = Some(len);
                        min_i = Some(i);
                    }
                }
            }
        }

        let Some(i) = min_i else {
            // The contour is messed up. This sometimes happens
            // if the contour simplification is too aggressive.
            return false;
        };
        let mut i1 = next(i, n);
        let i2 = next(i1, n);

        triangles.push([indices[i].0, indices[i1].0, indices[i2].0]);

        // Removes P[i1] by copying P[i+1]...P[n-1] left one index.
        indices.remove(i1);
        n -= 1;
        if i1 >= n {
            i1 = 0;
        }
        let i = prev(i1, n);

        // Update diagonal flags.
        indices[i].1 = diagonal(prev(i, n), i1, verts, &indices);
        indices[i1].1 = diagonal(i, next(i1, n), verts, &indices);
    }

    // Append the remaining triangle.
    triangles.push([indices[0].0, indices[1].0, indices[2].0]);
    true
}

/// Returns true iff the diagonal (i,j) is strictly internal to the
/// polygon P in the neighborhood of the i endpoint.
fn in_cone(i: usize, j: usize, verts: &[IVec3], indices: &[(usize, bool)]) -> bool {
    let n = indices.len();
    let pi = verts[indices[i].0];
    let pj = verts[indices[j].0];
    let pi1 = verts[indices[next(i, n)].0];
    let pin1 = verts[indices[prev(i, n)].0];

    // If P[i] is a convex vertex [ i+1 left or on (i-1,i) ].
    if grid::left_on(pin1, pi, pi1) {
        return grid::left(pi, pj, pin1) && grid::left(pj, pi, pi1);
    }
    // Assume (i-1,i,i+1) not collinear.
    // else P[i] is reflex.
    !(grid::left_on(pi, pj, pi1) && grid::left_on(pj, pi, pin1))
}

fn in_cone_loose(i: usize, j: usize, verts: &[IVec3], indices: &[(usize, bool)]) -> bool {
    let n = indices.len();
    let pi = verts[indices[i].0];
    let pj = verts[indices[j].0];
    let pi1 = verts[indices[next(i, n)].0];
    let pin1 = verts[indices[prev(i, n)].0];

    // If P[i] is a convex vertex [ i+1 left or on (i-1,i) ].
    if grid::left_on(pin1, pi, pi1) {
        return grid::left_on(pi, pj, pin1) && grid::left_on(pj, pi, pi1);
    }
    // Assume (i-1,i,i+1) not collinear.
    // else P[i] is reflex.
    !(grid::left_on(pi, pj, pi1) && grid::left_on(pj, pi, pin1))
}

/// Returns true iff (v_i, v_j) is a proper internal *or* external
/// diagonal of P, *ignoring edges incident to v_i and v_j*.
fn diagonalie(
    i: usize,
    j: usize,
    verts: &[IVec3],
    indices: &[(usize, bool)],
    intersects: fn(IVec3, IVec3, IVec3, IVec3) -> bool,
) -> bool {
    let n = indices.len();
    let d0 = verts[indices[i].0];
    let d1 = verts[indices[j].0];

    // For each edge (k,k+1) of P
    (0..n).all(|k| {
        let k1 = next(k, n);
        // Skip edges incident to i or j
        if k == i || k1 == i || k == j || k1 == j {
            return true;
        }
        let p0 = verts[indices[k].0];
        let p1 = verts[indices[k1].0];
        if grid::equal_xz(d0, p0)
            || grid::equal_xz(d1, p0)
            || grid::equal_xz(d0, p1)
            || grid::equal_xz(d1, p1)
        {
            return true;
        }
        !intersects(d0, d1, p0, p1)
    })
}

/// Returns true iff (v_i, v_j) is a proper internal diagonal of P.
fn diagonal(i: usize, j: usize, verts: &[IVec3], indices: &[(usize, bool)]) -> bool {
    in_cone(i, j, verts, indices) && diagonalie(i, j, verts, indices, grid::intersect)
}

fn diagonal_loose(i: usize, j: usize, verts: &[IVec3], indices: &[(usize, bool)]) -> bool {
    in_cone_loose(i, j, verts, indices) && diagonalie(i, j, verts, indices, grid::intersect_prop)
}

/// Fills `neighbors` with the index of the polygon sharing each polygon edge.
fn build_mesh_adjacency(
    polygons: &[Vec<u16>],
    vertex_count: usize,
    nvp: usize,
    neighbors: &mut [u16],
) {
    struct Edge {
        vert: [u16; 2],
        poly_edge: [usize; 2],
        poly: [usize; 2],
    }

    let edge_vertices = |poly: &[u16], j: usize| {
        let v0 = poly[j];
        let v1 = if j + 1 >= nvp || poly[j + 1] == RC_MESH_NULL_IDX {
            poly[0]
        } else {
            poly[j + 1]
        };
        (v0, v1)
    };

    let mut edges: Vec<Edge> = Vec::with_capacity(polygons.len() * nvp);
    let mut edges_by_vertex: Vec<Vec<usize>> = vec![Vec::new(); vertex_count];

    for (i, poly) in polygons.iter().enumerate() {
        for j in 0..count_poly_verts(poly) {
            let (v0, v1) = edge_vertices(poly, j);
            if v0 < v1 {
                // Insert edge
                edges_by_vertex[v0 as usize].push(edges.len());
                edges.push(Edge {
                    vert: [v0, v1],
                    poly: [i, i],
                    poly_edge: [j, 0],
                });
            }
        }
    }

    for (i, poly) in polygons.iter().enumerate() {
        for j in 0..count_poly_verts(poly) {
            let (v0, v1) = edge_vertices(poly, j);
            if v0 <= v1 {
                continue;
            }
            for &e in &edges_by_vertex[v1 as usize] {
                let edge = &mut edges[e];
                if edge.vert[1] == v0 && edge.poly[0] == edge.poly[1] {
                    edge.poly[1] = i;
                    edge.poly_edge[1] = j;
                    break;
                }
            }
        }
    }

    // Store adjacency
    for edge in &edges {
        if edge.poly[0] != edge.poly[1] {
            neighbors[edge.poly[0] * nvp + edge.poly_edge[0]] = edge.poly[1] as u16;
            neighbors[edge.poly[1] * nvp + edge.poly_edge[1]] = edge.poly[0] as u16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compact_heightfield::tests::flat_compact_heightfield,
        contours::{BuildContoursFlags, Contour},
    };

    fn contour_set(vertices: &[(u16, u16, RegionVertexId)]) -> ContourSet {
        ContourSet {
            contours: vec![Contour {
                vertices: vertices
                    .iter()
                    .map(|&(x, z, flags)| (U16Vec3::new(x, 1, z), flags))
                    .collect(),
                raw_vertices: Vec::new(),
                region: RegionId::from(1),
                area: AreaType(1),
            }],
            aabb: Aabb3d::new([0.0, 0.0, 0.0], [4.0, 4.0, 4.0]),
            cell_size: 1.0,
            cell_height: 1.0,
            width: 4,
            height: 4,
            border_size: 0,
            max_error: 1.3,
        }
    }

    #[track_caller]
    fn assert_polygon_bounds(mesh: &PolygonNavmesh) {
        for i in 0..mesh.polygon_count() {
            let count = mesh.polygon_vertex_count(i);
            assert!((3..=mesh.max_vertices_per_polygon).contains(&count));
        }
    }

    const NONE: RegionVertexId = RegionVertexId::NONE;

    #[test]
    fn square_becomes_a_single_quad() {
        let cset = contour_set(&[(0, 0, NONE), (0, 4, NONE), (4, 4, NONE), (4, 0, NONE)]);
        let mesh = cset.into_polygon_mesh(6).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.polygon_count(), 1);
        assert_eq!(mesh.polygon_vertex_count(0), 4);
        assert!(mesh.neighbors(0).iter().all(|&n| n == RC_MESH_NULL_IDX));
        assert_eq!(mesh.regions, vec![RegionId::from(1)]);
        assert_eq!(mesh.areas, vec![AreaType(1)]);
        assert_eq!(mesh.flags, vec![0]);
        assert_polygon_bounds(&mesh);
    }

    #[test]
    fn triangles_stay_triangles_and_are_adjacent() {
        let cset = contour_set(&[(0, 0, NONE), (0, 4, NONE), (4, 4, NONE), (4, 0, NONE)]);
        let mesh = cset.into_polygon_mesh(3).unwrap();
        assert_eq!(mesh.polygon_count(), 2);
        assert!(mesh.neighbors(0).contains(&1));
        assert!(mesh.neighbors(1).contains(&0));
        assert_polygon_bounds(&mesh);
    }

    #[test]
    fn border_vertices_are_removed() {
        let cset = contour_set(&[
            (0, 0, NONE),
            (0, 4, NONE),
            (4, 4, NONE),
            (4, 2, RegionVertexId::BORDER_VERTEX),
            (4, 0, NONE),
        ]);
        let mesh = cset.into_polygon_mesh(6).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert!(!mesh.vertices.contains(&U16Vec3::new(4, 1, 2)));
        assert_eq!(mesh.polygon_count(), 1);
        assert_eq!(mesh.polygon_vertex_count(0), 4);
        assert_polygon_bounds(&mesh);
    }

    #[test]
    fn rejects_too_few_vertices_per_polygon() {
        let cset = contour_set(&[(0, 0, NONE), (0, 4, NONE), (4, 4, NONE)]);
        assert_eq!(
            cset.into_polygon_mesh(2),
            Err(PolygonMeshError::InvalidVerticesPerPolygon { value: 2 })
        );
    }

    #[test]
    fn neighboring_regions_share_an_edge() {
        let mut compact = flat_compact_heightfield(8);
        for z in 0..8 {
            for x in 4..8 {
                let i = compact.cell_at(x, z).index() as usize;
                compact.areas[i] = AreaType(2);
            }
        }
        compact.build_regions_monotone(0, 0, 0).unwrap();
        let mesh = compact
            .build_contours(1.3, 0, BuildContoursFlags::DEFAULT)
            .unwrap()
            .into_polygon_mesh(6)
            .unwrap();
        assert_eq!(mesh.polygon_count(), 2);
        // The shared corners are deduplicated.
        assert_eq!(mesh.vertices.len(), 6);
        assert!(mesh.neighbors(0).contains(&1));
        assert!(mesh.neighbors(1).contains(&0));
        assert_ne!(mesh.areas[0], mesh.areas[1]);
        assert_polygon_bounds(&mesh);
    }

    #[test]
    fn concave_outline_is_triangulated() {
        // An L-shape
        let points: Vec<IVec3> = [(0, 0), (0, 4), (2, 4), (2, 2), (4, 2), (4, 0)]
            .iter()
            .map(|&(x, z)| IVec3::new(x, 0, z))
            .collect();
        let mut triangles = Vec::new();
        assert!(triangulate(&points, &mut triangles));
        assert_eq!(triangles.len(), 4);
        let area: i32 = triangles
            .iter()
            .map(|&[a, b, c]| grid::area2(points[a], points[b], points[c]).abs())
            .sum();
        // Twice the area of the L-shape.
        assert_eq!(area, 24);
    }
}
