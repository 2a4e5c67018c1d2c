use glam::U16Vec3;
use thiserror::Error;

use crate::{
    Aabb3d, AreaType, CompactHeightfield, LogLevel, RegionId,
    context::stage_log,
    math::{distance_squared_between_point_and_segment_grid, grid, next, prev},
};

impl CompactHeightfield {
    /// The raw contours will match the region outlines exactly. The `max_error` and `max_edge_len`
    /// parameters control how closely the simplified contours will match the raw contours.
    ///
    /// Simplified contours are generated such that the vertices for portals between areas match up.
    /// (They are considered mandatory vertices.)
    ///
    /// Setting `max_edge_len` to zero will disabled the edge length feature.
    ///
    /// Holes in a region are merged into the outline of that region, so each region is described by
    /// at most one contour.
    ///
    /// # Errors
    ///
    /// Returns an error if a region outline cannot be walked because the span connections are inconsistent.
    pub fn build_contours(
        &self,
        max_error: f32,
        max_edge_len: u16,
        build_flags: BuildContoursFlags,
    ) -> Result<ContourSet, ContourError> {
        let border_size = self.border_size;
        let mut cset = ContourSet {
            contours: Vec::with_capacity(self.max_region.bits().max(8) as usize),
            aabb: self.aabb,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            width: self.width.saturating_sub(border_size * 2),
            height: self.height.saturating_sub(border_size * 2),
            border_size,
            max_error,
        };
        if border_size > 0 {
            // If the heightfield was built with border_size, remove the offset
            let pad = border_size as f32 * self.cell_size;
            cset.aabb.min.x += pad;
            cset.aabb.min.z += pad;
            cset.aabb.max.x -= pad;
            cset.aabb.max.z -= pad;
        }

        let mut flags = vec![0_u8; self.spans.len()];

        // Mark boundaries
        for z in 0..self.height {
            for x in 0..self.width {
                for i in self.cell_at(x, z).index_range() {
                    let region = self.spans[i].region;
                    if !region.is_regular() {
                        flags[i] = 0;
                        continue;
                    }
                    let mut res = 0;
                    for dir in 0..4 {
                        let neighbor_region = self
                            .neighbor_index(x as i32, z as i32, i, dir)
                            .map_or(RegionId::NONE, |a_i| self.spans[a_i].region);
                        if neighbor_region == region {
                            res |= 1 << dir;
                        }
                    }
                    // Inverse, mark non connected edges.
                    flags[i] = res ^ 0xf;
                }
            }
        }

        let mut verts = Vec::with_capacity(256);
        let mut simplified = Vec::with_capacity(64);

        for z in 0..self.height {
            for x in 0..self.width {
                for i in self.cell_at(x, z).index_range() {
                    if flags[i] == 0 || flags[i] == 0xf {
                        flags[i] = 0;
                        continue;
                    }
                    let region = self.spans[i].region;
                    if !region.is_regular() {
                        continue;
                    }
                    let area = self.areas[i];

                    verts.clear();
                    simplified.clear();

                    self.walk_contour(x, z, i, &mut flags, &mut verts)?;
                    simplify_contour(
                        &verts,
                        &mut simplified,
                        max_error,
                        max_edge_len,
                        build_flags,
                    );
                    remove_degenerate_segments(&mut simplified);

                    if simplified.len() < 3 {
                        stage_log(LogLevel::Warn, format!(
                            "Dropping degenerate contour of region {} with {} vertices.",
                            region.bits(),
                            simplified.len()
                        ));
                        continue;
                    }

                    let remove_offset = |(vertex, flags): &(U16Vec3, RegionVertexId)| {
                        let vertex = U16Vec3::new(
                            vertex.x.saturating_sub(border_size),
                            vertex.y,
                            vertex.z.saturating_sub(border_size),
                        );
                        (vertex, *flags)
                    };
                    cset.contours.push(Contour {
                        vertices: simplified.iter().map(remove_offset).collect(),
                        raw_vertices: verts.iter().map(remove_offset).collect(),
                        region,
                        area,
                    });
                }
            }
        }

        cset.merge_holes(self.max_region);
        Ok(cset)
    }

    fn walk_contour(
        &self,
        mut x: u16,
        mut z: u16,
        mut i: usize,
        flags: &mut [u8],
        points: &mut Vec<(U16Vec3, RegionVertexId)>,
    ) -> Result<(), ContourError> {
        // Choose the first non-connected edge
        let mut dir = 0;
        while flags[i] & (1 << dir) == 0 {
            dir += 1;
        }

        let start_dir = dir;
        let start_i = i;
        let area = self.areas[i];

        for _ in 0..40_000 {
            if flags[i] & (1 << dir) != 0 {
                // Choose the edge corner
                let (p_y, is_border_vertex) = self.get_corner_height(x, z, i, dir);
                let (p_x, p_z) = match dir {
                    0 => (x, z + 1),
                    1 => (x + 1, z + 1),
                    2 => (x + 1, z),
                    _ => (x, z),
                };
                let mut r = RegionVertexId::NONE;
                if let Some(a_i) = self.neighbor_index(x as i32, z as i32, i, dir) {
                    r = RegionVertexId::from(self.spans[a_i].region);
                    if area != self.areas[a_i] {
                        r |= RegionVertexId::AREA_BORDER;
                    }
                }
                if is_border_vertex {
                    r |= RegionVertexId::BORDER_VERTEX;
                }
                points.push((U16Vec3::new(p_x, p_y, p_z), r));

                // Remove visited edges
                flags[i] &= !(1 << dir);
                // Rotate clockwise
                dir = (dir + 1) & 0x3;
            } else {
                let Some(con) = self.spans[i].con(dir) else {
                    return Err(ContourError::WalkFailed { x, z, dir });
                };
                let (n_x, n_z, n_i) = self.con_indices(x as i32, z as i32, dir, con);
                x = n_x as u16;
                z = n_z as u16;
                i = n_i;
                // Rotate counterclockwise
                dir = (dir + 3) & 0x3;
            }
            if start_i == i && start_dir == dir {
                break;
            }
        }
        Ok(())
    }

    fn get_corner_height(&self, x: u16, z: u16, i: usize, dir: u8) -> (u16, bool) {
        let span = &self.spans[i];
        let mut corner_height = span.y;
        let dir_p = (dir + 1) & 0x3;

        // Combine region and area codes in order to prevent
        // border vertices which are in between two areas to be removed.
        let region_and_area =
            |i: usize| self.spans[i].region.bits() as u32 | ((self.areas[i].0 as u32) << 16);
        let mut regs = [0_u32; 4];
        regs[0] = region_and_area(i);

        let (x, z) = (x as i32, z as i32);
        if let Some(con) = span.con(dir) {
            let (a_x, a_z, a_i) = self.con_indices(x, z, dir, con);
            corner_height = corner_height.max(self.spans[a_i].y);
            regs[1] = region_and_area(a_i);
            if let Some(b_i) = self.neighbor_index(a_x, a_z, a_i, dir_p) {
                corner_height = corner_height.max(self.spans[b_i].y);
                regs[2] = region_and_area(b_i);
            }
        }
        if let Some(con) = span.con(dir_p) {
            let (a_x, a_z, a_i) = self.con_indices(x, z, dir_p, con);
            corner_height = corner_height.max(self.spans[a_i].y);
            regs[3] = region_and_area(a_i);
            if let Some(b_i) = self.neighbor_index(a_x, a_z, a_i, dir) {
                corner_height = corner_height.max(self.spans[b_i].y);
                regs[2] = region_and_area(b_i);
            }
        }

        // Check if the vertex is special edge vertex, these vertices will be removed later.
        let border = RegionId::BORDER_REGION.bits() as u32;
        let is_border_vertex = (0..4).any(|j| {
            let a = regs[j];
            let b = regs[(j + 1) & 0x3];
            let c = regs[(j + 2) & 0x3];
            let d = regs[(j + 3) & 0x3];

            // The vertex is a border vertex there are two same exterior cells in a row,
            // followed by two interior cells and none of the regions are out of bounds.
            let two_same_exts = (a & b & border) != 0 && a == b;
            let two_ints = ((c | d) & border) == 0;
            let ints_same_area = (c >> 16) == (d >> 16);
            let no_zeros = a != 0 && b != 0 && c != 0 && d != 0;
            two_same_exts && two_ints && ints_same_area && no_zeros
        });
        (corner_height, is_border_vertex)
    }
}

/// Simplifies the raw outline `points` into `simplified`.
/// Each simplified vertex is stored with the flags it carries in the final contour.
fn simplify_contour(
    points: &[(U16Vec3, RegionVertexId)],
    simplified: &mut Vec<(U16Vec3, RegionVertexId)>,
    max_error: f32,
    max_edge_len: u16,
    flags: BuildContoursFlags,
) {
    // Vertices with the index of the raw point they come from.
    let mut indexed: Vec<(U16Vec3, usize)> = Vec::with_capacity(simplified.capacity());
    let region_of = |i: usize| points[i].1 & RegionVertexId::REGION_MASK;
    let is_area_border = |i: usize| points[i].1.contains(RegionVertexId::AREA_BORDER);

    // Add initial points.
    let has_connections = (0..points.len()).any(|i| !region_of(i).is_empty());
    if has_connections {
        // The contour has some portals to other regions.
        // Add a new point to every location where the region changes.
        let ni = points.len();
        for (i, (point, _)) in points.iter().enumerate() {
            let ii = (i + 1) % ni;
            let different_regs = region_of(i) != region_of(ii);
            let area_borders = is_area_border(i) != is_area_border(ii);
            if different_regs || area_borders {
                indexed.push((*point, i));
            }
        }
    }

    if indexed.is_empty() {
        // If there is no connections at all,
        // create some initial points for the simplification process.
        // Find lower-left and upper-right vertices of the contour.
        let mut lower_left = 0;
        let mut upper_right = 0;
        for (i, (point, _)) in points.iter().enumerate() {
            let ll = points[lower_left].0;
            let ur = points[upper_right].0;
            if point.x < ll.x || (point.x == ll.x && point.z < ll.z) {
                lower_left = i;
            }
            if point.x > ur.x || (point.x == ur.x && point.z > ur.z) {
                upper_right = i;
            }
        }
        indexed.push((points[lower_left].0, lower_left));
        indexed.push((points[upper_right].0, upper_right));
    }

    // Add points until all raw points are within
    // error tolerance to the simplified shape.
    let pn = points.len();
    let max_error_sq = max_error * max_error;
    let mut i = 0;
    while i < indexed.len() {
        let ii = (i + 1) % indexed.len();

        let (a, a_i) = indexed[i];
        let (b, b_i) = indexed[ii];
        let (mut a, mut b) = ((a.x as i32, a.z as i32), (b.x as i32, b.z as i32));

        // Traverse the segment in lexilogical order so that the
        // max deviation is calculated similarly when traversing
        // opposite segments.
        let (mut ci, c_inc, end_i) = if b.0 > a.0 || (b.0 == a.0 && b.1 > a.1) {
            ((a_i + 1) % pn, 1, b_i)
        } else {
            std::mem::swap(&mut a, &mut b);
            ((b_i + pn - 1) % pn, pn - 1, a_i)
        };

        // Find maximum deviation from the segment.
        let mut max_d = 0.0;
        let mut max_i = None;
        // Tessellate only outer edges or edges between areas.
        if region_of(ci).is_empty() || is_area_border(ci) {
            while ci != end_i {
                let point = points[ci].0;
                let d = distance_squared_between_point_and_segment_grid(
                    (point.x as i32, point.z as i32),
                    (a, b),
                );
                if d > max_d {
                    max_d = d;
                    max_i = Some(ci);
                }
                ci = (ci + c_inc) % pn;
            }
        }

        // If the max deviation is larger than accepted error,
        // add new point, else continue to next segment.
        match max_i {
            Some(max_i) if max_d > max_error_sq => {
                indexed.insert(i + 1, (points[max_i].0, max_i));
            }
            _ => i += 1,
        }
    }

    // Split too long edges.
    let tessellate_walls = flags.contains(BuildContoursFlags::TESSELLATE_SOLID_WALL_EDGES);
    let tessellate_areas = flags.contains(BuildContoursFlags::TESSELLATE_AREA_EDGES);
    if max_edge_len > 0 && (tessellate_walls || tessellate_areas) {
        let max_edge_len_sq = max_edge_len as i32 * max_edge_len as i32;
        let mut i = 0;
        while i < indexed.len() {
            let ii = (i + 1) % indexed.len();

            let (a, a_i) = indexed[i];
            let (b, b_i) = indexed[ii];
            let (a, b) = ((a.x as i32, a.z as i32), (b.x as i32, b.z as i32));

            let ci = (a_i + 1) % pn;
            // Tessellate only outer edges or edges between areas.
            let tessellate = (tessellate_walls && region_of(ci).is_empty())
                || (tessellate_areas && is_area_border(ci));

            let mut max_i = None;
            if tessellate {
                let dx = b.0 - a.0;
                let dz = b.1 - a.1;
                if dx * dx + dz * dz > max_edge_len_sq {
                    // Round based on the segments in lexilogical order so that the
                    // max tesselation is consistent regardless in which direction
                    // segments are traversed.
                    let n = if b_i < a_i { b_i + pn - a_i } else { b_i - a_i };
                    if n > 1 {
                        max_i = Some(if b.0 > a.0 || (b.0 == a.0 && b.1 > a.1) {
                            (a_i + n / 2) % pn
                        } else {
                            (a_i + n.div_ceil(2)) % pn
                        });
                    }
                }
            }

            match max_i {
                Some(max_i) => indexed.insert(i + 1, (points[max_i].0, max_i)),
                None => i += 1,
            }
        }
    }

    // The edge vertex flag is take from the current raw point,
    // and the neighbour region is take from the next raw point.
    simplified.extend(indexed.iter().map(|&(vertex, raw_index)| {
        let neighbor = points[(raw_index + 1) % pn].1
            & (RegionVertexId::REGION_MASK | RegionVertexId::AREA_BORDER);
        let border = points[raw_index].1 & RegionVertexId::BORDER_VERTEX;
        (vertex, neighbor | border)
    }));
}

/// Remove adjacent vertices which are equal on xz-plane,
/// or else the triangulator will get confused.
fn remove_degenerate_segments(simplified: &mut Vec<(U16Vec3, RegionVertexId)>) {
    let mut i = 0;
    while i < simplified.len() {
        let ni = next(i, simplified.len());
        let (a, b) = (simplified[i].0, simplified[ni].0);
        if a.x == b.x && a.z == b.z {
            // Degenerate segment, remove.
            simplified.remove(i);
        }
        i += 1;
    }
}

/// Twice the signed area of the polygon on the xz-plane, rounded.
/// Positive for outlines and negative for holes.
fn calc_area_of_polygon_2d(vertices: &[(U16Vec3, RegionVertexId)]) -> i32 {
    let n = vertices.len();
    let area: i32 = (0..n)
        .map(|i| {
            let vi = grid::from_u16(vertices[i].0);
            let vj = grid::from_u16(vertices[prev(i, n)].0);
            vi.x * vj.z - vj.x * vi.z
        })
        .sum();
    (area + 1) / 2
}

/// Whether `pj` lies in the cone formed by the vertex `i` of the polygon and its two neighbors.
fn in_cone(i: usize, vertices: &[(U16Vec3, RegionVertexId)], pj: glam::IVec3) -> bool {
    let n = vertices.len();
    let pi = grid::from_u16(vertices[i].0);
    let pi1 = grid::from_u16(vertices[next(i, n)].0);
    let pin1 = grid::from_u16(vertices[prev(i, n)].0);

    // If P[i] is a convex vertex [ i+1 left or on (i-1,i) ].
    if grid::left_on(pin1, pi, pi1) {
        return grid::left(pi, pj, pin1) && grid::left(pj, pi, pi1);
    }
    // Assume (i-1,i,i+1) not collinear.
    // else P[i] is reflex.
    !(grid::left_on(pi, pj, pi1) && grid::left_on(pj, pi, pin1))
}

/// Whether the segment `d0 d1` crosses any edge of the contour not incident to vertex `skip`.
fn intersect_seg_contour(
    d0: glam::IVec3,
    d1: glam::IVec3,
    skip: Option<usize>,
    vertices: &[(U16Vec3, RegionVertexId)],
) -> bool {
    let n = vertices.len();
    // For each edge (k,k+1) of P
    (0..n).any(|k| {
        let k1 = next(k, n);
        // Skip edges incident to i.
        if skip == Some(k) || skip == Some(k1) {
            return false;
        }
        let p0 = grid::from_u16(vertices[k].0);
        let p1 = grid::from_u16(vertices[k1].0);
        if grid::equal_xz(d0, p0)
            || grid::equal_xz(d1, p0)
            || grid::equal_xz(d0, p1)
            || grid::equal_xz(d1, p1)
        {
            return false;
        }
        grid::intersect(d0, d1, p0, p1)
    })
}

/// Index of the lower-left vertex of the contour, with its coordinates.
fn find_left_most_vertex(vertices: &[(U16Vec3, RegionVertexId)]) -> (u16, u16, usize) {
    let mut min_x = vertices[0].0.x;
    let mut min_z = vertices[0].0.z;
    let mut left_most = 0;
    for (i, (vertex, _)) in vertices.iter().enumerate().skip(1) {
        if vertex.x < min_x || (vertex.x == min_x && vertex.z < min_z) {
            min_x = vertex.x;
            min_z = vertex.z;
            left_most = i;
        }
    }
    (min_x, min_z, left_most)
}

/// Splices `hole` into `outline` through the diagonal from `outline[ia]` to `hole[ib]`.
fn merge_contours(outline: &mut Contour, hole: &mut Contour, ia: usize, ib: usize) {
    let outline_len = outline.vertices.len();
    let hole_len = hole.vertices.len();
    let mut vertices = Vec::with_capacity(outline_len + hole_len + 2);

    // Copy contour A.
    vertices.extend((0..=outline_len).map(|i| outline.vertices[(ia + i) % outline_len]));
    // Copy contour B
    vertices.extend((0..=hole_len).map(|i| hole.vertices[(ib + i) % hole_len]));

    outline.vertices = vertices;
    hole.vertices.clear();
}

impl ContourSet {
    /// Merges every hole into the outline of its region.
    /// Contours that end up without vertices are removed from the set.
    fn merge_holes(&mut self, max_region: RegionId) {
        if self.contours.is_empty() {
            return;
        }

        // Calculate winding of all polygons.
        let winding: Vec<bool> = self
            .contours
            .iter()
            .map(|contour| calc_area_of_polygon_2d(&contour.vertices) >= 0)
            .collect();
        if winding.iter().all(|&is_outline| is_outline) {
            return;
        }

        // Collect outline contour and holes contours per region.
        // We assume that there is one outline and multiple holes.
        let region_count = max_region.bits() as usize + 1;
        let mut outlines: Vec<Option<usize>> = vec![None; region_count];
        let mut holes: Vec<Vec<usize>> = vec![Vec::new(); region_count];
        for (i, contour) in self.contours.iter().enumerate() {
            let region = contour.region.bits() as usize;
            if region >= region_count {
                continue;
            }
            if winding[i] {
                if outlines[region].is_some() {
                    stage_log(LogLevel::Error, format!("Multiple outlines for region {region}."));
                }
                outlines[region] = Some(i);
            } else {
                holes[region].push(i);
            }
        }

        // Finally merge each regions holes into the outline.
        for (region, holes) in holes.into_iter().enumerate() {
            if holes.is_empty() {
                continue;
            }
            let Some(outline) = outlines[region] else {
                stage_log(LogLevel::Error, format!(
                    "Bad outline for region {region}, contour simplification is likely too aggressive."
                ));
                continue;
            };
            self.merge_region_holes(outline, holes);
        }

        self.contours.retain(|contour| !contour.vertices.is_empty());
    }

    fn merge_region_holes(&mut self, outline: usize, holes: Vec<usize>) {
        // Sort holes from left to right.
        let mut holes: Vec<(u16, u16, usize, usize)> = holes
            .into_iter()
            .map(|hole| {
                let (min_x, min_z, left_most) = find_left_most_vertex(&self.contours[hole].vertices);
                (min_x, min_z, left_most, hole)
            })
            .collect();
        holes.sort_by_key(|&(min_x, min_z, _, _)| (min_x, min_z));

        let mut diagonals: Vec<(usize, i32)> = Vec::new();

        // Merge holes into the outline one by one.
        for h in 0..holes.len() {
            let (_, _, left_most, hole) = holes[h];
            let hole_len = self.contours[hole].vertices.len();

            let mut index = None;
            let mut best_vertex = left_most;
            for _ in 0..hole_len {
                // Find potential diagonals.
                // The 'best' vertex must be in the cone described by 3 consecutive vertices of the outline.
                // ..o j-1
                //   |
                //   |   * best
                //   |
                // j o-----o j+1
                //         :
                let outline_vertices = &self.contours[outline].vertices;
                let corner = grid::from_u16(self.contours[hole].vertices[best_vertex].0);
                diagonals.clear();
                for j in 0..outline_vertices.len() {
                    if in_cone(j, outline_vertices, corner) {
                        let vertex = grid::from_u16(outline_vertices[j].0);
                        let dx = vertex.x - corner.x;
                        let dz = vertex.z - corner.z;
                        diagonals.push((j, dx * dx + dz * dz));
                    }
                }
                // Sort potential diagonals by distance, we want to make the connection as short as possible.
                diagonals.sort_by_key(|&(_, distance)| distance);

                // Find a diagonal that is not intersecting the outline not the remaining holes.
                index = diagonals.iter().map(|&(j, _)| j).find(|&j| {
                    let pt = grid::from_u16(outline_vertices[j].0);
                    let mut intersect = intersect_seg_contour(pt, corner, Some(j), outline_vertices);
                    for &(_, _, _, other) in &holes[h..] {
                        if intersect {
                            break;
                        }
                        intersect |= intersect_seg_contour(
                            pt,
                            corner,
                            None,
                            &self.contours[other].vertices,
                        );
                    }
                    !intersect
                });

                // If found non-intersecting diagonal, stop looking.
                if index.is_some() {
                    break;
                }
                // All the potential diagonals for the current vertex were intersecting, try next vertex.
                best_vertex = (best_vertex + 1) % hole_len;
            }

            let Some(index) = index else {
                stage_log(LogLevel::Warn, format!(
                    "Failed to find merge points for contours {outline} and {hole}, the hole is kept as is."
                ));
                continue;
            };
            let (outline_contour, hole_contour) = if outline < hole {
                let (left, right) = self.contours.split_at_mut(hole);
                (&mut left[outline], &mut right[0])
            } else {
                let (left, right) = self.contours.split_at_mut(outline);
                (&mut right[0], &mut left[hole])
            };
            merge_contours(outline_contour, hole_contour, index, best_vertex);
        }
    }
}

/// Errors that can occur when building contours.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContourError {
    /// A region outline led to a span that has no neighbor in the walking direction.
    #[error("contour walk failed at ({x}, {z}) in direction {dir}")]
    WalkFailed {
        /// The x-coordinate of the span
        x: u16,
        /// The z-coordinate of the span
        z: u16,
        /// The direction of the missing connection
        dir: u8,
    },
}

/// Represents a group of related contours.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ContourSet {
    /// An array of the contours in the set.
    pub contours: Vec<Contour>,
    /// The AABB in world space
    pub aabb: Aabb3d,
    /// The size of each cell. (On the xz-plane.)
    pub cell_size: f32,
    /// The height of each cell. (The minimum increment along the y-axis.)
    pub cell_height: f32,
    /// The width of the set. (Along the x-axis in cell units.)
    pub width: u16,
    /// The height of the set. (Along the z-axis in cell units.)
    pub height: u16,
    /// The AABB border size used to generate the source data from which the contours were derived.
    pub border_size: u16,
    /// The max edge error that this contour set was simplified with.
    pub max_error: f32,
}

bitflags::bitflags! {
    /// The region id of a contour vertex together with flags describing the vertex.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
    #[repr(transparent)]
    pub struct RegionVertexId: u32 {
        /// No region and no flags.
        const NONE = 0;

        /// Applied to the region id field of contour vertices in order to extract the region id.
        /// The region id field of a vertex may have several flags applied to it.  So the
        /// fields value can't be used directly.
        const REGION_MASK = RegionId::MAX.bits() as u32;

        /// Border vertex flag.
        /// If a region ID has this bit set, then the associated element lies on
        /// the border of the field. If a contour vertex's region ID has this bit set, the
        /// vertex will later be removed when building the polygon mesh.
        /// (Used during the build process.)
        const BORDER_VERTEX = 0x10_000;

        /// Area border flag.
        /// If a region ID has this bit set, then the associated element lies on
        /// the border of an area.
        /// (Used during the region and contour build process.)
        const AREA_BORDER = 0x20_000;
    }
}

impl From<RegionId> for RegionVertexId {
    fn from(region_id: RegionId) -> Self {
        RegionVertexId::from_bits_retain(region_id.bits() as u32)
    }
}

impl From<RegionVertexId> for RegionId {
    fn from(region_vertex_id: RegionVertexId) -> Self {
        let bits = region_vertex_id & RegionVertexId::REGION_MASK;
        RegionId::from_bits_retain(bits.bits() as u16)
    }
}

/// Represents a simple, non-overlapping contour in field space.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Contour {
    /// Simplified contour vertex and connection data.
    pub vertices: Vec<(U16Vec3, RegionVertexId)>,
    /// Raw contour vertex and connection data.
    pub raw_vertices: Vec<(U16Vec3, RegionVertexId)>,
    /// Region ID of the contour.
    pub region: RegionId,
    /// Area type of the contour.
    pub area: AreaType,
}

bitflags::bitflags! {
    /// Contour build flags used in [`CompactHeightfield::build_contours`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
    #[repr(transparent)]
    pub struct BuildContoursFlags: u8 {
        /// Tessellate solid (impassable) edges during contour simplification.
        const TESSELLATE_SOLID_WALL_EDGES = 1;
        /// Tessellate edges between areas during contour simplification.
        const TESSELLATE_AREA_EDGES = 2;

        /// Default flags for building contours.
        const DEFAULT = Self::TESSELLATE_SOLID_WALL_EDGES.bits();
    }
}

impl Default for BuildContoursFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact_heightfield::tests::flat_compact_heightfield;

    fn xz(contour: &Contour) -> Vec<(u16, u16)> {
        let mut xz: Vec<_> = contour.vertices.iter().map(|(v, _)| (v.x, v.z)).collect();
        xz.sort();
        xz
    }

    #[test]
    fn flat_square_simplifies_to_its_corners() {
        let mut compact = flat_compact_heightfield(4);
        compact.build_regions_monotone(0, 0, 0).unwrap();
        let cset = compact
            .build_contours(1.3, 0, BuildContoursFlags::DEFAULT)
            .unwrap();
        assert_eq!(cset.contours.len(), 1);
        let contour = &cset.contours[0];
        assert_eq!(contour.region, RegionId::from(1));
        assert_eq!(contour.area, AreaType(1));
        assert_eq!(xz(contour), vec![(0, 0), (0, 4), (4, 0), (4, 4)]);
        assert!(contour.vertices.iter().all(|(v, _)| v.y == 1));
        assert!(calc_area_of_polygon_2d(&contour.vertices) > 0);
        // The raw outline has one vertex per boundary edge.
        assert_eq!(contour.raw_vertices.len(), 16);
    }

    #[test]
    fn long_wall_edges_are_split() {
        let mut compact = flat_compact_heightfield(12);
        compact.build_regions_monotone(0, 0, 0).unwrap();
        let cset = compact
            .build_contours(1.3, 4, BuildContoursFlags::DEFAULT)
            .unwrap();
        let contour = &cset.contours[0];
        let n = contour.vertices.len();
        assert!(n > 4);
        for i in 0..n {
            let a = contour.vertices[i].0;
            let b = contour.vertices[(i + 1) % n].0;
            let dx = a.x as i32 - b.x as i32;
            let dz = a.z as i32 - b.z as i32;
            assert!(dx * dx + dz * dz <= 16, "edge {a} -> {b} is too long");
        }
    }

    #[test]
    fn portals_carry_the_neighbor_region() {
        let mut compact = flat_compact_heightfield(8);
        for z in 0..8 {
            for x in 4..8 {
                let i = compact.cell_at(x, z).index() as usize;
                compact.areas[i] = AreaType(2);
            }
        }
        compact.build_regions_monotone(0, 0, 0).unwrap();
        let cset = compact
            .build_contours(1.3, 0, BuildContoursFlags::DEFAULT)
            .unwrap();
        assert_eq!(cset.contours.len(), 2);
        let (left, right) = (&cset.contours[0], &cset.contours[1]);
        assert_ne!(left.region, right.region);
        assert!(
            left.vertices
                .iter()
                .any(|(_, flags)| RegionId::from(*flags) == right.region
                    && flags.contains(RegionVertexId::AREA_BORDER))
        );
        assert!(xz(left).contains(&(4, 0)));
        assert!(xz(left).contains(&(4, 8)));
        assert!(xz(right).contains(&(4, 0)));
        assert!(xz(right).contains(&(4, 8)));
    }

    #[test]
    fn holes_are_merged_into_the_outline() {
        let mut compact = flat_compact_heightfield(8);
        for z in 3..5 {
            for x in 3..5 {
                let i = compact.cell_at(x, z).index() as usize;
                compact.areas[i] = AreaType::NOT_WALKABLE;
            }
        }
        compact.build_layer_regions(0, 0).unwrap();
        let cset = compact
            .build_contours(1.3, 0, BuildContoursFlags::DEFAULT)
            .unwrap();
        assert_eq!(cset.contours.len(), 1);
        let vertices: Vec<_> = cset.contours[0]
            .vertices
            .iter()
            .map(|(v, _)| (v.x, v.z))
            .collect();
        // Outline and hole with 4 corners each, both closed by the diagonal.
        assert_eq!(vertices.len(), 10);
        for corner in [(0, 0), (0, 8), (8, 8), (8, 0), (3, 3), (5, 3), (5, 5), (3, 5)] {
            assert!(vertices.contains(&corner), "missing {corner:?}");
        }
    }

    #[test]
    fn border_offset_is_removed() {
        let mut compact = flat_compact_heightfield(8);
        compact.build_regions_monotone(2, 0, 0).unwrap();
        let cset = compact
            .build_contours(1.3, 0, BuildContoursFlags::DEFAULT)
            .unwrap();
        assert_eq!(cset.width, 4);
        assert_eq!(cset.height, 4);
        assert_eq!(cset.contours.len(), 1);
        assert_eq!(xz(&cset.contours[0]), vec![(0, 0), (0, 4), (4, 0), (4, 4)]);
        approx::assert_relative_eq!(cset.aabb.min.x, 2.0);
        approx::assert_relative_eq!(cset.aabb.max.x, 6.0);
    }

    #[test]
    fn degenerate_segments_are_removed() {
        let v = |x, z| (U16Vec3::new(x, 0, z), RegionVertexId::NONE);
        let mut vertices = vec![v(0, 0), v(0, 0), v(4, 0), v(4, 4)];
        remove_degenerate_segments(&mut vertices);
        assert_eq!(vertices, vec![v(0, 0), v(4, 0), v(4, 4)]);
    }
}
