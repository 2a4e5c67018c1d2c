//! Contains methods for rasterizing the triangles of a [`TriMesh`] into a [`Heightfield`].

use glam::Vec3A;
use thiserror::Error;

use crate::{
    heightfield::{Heightfield, SpanInsertion, SpanInsertionError},
    span::{AreaType, Span, SpanBuilder},
    trimesh::TriMesh,
};

/// A triangle clipped against grid lines has at most 7 vertices.
const MAX_CLIPPED_VERTICES: usize = 7;

#[derive(Clone, Copy)]
struct ClipPolygon {
    vertices: [Vec3A; MAX_CLIPPED_VERTICES],
    len: usize,
}

impl ClipPolygon {
    const EMPTY: Self = Self {
        vertices: [Vec3A::ZERO; MAX_CLIPPED_VERTICES],
        len: 0,
    };

    fn triangle(a: Vec3A, b: Vec3A, c: Vec3A) -> Self {
        let mut polygon = Self::EMPTY;
        polygon.vertices[..3].copy_from_slice(&[a, b, c]);
        polygon.len = 3;
        polygon
    }

    #[inline]
    fn push(&mut self, vertex: Vec3A) {
        self.vertices[self.len] = vertex;
        self.len += 1;
    }

    #[inline]
    fn as_slice(&self) -> &[Vec3A] {
        &self.vertices[..self.len]
    }
}

#[derive(Clone, Copy)]
enum Axis {
    X,
    Z,
}

impl Axis {
    #[inline]
    fn of(self, vertex: Vec3A) -> f32 {
        match self {
            Axis::X => vertex.x,
            Axis::Z => vertex.z,
        }
    }
}

/// Splits a convex polygon along an axis-aligned line.
/// Returns `(below, above)` where `below` holds the part with coordinates smaller than `axis_offset`.
fn divide_polygon(input: &ClipPolygon, axis_offset: f32, axis: Axis) -> (ClipPolygon, ClipPolygon) {
    let mut below = ClipPolygon::EMPTY;
    let mut above = ClipPolygon::EMPTY;
    let vertices = input.as_slice();
    let mut deltas = [0.0; MAX_CLIPPED_VERTICES];
    for (delta, vertex) in deltas.iter_mut().zip(vertices) {
        *delta = axis_offset - axis.of(*vertex);
    }

    let n = vertices.len();
    let mut b = n.wrapping_sub(1);
    for a in 0..n {
        let same_side = (deltas[a] >= 0.0) == (deltas[b] >= 0.0);
        if !same_side {
            let s = deltas[b] / (deltas[b] - deltas[a]);
            let intersection = vertices[b] + (vertices[a] - vertices[b]) * s;
            below.push(intersection);
            above.push(intersection);
            // Vertices on the dividing line were already added as the intersection
            if deltas[a] > 0.0 {
                below.push(vertices[a]);
            } else if deltas[a] < 0.0 {
                above.push(vertices[a]);
            }
        } else {
            if deltas[a] >= 0.0 {
                below.push(vertices[a]);
                if deltas[a] != 0.0 {
                    b = a;
                    continue;
                }
            }
            above.push(vertices[a]);
        }
        b = a;
    }
    (below, above)
}

impl Heightfield {
    /// Rasterizes the triangles of a [`TriMesh`] into the heightfield.
    /// Triangles need to have been classified with [`TriMesh::mark_walkable_triangles`] beforehand.
    ///
    /// # Arguments
    ///
    /// * `trimesh` - The mesh to rasterize.
    /// * `flag_merge_threshold` - The distance where the walkable flag is favored over the non-walkable flag. Usually the walkable climb in voxels.
    pub fn rasterize_triangles(
        &mut self,
        trimesh: &TriMesh,
        flag_merge_threshold: u16,
    ) -> Result<(), RasterizationError> {
        for (triangle_index, triangle) in trimesh.indices.iter().enumerate() {
            let [a, b, c] = triangle.to_array().map(|i| trimesh.vertices[i as usize]);
            let area = trimesh
                .area_types
                .get(triangle_index)
                .copied()
                .unwrap_or(AreaType::NOT_WALKABLE);
            self.rasterize_triangle(a, b, c, area, flag_merge_threshold)
                .map_err(|source| RasterizationError::SpanInsertion {
                    triangle_index,
                    source,
                })?;
        }
        Ok(())
    }

    fn rasterize_triangle(
        &mut self,
        a: Vec3A,
        b: Vec3A,
        c: Vec3A,
        area: AreaType,
        flag_merge_threshold: u16,
    ) -> Result<(), SpanInsertionError> {
        let triangle_min = a.min(b).min(c);
        let triangle_max = a.max(b).max(c);
        let field_min = Vec3A::from(self.aabb.min);
        let field_max = Vec3A::from(self.aabb.max);
        // Skip triangles that do not touch the heightfield.
        if triangle_min.cmpgt(field_max).any() || triangle_max.cmplt(field_min).any() {
            return Ok(());
        }

        let width = self.width as i32;
        let height = self.height as i32;
        let inverse_cell_size = 1.0 / self.cell_size;
        let inverse_cell_height = 1.0 / self.cell_height;
        let field_height = field_max.y - field_min.y;

        let z0 = ((triangle_min.z - field_min.z) * inverse_cell_size) as i32;
        let z1 = ((triangle_max.z - field_min.z) * inverse_cell_size) as i32;
        // -1 rather than 0 so the polygon is cut properly at the start of the grid
        let z0 = z0.clamp(-1, height - 1);
        let z1 = z1.clamp(0, height - 1);

        let mut remaining = ClipPolygon::triangle(a, b, c);
        for z in z0..=z1 {
            let cell_z = field_min.z + z as f32 * self.cell_size;
            let (row, rest) = divide_polygon(&remaining, cell_z + self.cell_size, Axis::Z);
            remaining = rest;
            if row.len < 3 || z < 0 {
                continue;
            }

            let (min_x, max_x) = row
                .as_slice()
                .iter()
                .fold((f32::MAX, f32::MIN), |(min, max), v| (min.min(v.x), max.max(v.x)));
            let x0 = ((min_x - field_min.x) * inverse_cell_size) as i32;
            let x1 = ((max_x - field_min.x) * inverse_cell_size) as i32;
            if x1 < 0 || x0 >= width {
                continue;
            }
            let x0 = x0.clamp(-1, width - 1);
            let x1 = x1.clamp(0, width - 1);

            let mut row_remaining = row;
            for x in x0..=x1 {
                let cell_x = field_min.x + x as f32 * self.cell_size;
                let (cell, rest) = divide_polygon(&row_remaining, cell_x + self.cell_size, Axis::X);
                row_remaining = rest;
                if cell.len < 3 || x < 0 {
                    continue;
                }

                let (span_min, span_max) = cell
                    .as_slice()
                    .iter()
                    .fold((f32::MAX, f32::MIN), |(min, max), v| (min.min(v.y), max.max(v.y)));
                let span_min = span_min - field_min.y;
                let span_max = span_max - field_min.y;
                // Skip spans completely outside the heightfield.
                if span_max < 0.0 || span_min > field_height {
                    continue;
                }
                let span_min = span_min.max(0.0);
                let span_max = span_max.min(field_height);

                let min = ((span_min * inverse_cell_height).floor() as i32)
                    .clamp(0, Span::MAX_HEIGHT as i32 - 1) as u16;
                let max = ((span_max * inverse_cell_height).ceil() as i32)
                    .clamp(min as i32 + 1, Span::MAX_HEIGHT as i32) as u16;

                self.add_span(SpanInsertion {
                    x: x as u16,
                    z: z as u16,
                    flag_merge_threshold,
                    span: SpanBuilder {
                        min,
                        max,
                        area,
                        next: None,
                    }
                    .build(),
                })?;
            }
        }
        Ok(())
    }
}

/// Errors that can occur when rasterizing triangles with [`Heightfield::rasterize_triangles`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RasterizationError {
    /// A span produced by a triangle could not be inserted.
    #[error("failed to insert a span of triangle {triangle_index}: {source}")]
    SpanInsertion {
        /// Index of the triangle being rasterized
        triangle_index: usize,
        /// The underlying insertion error
        #[source]
        source: SpanInsertionError,
    },
}

impl RasterizationError {
    /// Whether the error was caused by running out of span storage.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            RasterizationError::SpanInsertion {
                source: SpanInsertionError::SpanPoolExhausted { .. },
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::{Aabb3d, HeightfieldBuilder};

    fn flat_quad(size: f32, y: f32) -> TriMesh {
        let mut trimesh = TriMesh::from_buffers(
            &[
                [0.0, y, 0.0],
                [size, y, 0.0],
                [size, y, size],
                [0.0, y, size],
            ],
            &[0, 2, 1, 0, 3, 2],
        )
        .unwrap();
        trimesh.mark_walkable_triangles(45.0_f32.to_radians());
        trimesh
    }

    fn heightfield_for(trimesh: &TriMesh, cell_size: f32, cell_height: f32) -> Heightfield {
        HeightfieldBuilder {
            aabb: trimesh.compute_aabb().unwrap(),
            cell_size,
            cell_height,
        }
        .build()
        .unwrap()
    }

    #[test]
    fn flat_quad_fills_every_column_once() {
        let trimesh = flat_quad(4.0, 0.0);
        let mut heightfield = heightfield_for(&trimesh, 0.5, 0.5);
        heightfield.rasterize_triangles(&trimesh, 1).unwrap();

        assert_eq!(heightfield.width, 8);
        assert_eq!(heightfield.height, 8);
        for z in 0..heightfield.height {
            for x in 0..heightfield.width {
                let column: Vec<_> = heightfield.column(x, z).collect();
                assert_eq!(column.len(), 1, "column ({x}, {z}) should hold one span");
                let span = column[0].1;
                assert_eq!((span.min(), span.max()), (0, 1));
                assert_eq!(span.area(), AreaType::DEFAULT_WALKABLE);
            }
        }
    }

    #[test]
    fn stacked_quads_produce_separate_spans() {
        let mut trimesh = flat_quad(4.0, 0.0);
        trimesh.extend(flat_quad(4.0, 3.0)).unwrap();
        let mut heightfield = heightfield_for(&trimesh, 1.0, 0.5);
        heightfield.rasterize_triangles(&trimesh, 1).unwrap();

        let column: Vec<_> = heightfield
            .column(1, 1)
            .map(|(_, span)| (span.min(), span.max()))
            .collect();
        assert_eq!(column, vec![(0, 1), (6, 7)]);
    }

    #[test]
    fn triangles_outside_bounds_are_skipped() {
        let trimesh = flat_quad(4.0, 0.0);
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3::new(10.0, 0.0, 10.0), Vec3::new(14.0, 1.0, 14.0)),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap();
        heightfield.rasterize_triangles(&trimesh, 1).unwrap();
        assert_eq!(heightfield.span_count(), 0);
    }

    #[test]
    fn unwalkable_triangles_produce_unwalkable_spans() {
        let mut trimesh = flat_quad(2.0, 0.0);
        trimesh.area_types.fill(AreaType::NOT_WALKABLE);
        let mut heightfield = heightfield_for(&trimesh, 1.0, 1.0);
        heightfield.rasterize_triangles(&trimesh, 1).unwrap();
        assert_eq!(heightfield.span_count(), 4);
        assert_eq!(heightfield.walkable_span_count(), 0);
    }

    #[test]
    fn divide_polygon_splits_triangle() {
        let triangle = ClipPolygon::triangle(
            Vec3A::new(0.0, 0.0, 0.0),
            Vec3A::new(2.0, 0.0, 0.0),
            Vec3A::new(0.0, 0.0, 2.0),
        );
        let (below, above) = divide_polygon(&triangle, 1.0, Axis::X);
        assert_eq!(below.len, 4);
        assert_eq!(above.len, 3);
        assert!(below.as_slice().iter().all(|v| v.x <= 1.0));
        assert!(above.as_slice().iter().all(|v| v.x >= 1.0));
    }
}
