//! The heightfield module contains the types and functions for working with [`Heightfield`]s.
//!
//! A heightfield is a 3D grid of [`Span`]s, where each column contains 0, 1, or more spans.

use thiserror::Error;

use crate::{
    Aabb3d,
    compact_heightfield::{CompactHeightfield, CompactHeightfieldError},
    span::{Span, SpanKey, Spans},
};

/// A voxelized representation of the input geometry.
/// Build with [`HeightfieldBuilder`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Heightfield {
    /// The width of the heightfield along the x-axis in cell units
    pub width: u16,
    /// The height of the heightfield along the z-axis in cell units
    pub height: u16,
    /// The AABB of the heightfield
    pub aabb: Aabb3d,
    /// The size of each cell on the xz-plane
    pub cell_size: f32,
    /// The size of each cell along the y-axis
    pub cell_height: f32,
    /// The indices to the spans in the heightfield in width*height order
    /// Each index corresponds to a column in the heightfield by pointing to the lowest span in the column
    pub spans: Vec<Option<SpanKey>>,
    /// All spans in the heightfield
    pub allocated_spans: Spans,
}

impl Heightfield {
    /// Inserts a span into its column, merging it with every span it overlaps.
    #[inline]
    pub(crate) fn add_span(&mut self, insertion: SpanInsertion) -> Result<(), SpanInsertionError> {
        let column_index = self.column_index(insertion.x, insertion.z);
        if column_index >= self.spans.len() {
            return Err(SpanInsertionError::ColumnIndexOutOfBounds {
                x: insertion.x,
                z: insertion.z,
            });
        }

        let mut new_span = insertion.span;
        let mut previous_span_key = None;
        let mut current_span_key_iter = self.spans[column_index];
        while let Some(current_span_key) = current_span_key_iter {
            let current_span = self.span(current_span_key);
            current_span_key_iter = current_span.next();
            if current_span.min() > new_span.max() {
                // Current span is further up than the new span
                break;
            }
            if current_span.max() < new_span.min() {
                // Current span is further down than the new span
                previous_span_key = Some(current_span_key);
                continue;
            }
            // Overlap, merge
            new_span.set_min(new_span.min().min(current_span.min()));
            new_span.set_max(new_span.max().max(current_span.max()));

            if (new_span.max() as i32 - current_span.max() as i32).unsigned_abs()
                <= insertion.flag_merge_threshold as u32
            {
                // Higher area ID numbers indicate higher resolution priority.
                new_span.set_area(new_span.area().max(current_span.area()));
            }

            // The merged span replaces the current one. Keep going since the grown span
            // may overlap further spans.
            let next_key = current_span.next();
            self.allocated_spans.remove(current_span_key);
            match previous_span_key {
                Some(previous_span_key) => self.span_mut(previous_span_key).set_next(next_key),
                None => self.spans[column_index] = next_key,
            }
        }

        if self.allocated_spans.len() >= Spans::MAX_SPANS {
            return Err(SpanInsertionError::SpanPoolExhausted {
                capacity: Spans::MAX_SPANS,
            });
        }
        match previous_span_key {
            Some(previous_span_key) => {
                new_span.set_next(self.span(previous_span_key).next());
                let new_span_key = self.allocated_spans.insert(new_span);
                self.span_mut(previous_span_key).set_next(new_span_key);
            }
            None => {
                new_span.set_next(self.spans[column_index]);
                let new_span_key = self.allocated_spans.insert(new_span);
                self.spans[column_index] = Some(new_span_key);
            }
        }

        Ok(())
    }

    #[inline]
    pub(crate) fn column_index(&self, x: u16, z: u16) -> usize {
        x as usize + z as usize * self.width as usize
    }

    #[inline]
    pub(crate) fn contains(&self, x: i32, z: i32) -> bool {
        x >= 0 && x < self.width as i32 && z >= 0 && z < self.height as i32
    }

    /// Returns the key of the lowest span in the column at the given coordinates.
    /// `None` if either the index is out of bounds or there is no span in the column.
    #[inline]
    pub fn span_key_at(&self, x: u16, z: u16) -> Option<SpanKey> {
        if x >= self.width || z >= self.height {
            return None;
        }
        self.spans[self.column_index(x, z)]
    }

    /// Returns the span at the given coordinates.
    /// `None` if either the index is out of bounds or there is no span in the column.
    #[inline]
    pub fn span_at(&self, x: u16, z: u16) -> Option<&Span> {
        let span_key = self.span_key_at(x, z)?;
        Some(self.span(span_key))
    }

    /// Iterates over the spans of the column at the given coordinates, from bottom to top.
    pub fn column(&self, x: u16, z: u16) -> impl Iterator<Item = (SpanKey, &Span)> + '_ {
        let mut key = self.span_key_at(x, z);
        std::iter::from_fn(move || {
            let current = key?;
            let span = self.span(current);
            key = span.next();
            Some((current, span))
        })
    }

    /// Returns a reference to the span with the given key.
    /// # Panics
    /// Panics if the key is not found.
    #[inline]
    pub fn span(&self, key: SpanKey) -> &Span {
        &self.allocated_spans[key]
    }

    /// Returns a mutable reference to the span with the given key.
    /// # Panics
    /// Panics if the key is not found.
    #[inline]
    pub fn span_mut(&mut self, key: SpanKey) -> &mut Span {
        &mut self.allocated_spans[key]
    }

    /// Number of spans in the heightfield.
    #[inline]
    pub fn span_count(&self) -> usize {
        self.allocated_spans.len()
    }

    /// Number of spans with a walkable area.
    pub fn walkable_span_count(&self) -> usize {
        self.allocated_spans
            .values()
            .filter(|span| span.area().is_walkable())
            .count()
    }

    /// Builds a [`CompactHeightfield`] out of this heightfield, consuming it.
    /// See [`CompactHeightfield::from_heightfield`].
    pub fn into_compact(
        self,
        walkable_height: u16,
        walkable_climb: u16,
    ) -> Result<CompactHeightfield, CompactHeightfieldError> {
        CompactHeightfield::from_heightfield(&self, walkable_height, walkable_climb)
    }
}

/// A builder for [`Heightfield`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightfieldBuilder {
    /// The AABB of the heightfield
    pub aabb: Aabb3d,
    /// The size of each cell on the xz-plane
    pub cell_size: f32,
    /// The size of each cell along the y-axis
    pub cell_height: f32,
}

impl HeightfieldBuilder {
    /// Largest number of cells along either horizontal axis.
    pub const MAX_GRID_SIZE: u16 = u16::MAX - 1;

    /// Builds the heightfield.
    pub fn build(self) -> Result<Heightfield, HeightfieldBuilderError> {
        if !(self.cell_size > 0.0 && self.cell_height > 0.0) {
            return Err(HeightfieldBuilderError::InvalidCellSize {
                cell_size: self.cell_size,
                cell_height: self.cell_height,
            });
        }
        let width = (self.aabb.max.x - self.aabb.min.x) / self.cell_size + 0.5;
        let height = (self.aabb.max.z - self.aabb.min.z) / self.cell_size + 0.5;
        if !width.is_finite()
            || !height.is_finite()
            || width > Self::MAX_GRID_SIZE as f32
            || height > Self::MAX_GRID_SIZE as f32
        {
            return Err(HeightfieldBuilderError::GridTooLarge { width, height });
        }
        let (width, height) = (width as u16, height as u16);
        if width == 0 || height == 0 {
            return Err(HeightfieldBuilderError::EmptyGrid { width, height });
        }
        let column_count = width as usize * height as usize;
        let mut spans = Vec::new();
        spans
            .try_reserve_exact(column_count)
            .map_err(|_| HeightfieldBuilderError::Allocation { column_count })?;
        spans.resize(column_count, None);
        Ok(Heightfield {
            width,
            height,
            aabb: self.aabb,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            spans,
            allocated_spans: Spans::with_min_capacity(column_count),
        })
    }
}

/// Errors that can occur when building a [`Heightfield`] with [`HeightfieldBuilder::build`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HeightfieldBuilderError {
    /// Happens when the cell dimensions are not positive.
    #[error("cell size and cell height must be positive, got {cell_size} and {cell_height}")]
    InvalidCellSize {
        /// The size of each cell on the xz-plane
        cell_size: f32,
        /// The size of each cell along the y-axis
        cell_height: f32,
    },
    /// Happens when the grid would have more columns along an axis than can be addressed.
    #[error("grid of {width}x{height} cells exceeds the maximum of {max} cells per axis", max = HeightfieldBuilder::MAX_GRID_SIZE)]
    GridTooLarge {
        /// The width of the heightfield along the x-axis in cell units
        width: f32,
        /// The height of the heightfield along the z-axis in cell units
        height: f32,
    },
    /// Happens when the bounds are so thin that no column fits in them.
    #[error("bounds produce an empty {width}x{height} grid")]
    EmptyGrid {
        /// The width of the heightfield along the x-axis in cell units
        width: u16,
        /// The height of the heightfield along the z-axis in cell units
        height: u16,
    },
    /// Happens when the column array cannot be allocated.
    #[error("failed to allocate {column_count} heightfield columns")]
    Allocation {
        /// The number of columns requested
        column_count: usize,
    },
}

/// Errors that can occur when inserting a span into a [`Heightfield`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpanInsertionError {
    /// Happens when the column index is out of bounds.
    #[error("column index out of bounds: x={x}, z={z}")]
    ColumnIndexOutOfBounds {
        /// The x-coordinate of the span
        x: u16,
        /// The z-coordinate of the span
        z: u16,
    },
    /// Happens when the span arena cannot hold another span.
    #[error("span pool exhausted at {capacity} spans")]
    SpanPoolExhausted {
        /// The maximum number of spans
        capacity: usize,
    },
}

pub(crate) struct SpanInsertion {
    /// The x-coordinate of the span
    pub(crate) x: u16,
    /// The z-coordinate of the span
    pub(crate) z: u16,
    /// Maximum difference between the ceilings of two spans to merge area type IDs
    pub(crate) flag_merge_threshold: u16,
    /// The span to insert
    pub(crate) span: Span,
}

#[cfg(test)]
pub(crate) mod tests {
    use glam::Vec3;

    use crate::{
        Aabb3d,
        span::{AreaType, SpanBuilder},
    };

    use super::*;

    pub(crate) fn height_field(size: f32) -> Heightfield {
        HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3::ZERO, Vec3::splat(size)),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap()
    }

    pub(crate) fn insert(heightfield: &mut Heightfield, x: u16, z: u16, span: SpanBuilder) {
        heightfield
            .add_span(SpanInsertion {
                x,
                z,
                flag_merge_threshold: 1,
                span: span.build(),
            })
            .unwrap();
    }

    pub(crate) fn span(min: u16, max: u16, area: u8) -> SpanBuilder {
        SpanBuilder {
            min,
            max,
            area: AreaType(area),
            next: None,
        }
    }

    #[test]
    fn grid_size_is_rounded() {
        let heightfield = HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3::ZERO, Vec3::new(10.0, 1.0, 4.4)),
            cell_size: 1.0,
            cell_height: 0.5,
        }
        .build()
        .unwrap();
        assert_eq!(heightfield.width, 10);
        assert_eq!(heightfield.height, 4);
        assert_eq!(heightfield.spans.len(), 40);
    }

    #[test]
    fn rejects_degenerate_bounds() {
        let result = HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3::ZERO, Vec3::new(10.0, 1.0, 0.0)),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build();
        assert_eq!(
            result,
            Err(HeightfieldBuilderError::EmptyGrid {
                width: 10,
                height: 0
            })
        );
    }

    #[test]
    fn rejects_oversized_grid() {
        let result = HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3::ZERO, Vec3::new(1.0e9, 1.0, 1.0)),
            cell_size: 0.1,
            cell_height: 1.0,
        }
        .build();
        assert!(matches!(
            result,
            Err(HeightfieldBuilderError::GridTooLarge { .. })
        ));
    }

    #[test]
    fn can_add_span() {
        let mut heightfield = height_field(5.0);
        insert(&mut heightfield, 1, 3, span(2, 4, 2));
        assert_eq!(*heightfield.span_at(1, 3).unwrap(), span(2, 4, 2).build());
        assert_eq!(heightfield.span_at(3, 1), None);
        assert_eq!(heightfield.span_at(7, 1), None);
    }

    #[test]
    fn keeps_disjoint_spans_sorted() {
        let mut heightfield = height_field(5.0);
        insert(&mut heightfield, 1, 3, span(7, 10, 2));
        insert(&mut heightfield, 1, 3, span(0, 2, 2));
        insert(&mut heightfield, 1, 3, span(4, 5, 2));

        let heights: Vec<_> = heightfield
            .column(1, 3)
            .map(|(_, span)| (span.min(), span.max()))
            .collect();
        assert_eq!(heights, vec![(0, 2), (4, 5), (7, 10)]);
    }

    #[test]
    fn merges_overlapping_spans() {
        let mut heightfield = height_field(5.0);
        insert(&mut heightfield, 1, 3, span(2, 4, 2));
        insert(&mut heightfield, 1, 3, span(7, 10, 3));
        // Bridges both existing spans
        insert(&mut heightfield, 1, 3, span(4, 7, 1));

        let spans: Vec<_> = heightfield.column(1, 3).map(|(_, s)| s.clone()).collect();
        assert_eq!(spans, vec![span(2, 10, 3).build()]);
        assert_eq!(heightfield.span_count(), 1);
    }

    #[test]
    fn area_merge_respects_threshold() {
        // The new top is far above the old one, so the old area is buried.
        let mut heightfield = height_field(5.0);
        insert(&mut heightfield, 0, 0, span(0, 4, 9));
        insert(&mut heightfield, 0, 0, span(2, 10, 5));
        assert_eq!(heightfield.span_at(0, 0).unwrap().area(), AreaType(5));

        // Tops within the threshold, the higher area wins.
        let mut heightfield = height_field(5.0);
        insert(&mut heightfield, 0, 0, span(0, 9, 9));
        insert(&mut heightfield, 0, 0, span(2, 10, 5));
        assert_eq!(heightfield.span_at(0, 0).unwrap().area(), AreaType(9));

        // Swallowed entirely by an existing span.
        let mut heightfield = height_field(5.0);
        insert(&mut heightfield, 0, 0, span(0, 10, 5));
        insert(&mut heightfield, 0, 0, span(2, 6, 9));
        assert_eq!(heightfield.span_at(0, 0).unwrap().area(), AreaType(9));
    }

    #[test]
    fn out_of_bounds_insertion_fails() {
        let mut heightfield = height_field(5.0);
        let result = heightfield.add_span(SpanInsertion {
            x: 0,
            z: 9,
            flag_merge_threshold: 0,
            span: span(0, 1, 1).build(),
        });
        assert_eq!(
            result,
            Err(SpanInsertionError::ColumnIndexOutOfBounds { x: 0, z: 9 })
        );
    }
}
