use thiserror::Error;

use crate::{
    Aabb3d,
    compact_cell::CompactCell,
    compact_span::CompactSpan,
    heightfield::Heightfield,
    math::{dir_offset_x, dir_offset_z},
    region::RegionId,
    span::AreaType,
};

/// A packed representation of the walkable spans of a [`Heightfield`],
/// with explicit links between neighboring spans.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct CompactHeightfield {
    /// The width of the heightfield along the x-axis in cell units
    pub width: u16,
    /// The height of the heightfield along the z-axis in cell units
    pub height: u16,
    /// The walkable height used during the build of the field
    pub walkable_height: u16,
    /// The walkable climb used during the build of the field.
    pub walkable_climb: u16,
    /// The AABB border size used during the build of the field.
    pub border_size: u16,
    /// The maximum distance value of any span within the field.
    pub max_distance: u16,
    /// The maximum region id of any span within the field.
    pub max_region: RegionId,
    /// The AABB of the heightfield
    pub aabb: Aabb3d,
    /// The size of each cell on the xz-plane
    pub cell_size: f32,
    /// The size of each cell along the y-axis
    pub cell_height: f32,
    /// The cells in the heightfield [Size: `width * height`]
    pub cells: Vec<CompactCell>,
    /// All walkable spans in the heightfield
    pub spans: Vec<CompactSpan>,
    /// Vector containing border distance data. [Size: `spans.len()`]
    /// Empty until [`CompactHeightfield::build_distance_field`] has run.
    pub dist: Vec<u16>,
    /// Vector containing area type data. [Size: `spans.len()`]
    pub areas: Vec<AreaType>,
}

impl CompactHeightfield {
    const MAX_HEIGHT: u16 = u16::MAX;
    /// Largest layer index that fits into a span connection.
    const MAX_LAYERS: u8 = CompactSpan::NOT_CONNECTED - 1;

    /// Builds a compact heightfield from the walkable spans of a heightfield.
    ///
    /// Two spans in adjacent columns are connected when the gap between them is at least
    /// `walkable_height` tall and their floors are at most `walkable_climb` apart.
    ///
    /// # Errors
    ///
    /// Returns an error if the heightfield has too many layers or the span arrays cannot be allocated.
    pub fn from_heightfield(
        heightfield: &Heightfield,
        walkable_height: u16,
        walkable_climb: u16,
    ) -> Result<Self, CompactHeightfieldError> {
        let walkable_span_count = heightfield.walkable_span_count();
        if walkable_span_count > u32::MAX as usize {
            return Err(CompactHeightfieldError::TooManySpans {
                span_count: walkable_span_count,
            });
        }
        let column_count = heightfield.width as usize * heightfield.height as usize;

        let mut cells = Vec::new();
        let mut spans = Vec::new();
        let mut areas = Vec::new();
        cells
            .try_reserve_exact(column_count)
            .and_then(|()| spans.try_reserve_exact(walkable_span_count))
            .and_then(|()| areas.try_reserve_exact(walkable_span_count))
            .map_err(|_| CompactHeightfieldError::Allocation {
                span_count: walkable_span_count,
            })?;
        cells.resize(column_count, CompactCell::default());

        let mut aabb = heightfield.aabb;
        aabb.max.y += walkable_height as f32 * heightfield.cell_height;

        // Fill in cells and spans
        for z in 0..heightfield.height {
            for x in 0..heightfield.width {
                let cell = &mut cells[heightfield.column_index(x, z)];
                cell.set_index(spans.len() as u32);
                for (_, span) in heightfield.column(x, z) {
                    if !span.area().is_walkable() {
                        continue;
                    }
                    if cell.count() == u8::MAX {
                        return Err(CompactHeightfieldError::ColumnTooTall { x, z });
                    }
                    let bot = span.max();
                    let top = span
                        .next()
                        .map_or(Self::MAX_HEIGHT, |next| heightfield.span(next).min());
                    let mut compact_span = CompactSpan {
                        y: bot,
                        ..Default::default()
                    };
                    compact_span.set_height(top.saturating_sub(bot).min(u8::MAX as u16) as u8);
                    for dir in 0..4 {
                        compact_span.set_con(dir, None);
                    }
                    spans.push(compact_span);
                    areas.push(span.area());
                    cell.inc_count();
                }
            }
        }

        let mut compact_heightfield = Self {
            width: heightfield.width,
            height: heightfield.height,
            walkable_height,
            walkable_climb,
            border_size: 0,
            max_distance: 0,
            max_region: RegionId::NONE,
            aabb,
            cell_size: heightfield.cell_size,
            cell_height: heightfield.cell_height,
            cells,
            spans,
            dist: Vec::new(),
            areas,
        };
        compact_heightfield.connect_neighbors()?;
        Ok(compact_heightfield)
    }

    fn connect_neighbors(&mut self) -> Result<(), CompactHeightfieldError> {
        let mut max_layer_index = 0_usize;
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = *self.cell_at(x, z);
                for i in cell.index_range() {
                    for dir in 0..4_u8 {
                        let neighbor_x = x as i32 + dir_offset_x(dir) as i32;
                        let neighbor_z = z as i32 + dir_offset_z(dir) as i32;
                        if !self.contains(neighbor_x, neighbor_z) {
                            continue;
                        }
                        let neighbor_cell = *self.cell_at(neighbor_x as u16, neighbor_z as u16);
                        let span = &self.spans[i];
                        let span_top = span.y as i32 + span.height() as i32;

                        // Find the first neighbor span that can be reached from this one.
                        let connection = neighbor_cell.index_range().find(|&k| {
                            let neighbor_span = &self.spans[k];
                            let bot = span.y.max(neighbor_span.y) as i32;
                            let top = span_top
                                .min(neighbor_span.y as i32 + neighbor_span.height() as i32);
                            let is_walkable = top - bot >= self.walkable_height as i32;
                            let is_climbable = (neighbor_span.y as i32 - span.y as i32).abs()
                                <= self.walkable_climb as i32;
                            is_walkable && is_climbable
                        });
                        let Some(k) = connection else {
                            continue;
                        };
                        let layer_index = k - neighbor_cell.index() as usize;
                        if layer_index >= Self::MAX_LAYERS as usize {
                            max_layer_index = max_layer_index.max(layer_index);
                            continue;
                        }
                        self.spans[i].set_con(dir, Some(layer_index as u8));
                    }
                }
            }
        }
        if max_layer_index >= Self::MAX_LAYERS as usize {
            return Err(CompactHeightfieldError::TooManyLayers {
                max_layer_index: Self::MAX_LAYERS,
                layer_index: max_layer_index,
            });
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

    /// Returns the cell at the given coordinates. Returns `None` if the coordinates are invalid.
    #[inline]
    pub fn get_cell_at(&self, x: u16, z: u16) -> Option<&CompactCell> {
        if x >= self.width || z >= self.height {
            return None;
        }
        self.cells.get(self.column_index(x, z))
    }

    /// Returns the cell at the given coordinates. Panics if the coordinates are invalid.
    #[inline]
    pub fn cell_at(&self, x: u16, z: u16) -> &CompactCell {
        &self.cells[self.column_index(x, z)]
    }

    /// Follows the connection `con` of a span at `(x, z)` in direction `dir`.
    /// Returns the coordinates of the neighboring column and the index of the neighbor span.
    #[inline]
    pub(crate) fn con_indices(&self, x: i32, z: i32, dir: u8, con: u8) -> (i32, i32, usize) {
        let a_x = x + dir_offset_x(dir) as i32;
        let a_z = z + dir_offset_z(dir) as i32;
        let a_index =
            self.cells[(a_x + a_z * self.width as i32) as usize].index() as usize + con as usize;
        (a_x, a_z, a_index)
    }

    /// Index of the neighbor of span `i` at `(x, z)` in direction `dir`, if they are connected.
    #[inline]
    pub(crate) fn neighbor_index(&self, x: i32, z: i32, i: usize, dir: u8) -> Option<usize> {
        let con = self.spans[i].con(dir)?;
        Some(self.con_indices(x, z, dir, con).2)
    }

    /// Number of spans that are walkable, i.e. not filtered or eroded away.
    pub fn walkable_span_count(&self) -> usize {
        self.areas.iter().filter(|area| area.is_walkable()).count()
    }

    /// Number of spans per region id, indexed by [`RegionId::bits`].
    /// Border regions are not counted.
    pub fn region_span_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.max_region.bits() as usize + 1];
        for span in &self.spans {
            if span.region.contains(RegionId::BORDER_REGION) {
                continue;
            }
            if let Some(count) = counts.get_mut(span.region.bits() as usize) {
                *count += 1;
            }
        }
        counts
    }
}

/// Errors that can occur when building a compact heightfield.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactHeightfieldError {
    /// The heightfield has too many layers.
    #[error(
        "Heightfield has too many layers. Max layer index is {max_layer_index}, but got {layer_index}"
    )]
    TooManyLayers {
        /// The maximum layer index.
        max_layer_index: u8,
        /// The layer index that caused the error.
        layer_index: usize,
    },
    /// A single column holds more walkable spans than a cell can address.
    #[error("column ({x}, {z}) holds more than {max} walkable spans", max = u8::MAX)]
    ColumnTooTall {
        /// The x-coordinate of the column
        x: u16,
        /// The z-coordinate of the column
        z: u16,
    },
    /// The heightfield has more walkable spans than can be indexed.
    #[error("heightfield has {span_count} walkable spans, which cannot be indexed")]
    TooManySpans {
        /// Number of walkable spans
        span_count: usize,
    },
    /// The span arrays could not be allocated.
    #[error("failed to allocate {span_count} compact spans")]
    Allocation {
        /// Number of spans requested
        span_count: usize,
    },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::heightfield::tests::{height_field, insert, span};

    /// A `size` x `size` field with one walkable span of height 1 per column.
    pub(crate) fn flat_compact_heightfield(size: u16) -> CompactHeightfield {
        let mut heightfield = height_field(size as f32);
        for z in 0..size {
            for x in 0..size {
                insert(&mut heightfield, x, z, span(0, 1, 1));
            }
        }
        heightfield.into_compact(2, 1).unwrap()
    }

    #[test]
    fn flat_field_connects_all_interior_neighbors() {
        let compact = flat_compact_heightfield(4);
        assert_eq!(compact.spans.len(), 16);
        for z in 0..4_u16 {
            for x in 0..4_u16 {
                let cell = compact.cell_at(x, z);
                assert_eq!(cell.count(), 1);
                let span = &compact.spans[cell.index() as usize];
                assert_eq!(span.y, 1);
                assert_eq!(span.height(), u8::MAX);
                for dir in 0..4 {
                    let nx = x as i32 + dir_offset_x(dir) as i32;
                    let nz = z as i32 + dir_offset_z(dir) as i32;
                    let expected = compact.contains(nx, nz).then_some(0);
                    assert_eq!(span.con(dir), expected, "({x}, {z}) dir {dir}");
                }
            }
        }
    }

    #[test]
    fn unwalkable_spans_are_skipped() {
        let mut heightfield = height_field(2.0);
        insert(&mut heightfield, 0, 0, span(0, 1, 0));
        insert(&mut heightfield, 1, 0, span(0, 1, 3));
        let compact = heightfield.into_compact(2, 1).unwrap();
        assert_eq!(compact.spans.len(), 1);
        assert_eq!(compact.cell_at(0, 0).count(), 0);
        assert_eq!(compact.cell_at(1, 0).count(), 1);
        assert_eq!(compact.areas, vec![AreaType(3)]);
        assert_eq!(compact.spans[0].con(0), None);
    }

    #[test]
    fn steps_above_climb_are_not_connected() {
        let mut heightfield = height_field(2.0);
        insert(&mut heightfield, 0, 0, span(0, 1, 1));
        insert(&mut heightfield, 1, 0, span(0, 4, 1));
        let compact = heightfield.into_compact(2, 1).unwrap();
        // Span at x=0 looks towards +x with direction 2.
        assert_eq!(compact.spans[0].con(2), None);

        let mut heightfield = height_field(2.0);
        insert(&mut heightfield, 0, 0, span(0, 1, 1));
        insert(&mut heightfield, 1, 0, span(0, 2, 1));
        let compact = heightfield.into_compact(2, 1).unwrap();
        assert_eq!(compact.spans[0].con(2), Some(0));
    }

    #[test]
    fn low_ceiling_blocks_connection() {
        let mut heightfield = height_field(2.0);
        insert(&mut heightfield, 0, 0, span(0, 1, 1));
        insert(&mut heightfield, 1, 0, span(0, 1, 1));
        // Ceiling right above the neighbor
        insert(&mut heightfield, 1, 0, span(2, 3, 0));
        let compact = heightfield.into_compact(2, 1).unwrap();
        assert_eq!(compact.spans[0].con(2), None);
    }
}
