//! Layer partitioning.
//!
//! Fast, and produces regions that never overlap themselves, which makes it a good fit for stacked geometry
//! such as multi-storey buildings. Regions may contain holes around obstacles, which the contour stage
//! merges into the outline.

use crate::{
    CompactHeightfield,
    region::{RegionError, RegionId},
};

impl CompactHeightfield {
    /// Partitions the walkable surface into non-overlapping layers.
    ///
    /// The field is first swept row by row like [`CompactHeightfield::build_regions_monotone`].
    /// The resulting regions are then flood-merged into the largest groups that never stack on top of each other
    /// within the same column. Layers with fewer than `min_region_area` spans that do not touch the border are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if too many regions are created.
    pub fn build_layer_regions(
        &mut self,
        border_size: u16,
        min_region_area: u16,
    ) -> Result<(), RegionError> {
        let mut src_reg = vec![RegionId::NONE; self.spans.len()];
        let mut max_region_id = self.sweep_rows(border_size, &mut src_reg)?;

        // Merge monotone regions to layers and remove small regions.
        self.merge_and_filter_layer_regions(min_region_area, &mut max_region_id, &mut src_reg)?;
        self.max_region = RegionId::from(max_region_id);

        // Store the result out.
        for (span, region) in self.spans.iter_mut().zip(src_reg) {
            span.region = region;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AreaType,
        compact_heightfield::tests::flat_compact_heightfield,
        heightfield::tests::{height_field, insert, span},
    };

    #[test]
    fn layers_merge_around_obstacles() {
        let mut compact = flat_compact_heightfield(8);
        for z in 3..5 {
            for x in 3..5 {
                let i = compact.cell_at(x, z).index() as usize;
                compact.areas[i] = AreaType::NOT_WALKABLE;
            }
        }
        compact.build_layer_regions(0, 0).unwrap();
        assert_eq!(compact.max_region, RegionId::from(1));
        for (span, area) in compact.spans.iter().zip(&compact.areas) {
            let expected = if area.is_walkable() {
                RegionId::from(1)
            } else {
                RegionId::NONE
            };
            assert_eq!(span.region, expected);
        }
    }

    #[test]
    fn stacked_floors_become_separate_layers() {
        let mut heightfield = height_field(6.0);
        for z in 0..6 {
            for x in 0..6 {
                insert(&mut heightfield, x, z, span(0, 1, 1));
                insert(&mut heightfield, x, z, span(10, 11, 1));
            }
        }
        let mut compact = heightfield.into_compact(2, 1).unwrap();
        compact.build_layer_regions(0, 0).unwrap();
        assert_eq!(compact.max_region, RegionId::from(2));
        for z in 0..6 {
            for x in 0..6 {
                let cell = compact.cell_at(x, z);
                let [lower, upper] = [cell.index() as usize, cell.index() as usize + 1];
                assert_ne!(compact.spans[lower].region, compact.spans[upper].region);
                assert_eq!(compact.spans[lower].region, RegionId::from(1));
            }
        }
    }

    #[test]
    fn small_layers_are_removed() {
        let mut compact = flat_compact_heightfield(4);
        compact.build_layer_regions(0, 17).unwrap();
        assert_eq!(compact.max_region, RegionId::NONE);
        assert!(
            compact
                .spans
                .iter()
                .all(|span| span.region == RegionId::NONE)
        );
    }
}
