//! Watershed partitioning.
//!
//! Floods the distance field from its ridges downwards. This gives the best-shaped regions and the nicest
//! tessellation, at the cost of being the slowest strategy. Small obstacles next to large open areas can
//! leave holes in a region, and narrow spiraling corridors can make regions overlap themselves.

use crate::{
    CompactHeightfield, LogLevel,
    context::stage_log,
    region::{RegionError, RegionId},
};

const LOG_NB_STACKS: usize = 3;
const NB_STACKS: usize = 1 << LOG_NB_STACKS;

impl CompactHeightfield {
    /// Non-null regions will consist of connected, non-overlapping walkable spans that form a single contour.
    /// Contours will form simple polygons.
    ///
    /// If multiple regions form an area that is smaller than `min_region_area`, then all spans will be
    /// re-assigned to [`RegionId::NONE`].
    ///
    /// Watershed partitioning can result in smaller than necessary regions, especially in diagonal corridors.
    /// `merge_region_area` helps reduce unnecessarily small regions.
    ///
    /// The region data will be available via the [`CompactHeightfield::max_region`]
    /// and [`CompactSpan::region`](crate::CompactSpan::region) fields.
    ///
    /// The distance field must be created using [`CompactHeightfield::build_distance_field`] before attempting to build regions.
    ///
    /// # Errors
    ///
    /// Returns an error if the distance field is missing, if too many regions are created,
    /// or if the span connections are inconsistent.
    pub fn build_regions(
        &mut self,
        border_size: u16,
        min_region_area: u16,
        merge_region_area: u16,
    ) -> Result<(), RegionError> {
        if self.dist.len() != self.spans.len() {
            return Err(RegionError::MissingDistanceField);
        }

        let mut level_stacks: [Vec<LevelStackEntry>; NB_STACKS] = [const { Vec::new() }; NB_STACKS];
        for stack in &mut level_stacks {
            stack.reserve(256);
        }
        let mut stack: Vec<LevelStackEntry> = Vec::with_capacity(256);

        let mut src_reg = vec![RegionId::NONE; self.spans.len()];
        let mut src_dist = vec![0_u16; self.spans.len()];

        let mut region_id = self.paint_border_regions(border_size, 1, &mut src_reg);
        self.border_size = border_size;

        let mut level = (self.max_distance + 1) & !1;

        // TODO: Figure better formula, expand_iters defines how much the
        // watershed "overflows" and simplifies the regions. Tying it to
        // agent radius was usually good indication how greedy it could be.
        let expand_iters = 8;

        let mut s_id = NB_STACKS - 1;
        while level > 0 {
            level = level.saturating_sub(2);
            s_id = (s_id + 1) % NB_STACKS;

            if s_id == 0 {
                self.sort_cells_by_level(level, &src_reg, &mut level_stacks, 1);
            } else {
                // copy left overs from last level
                let (src, dst) = level_stacks.split_at_mut(s_id);
                append_stacks(&src[s_id - 1], &mut dst[0], &src_reg);
            }

            self.expand_regions(
                expand_iters,
                level,
                &mut src_reg,
                &mut src_dist,
                &mut level_stacks[s_id],
                false,
            );

            // Mark new regions with IDs.
            for j in 0..level_stacks[s_id].len() {
                let entry = level_stacks[s_id][j];
                let Some(i) = entry.index else {
                    continue;
                };
                if src_reg[i] != RegionId::NONE {
                    continue;
                }
                let region = RegionId::from(region_id);
                if self.flood_region(entry, level, region, &mut src_reg, &mut src_dist, &mut stack)
                {
                    if region_id >= RegionId::BORDER_REGION.bits() - 1 {
                        return Err(RegionError::RegionIdOverflow {
                            count: region_id as usize,
                        });
                    }
                    region_id += 1;
                }
            }
        }

        // Expand current regions until no empty connected cells found.
        self.expand_regions(
            expand_iters * 8,
            0,
            &mut src_reg,
            &mut src_dist,
            &mut stack,
            true,
        );

        // Merge regions and filter out small regions.
        let mut max_region_id = region_id;
        let overlaps = self.merge_and_filter_regions(
            min_region_area,
            merge_region_area,
            &mut max_region_id,
            &mut src_reg,
        )?;
        if !overlaps.is_empty() {
            stage_log(LogLevel::Error, format!("{} overlapping regions.", overlaps.len()));
        }
        self.max_region = RegionId::from(max_region_id);

        // Write the result out.
        for (span, region) in self.spans.iter_mut().zip(src_reg) {
            span.region = region;
        }
        Ok(())
    }

    fn sort_cells_by_level(
        &self,
        start_level: u16,
        src_reg: &[RegionId],
        stacks: &mut [Vec<LevelStackEntry>],
        log_levels_per_stack: u16,
    ) {
        let start_level = start_level >> log_levels_per_stack;
        for stack in stacks.iter_mut() {
            stack.clear();
        }

        // put all cells in the level range into the appropriate stacks
        for z in 0..self.height {
            for x in 0..self.width {
                for i in self.cell_at(x, z).index_range() {
                    if !self.areas[i].is_walkable() || src_reg[i] != RegionId::NONE {
                        continue;
                    }
                    let level = self.dist[i] >> log_levels_per_stack;
                    let s_id = start_level.saturating_sub(level) as usize;
                    if s_id >= stacks.len() {
                        continue;
                    }
                    stacks[s_id].push(LevelStackEntry {
                        x,
                        z,
                        index: Some(i),
                    });
                }
            }
        }
    }

    fn expand_regions(
        &self,
        max_iter: u16,
        level: u16,
        src_reg: &mut [RegionId],
        src_dist: &mut [u16],
        stack: &mut Vec<LevelStackEntry>,
        fill_stack: bool,
    ) {
        if fill_stack {
            // Find cells revealed by the raised level.
            stack.clear();
            for z in 0..self.height {
                for x in 0..self.width {
                    for i in self.cell_at(x, z).index_range() {
                        if self.dist[i] >= level
                            && src_reg[i] == RegionId::NONE
                            && self.areas[i].is_walkable()
                        {
                            stack.push(LevelStackEntry {
                                x,
                                z,
                                index: Some(i),
                            });
                        }
                    }
                }
            }
        } else {
            // use cells in the input stack
            // mark all cells which already have a region
            for entry in stack.iter_mut() {
                if entry.index.is_some_and(|i| src_reg[i] != RegionId::NONE) {
                    entry.index = None;
                }
            }
        }

        let mut dirty_entries = Vec::new();
        let mut iter = 0;
        while !stack.is_empty() {
            let mut failed = 0;
            dirty_entries.clear();

            for entry in stack.iter_mut() {
                let Some(i) = entry.index else {
                    failed += 1;
                    continue;
                };

                let mut r = src_reg[i];
                let mut d2 = u16::MAX;
                let area = self.areas[i];
                for dir in 0..4 {
                    let Some(a_index) = self.neighbor_index(entry.x as i32, entry.z as i32, i, dir)
                    else {
                        continue;
                    };
                    if self.areas[a_index] != area {
                        continue;
                    }
                    let a_region = src_reg[a_index];
                    let a_dist = src_dist[a_index].saturating_add(2);
                    if a_region != RegionId::NONE
                        && !a_region.contains(RegionId::BORDER_REGION)
                        && a_dist < d2
                    {
                        r = a_region;
                        d2 = a_dist;
                    }
                }
                if r != RegionId::NONE {
                    // Mark as used
                    entry.index = None;
                    dirty_entries.push(DirtyEntry {
                        index: i,
                        region: r,
                        distance2: d2,
                    });
                } else {
                    failed += 1;
                }
            }

            // Copy entries that differ between src and dst to keep them in sync.
            for dirty_entry in &dirty_entries {
                src_reg[dirty_entry.index] = dirty_entry.region;
                src_dist[dirty_entry.index] = dirty_entry.distance2;
            }

            if failed == stack.len() {
                break;
            }

            if level > 0 {
                iter += 1;
                if iter >= max_iter {
                    break;
                }
            }
        }
    }

    /// Floods a new region from `start` across all connected spans of the same area at or above `level - 2`.
    /// Returns whether any span was claimed.
    fn flood_region(
        &self,
        start: LevelStackEntry,
        level: u16,
        region: RegionId,
        src_reg: &mut [RegionId],
        src_dist: &mut [u16],
        stack: &mut Vec<LevelStackEntry>,
    ) -> bool {
        let Some(start_index) = start.index else {
            return false;
        };
        let area = self.areas[start_index];

        stack.clear();
        stack.push(start);
        src_reg[start_index] = region;
        src_dist[start_index] = 0;

        let level = level.saturating_sub(2);
        let mut count = 0;

        while let Some(entry) = stack.pop() {
            let Some(ci) = entry.index else {
                continue;
            };
            let (cx, cz) = (entry.x as i32, entry.z as i32);

            // Check if any of the neighbours already have a valid region set.
            let mut neighbor_region = RegionId::NONE;
            for dir in 0..4 {
                // 8 connected
                let Some(con) = self.spans[ci].con(dir) else {
                    continue;
                };
                let (a_x, a_z, a_i) = self.con_indices(cx, cz, dir, con);
                if self.areas[a_i] != area {
                    continue;
                }
                let nr = src_reg[a_i];
                // Do not take borders into account.
                if nr.contains(RegionId::BORDER_REGION) {
                    continue;
                }
                if nr != RegionId::NONE && nr != region {
                    neighbor_region = nr;
                    break;
                }

                let diagonal_dir = (dir + 1) & 0x3;
                let Some(a_i2) = self.neighbor_index(a_x, a_z, a_i, diagonal_dir) else {
                    continue;
                };
                if self.areas[a_i2] != area {
                    continue;
                }
                let nr2 = src_reg[a_i2];
                if nr2 != RegionId::NONE && nr2 != region {
                    neighbor_region = nr2;
                    break;
                }
            }
            if neighbor_region != RegionId::NONE {
                src_reg[ci] = RegionId::NONE;
                continue;
            }

            count += 1;

            // Expand neighbours.
            for dir in 0..4 {
                let Some(con) = self.spans[ci].con(dir) else {
                    continue;
                };
                let (a_x, a_z, a_i) = self.con_indices(cx, cz, dir, con);
                if self.areas[a_i] != area {
                    continue;
                }
                if self.dist[a_i] >= level && src_reg[a_i] == RegionId::NONE {
                    src_reg[a_i] = region;
                    src_dist[a_i] = 0;
                    stack.push(LevelStackEntry {
                        x: a_x as u16,
                        z: a_z as u16,
                        index: Some(a_i),
                    });
                }
            }
        }

        count > 0
    }
}

fn append_stacks(
    src_stack: &[LevelStackEntry],
    dst_stack: &mut Vec<LevelStackEntry>,
    src_region: &[RegionId],
) {
    for entry in src_stack {
        let Some(i) = entry.index else {
            continue;
        };
        if src_region[i] != RegionId::NONE {
            continue;
        }
        dst_stack.push(*entry);
    }
}

#[derive(Clone, Copy, Debug)]
struct LevelStackEntry {
    x: u16,
    z: u16,
    index: Option<usize>,
}

#[derive(Clone, Debug)]
struct DirtyEntry {
    index: usize,
    region: RegionId,
    distance2: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AreaType, compact_heightfield::tests::flat_compact_heightfield};

    fn regions_of(compact: &CompactHeightfield) -> Vec<RegionId> {
        compact.spans.iter().map(|span| span.region).collect()
    }

    #[test]
    fn requires_distance_field() {
        let mut compact = flat_compact_heightfield(4);
        assert_eq!(
            compact.build_regions(0, 0, 0),
            Err(RegionError::MissingDistanceField)
        );
    }

    #[test]
    fn open_square_is_a_single_region() {
        let mut compact = flat_compact_heightfield(10);
        compact.build_distance_field();
        compact.build_regions(0, 0, 20).unwrap();
        assert_eq!(compact.max_region, RegionId::from(1));
        assert!(
            regions_of(&compact)
                .iter()
                .all(|&region| region == RegionId::from(1))
        );
    }

    #[test]
    fn areas_are_split_into_separate_regions() {
        let mut compact = flat_compact_heightfield(10);
        for z in 0..10 {
            for x in 5..10 {
                let i = compact.cell_at(x, z).index() as usize;
                compact.areas[i] = AreaType(2);
            }
        }
        compact.build_distance_field();
        compact.build_regions(0, 0, 0).unwrap();
        assert_eq!(compact.max_region, RegionId::from(2));

        let left = compact.spans[compact.cell_at(0, 0).index() as usize].region;
        let right = compact.spans[compact.cell_at(9, 9).index() as usize].region;
        assert_ne!(left, right);
        for z in 0..10 {
            for x in 0..10 {
                let region = compact.spans[compact.cell_at(x, z).index() as usize].region;
                let expected = if x < 5 { left } else { right };
                assert_eq!(region, expected, "({x}, {z})");
            }
        }
    }

    #[test]
    fn border_is_painted_with_border_regions() {
        let mut compact = flat_compact_heightfield(10);
        compact.build_distance_field();
        compact.build_regions(2, 0, 0).unwrap();
        assert_eq!(compact.border_size, 2);
        for z in 0..10 {
            for x in 0..10 {
                let region = compact.spans[compact.cell_at(x, z).index() as usize].region;
                let in_border = !(2..8).contains(&x) || !(2..8).contains(&z);
                assert_eq!(
                    region.contains(RegionId::BORDER_REGION),
                    in_border,
                    "({x}, {z})"
                );
                if !in_border {
                    assert_eq!(region, RegionId::from(1));
                }
            }
        }
        assert_eq!(compact.max_region, RegionId::from(1));
    }

    #[test]
    fn tiny_regions_are_removed() {
        let mut compact = flat_compact_heightfield(4);
        compact.build_distance_field();
        compact.build_regions(0, 100, 0).unwrap();
        assert_eq!(compact.max_region, RegionId::NONE);
        assert!(
            regions_of(&compact)
                .iter()
                .all(|&region| region == RegionId::NONE)
        );
    }
}
