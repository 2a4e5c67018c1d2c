//! Monotone partitioning.
//!
//! Sweeps the field row by row. The fastest strategy, and its regions never contain holes or overlaps,
//! but they tend to be long and thin, which can lead to detours in paths.

use crate::{
    CompactHeightfield, LogLevel,
    context::stage_log,
    region::{RegionError, RegionId},
};

/// Marks a sweep span that connects to more than one region of the previous row.
const NULL_NEIGHBOR: u16 = 0xffff;

#[derive(Debug, Clone, Copy, Default)]
struct SweepSpan {
    /// Final region id
    id: u16,
    /// Number of samples connecting to `neighbor`
    samples: u32,
    /// Region of the previous row this sweep connects to
    neighbor: u16,
}

impl CompactHeightfield {
    /// Partitions the walkable surface into regions by sweeping it one row at a time.
    ///
    /// Non-null regions will consist of connected, non-overlapping walkable spans that form a single contour.
    /// Contours will form simple polygons.
    ///
    /// If multiple regions form an area that is smaller than `min_region_area`, then all spans will be
    /// re-assigned to [`RegionId::NONE`].
    ///
    /// Partitioning can result in smaller than necessary regions. `merge_region_area` helps
    /// reduce unnecessarily small regions.
    ///
    /// # Errors
    ///
    /// Returns an error if too many regions are created or if the span connections are inconsistent.
    pub fn build_regions_monotone(
        &mut self,
        border_size: u16,
        min_region_area: u16,
        merge_region_area: u16,
    ) -> Result<(), RegionError> {
        let mut src_reg = vec![RegionId::NONE; self.spans.len()];
        let mut max_region_id = self.sweep_rows(border_size, &mut src_reg)?;

        // Merge regions and filter out small regions.
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

        // Store the result out.
        for (span, region) in self.spans.iter_mut().zip(src_reg) {
            span.region = region;
        }
        Ok(())
    }

    /// Assigns each run of spans in a row to the region of the previous row it uniquely connects to,
    /// or to a fresh region. Returns the next unused region id.
    pub(crate) fn sweep_rows(
        &mut self,
        border_size: u16,
        src_reg: &mut [RegionId],
    ) -> Result<u16, RegionError> {
        // Mark border regions.
        let mut id = self.paint_border_regions(border_size, 1, src_reg);
        self.border_size = border_size;

        let mut sweeps: Vec<SweepSpan> = Vec::with_capacity(self.width.max(self.height) as usize);
        let mut prev: Vec<u32> = Vec::with_capacity(256);

        let border_x = border_size.min(self.width);
        let border_z = border_size.min(self.height);
        // Sweep one line at a time.
        for z in border_z..self.height.saturating_sub(border_z) {
            // Collect spans from this row.
            prev.clear();
            prev.resize(id as usize + 1, 0);
            sweeps.clear();
            // Row-local id 0 is unused.
            sweeps.push(SweepSpan::default());

            for x in border_x..self.width.saturating_sub(border_x) {
                for i in self.cell_at(x, z).index_range() {
                    if !self.areas[i].is_walkable() {
                        continue;
                    }

                    // -x
                    let mut previous_id = self
                        .neighbor_index(x as i32, z as i32, i, 0)
                        .filter(|&a_i| {
                            !src_reg[a_i].contains(RegionId::BORDER_REGION)
                                && self.areas[i] == self.areas[a_i]
                        })
                        .map_or(0, |a_i| src_reg[a_i].bits());

                    if previous_id == 0 {
                        previous_id = sweeps.len() as u16;
                        sweeps.push(SweepSpan::default());
                    }

                    // -z
                    if let Some(a_i) = self.neighbor_index(x as i32, z as i32, i, 3) {
                        let neighbor_region = src_reg[a_i];
                        if neighbor_region != RegionId::NONE
                            && !neighbor_region.contains(RegionId::BORDER_REGION)
                            && self.areas[i] == self.areas[a_i]
                        {
                            let nr = neighbor_region.bits();
                            let sweep = &mut sweeps[previous_id as usize];
                            if sweep.neighbor == 0 || sweep.neighbor == nr {
                                sweep.neighbor = nr;
                                sweep.samples += 1;
                                prev[nr as usize] += 1;
                            } else {
                                sweep.neighbor = NULL_NEIGHBOR;
                            }
                        }
                    }

                    src_reg[i] = RegionId::from(previous_id);
                }
            }

            // Create unique ID.
            for sweep in sweeps.iter_mut().skip(1) {
                if sweep.neighbor != NULL_NEIGHBOR
                    && sweep.neighbor != 0
                    && prev[sweep.neighbor as usize] == sweep.samples
                {
                    sweep.id = sweep.neighbor;
                } else {
                    if id >= RegionId::BORDER_REGION.bits() - 1 {
                        return Err(RegionError::RegionIdOverflow { count: id as usize });
                    }
                    sweep.id = id;
                    id += 1;
                }
            }

            // Remap IDs
            let row_id_count = sweeps.len() as u16;
            for x in border_x..self.width.saturating_sub(border_x) {
                for i in self.cell_at(x, z).index_range() {
                    let region = src_reg[i].bits();
                    if region > 0 && region < row_id_count {
                        src_reg[i] = RegionId::from(sweeps[region as usize].id);
                    }
                }
            }
        }
        Ok(id)
    }
}
