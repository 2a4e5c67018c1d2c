use crate::{CompactHeightfield, span::AreaType};

impl CompactHeightfield {
    /// Erode the walkable area by agent radius.
    ///
    /// Every walkable span closer than `walkable_radius` cells to a non-walkable span or to the edge
    /// of the walkable surface is marked as [`AreaType::NOT_WALKABLE`].
    pub fn erode_walkable_area(&mut self, walkable_radius: u16) {
        let mut distance_to_boundary = vec![u16::MAX; self.spans.len()];

        // Mark boundary cells.
        for z in 0..self.height {
            for x in 0..self.width {
                for span_index in self.cell_at(x, z).index_range() {
                    if !self.areas[span_index].is_walkable() {
                        distance_to_boundary[span_index] = 0;
                        continue;
                    }
                    // Check that there is a non-null adjacent span in each of the 4 cardinal directions.
                    let neighbor_count = (0..4)
                        .filter_map(|dir| self.neighbor_index(x as i32, z as i32, span_index, dir))
                        .filter(|&neighbor| self.areas[neighbor].is_walkable())
                        .count();

                    // At least one missing neighbour, so this is a boundary cell.
                    if neighbor_count != 4 {
                        distance_to_boundary[span_index] = 0;
                    }
                }
            }
        }

        self.propagate_chamfer_distance(&mut distance_to_boundary);

        let threshold = walkable_radius.saturating_mul(2);
        for (area, distance) in self.areas.iter_mut().zip(distance_to_boundary) {
            if distance < threshold {
                *area = AreaType::NOT_WALKABLE;
            }
        }
    }
}
