//! Distance from every span to the nearest boundary of its walkable area,
//! used to grow watershed regions from the middle of open areas outwards.

use crate::CompactHeightfield;

impl CompactHeightfield {
    /// Prepare for region partitioning, by calculating distance field along the walkable surface.
    ///
    /// A span is a boundary span when it is missing a neighbor with the same area type in any of the
    /// four cardinal directions. The distances are then smoothed with a box blur and stored in
    /// [`CompactHeightfield::dist`], while [`CompactHeightfield::max_distance`] holds the largest unsmoothed value.
    pub fn build_distance_field(&mut self) {
        let mut src = vec![u16::MAX; self.spans.len()];

        // Mark boundary cells.
        for z in 0..self.height {
            for x in 0..self.width {
                for i in self.cell_at(x, z).index_range() {
                    let area = self.areas[i];
                    let same_area_neighbors = (0..4)
                        .filter_map(|dir| self.neighbor_index(x as i32, z as i32, i, dir))
                        .filter(|&a_i| self.areas[a_i] == area)
                        .count();
                    if same_area_neighbors != 4 {
                        src[i] = 0;
                    }
                }
            }
        }

        self.propagate_chamfer_distance(&mut src);
        self.max_distance = src.iter().copied().max().unwrap_or(0);

        let mut dst = vec![0_u16; self.spans.len()];
        self.box_blur(1, &src, &mut dst);
        self.dist = dst;
    }

    /// Two-pass chamfer distance transform.
    /// Spans seeded with 0 are boundaries, everything else should start at [`u16::MAX`].
    /// Orthogonal steps cost 2 and diagonal steps cost 3.
    pub(crate) fn propagate_chamfer_distance(&self, dist: &mut [u16]) {
        let relax = |dist: &mut [u16], i: usize, from: usize, cost: u16| {
            let candidate = dist[from].saturating_add(cost);
            if candidate < dist[i] {
                dist[i] = candidate;
            }
        };

        // Pass 1
        for z in 0..self.height {
            for x in 0..self.width {
                for i in self.cell_at(x, z).index_range() {
                    self.relax_towards(x, z, i, [0, 3], dist, relax);
                    self.relax_towards(x, z, i, [3, 2], dist, relax);
                }
            }
        }

        // Pass 2
        for z in (0..self.height).rev() {
            for x in (0..self.width).rev() {
                for i in self.cell_at(x, z).index_range() {
                    self.relax_towards(x, z, i, [2, 1], dist, relax);
                    self.relax_towards(x, z, i, [1, 0], dist, relax);
                }
            }
        }
    }

    /// Relaxes span `i` from its neighbor in direction `dirs[0]`,
    /// and from the diagonal reached by turning towards `dirs[1]` from there.
    #[inline]
    fn relax_towards(
        &self,
        x: u16,
        z: u16,
        i: usize,
        [dir, diagonal_dir]: [u8; 2],
        dist: &mut [u16],
        relax: impl Fn(&mut [u16], usize, usize, u16),
    ) {
        let Some(con) = self.spans[i].con(dir) else {
            return;
        };
        let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, dir, con);
        relax(dist, i, a_i, 2);

        if let Some(aa_i) = self.neighbor_index(a_x, a_z, a_i, diagonal_dir) {
            relax(dist, i, aa_i, 3);
        }
    }

    fn box_blur(&self, threshold: u16, src: &[u16], dst: &mut [u16]) {
        let threshold = threshold * 2;
        for z in 0..self.height {
            for x in 0..self.width {
                for i in self.cell_at(x, z).index_range() {
                    let center = src[i];
                    if center <= threshold {
                        dst[i] = center;
                        continue;
                    }

                    let center = center as u32;
                    let mut d = center;
                    for dir in 0..4 {
                        let Some(con) = self.spans[i].con(dir) else {
                            d += center * 2;
                            continue;
                        };
                        let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, dir, con);
                        d += src[a_i] as u32;

                        let diagonal_dir = (dir + 1) & 0x3;
                        match self.neighbor_index(a_x, a_z, a_i, diagonal_dir) {
                            Some(aa_i) => d += src[aa_i] as u32,
                            None => d += center,
                        }
                    }
                    dst[i] = ((d + 5) / 9) as u16;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::compact_heightfield::tests::flat_compact_heightfield;

    #[test]
    fn boundary_spans_have_zero_distance() {
        let mut compact = flat_compact_heightfield(7);
        compact.build_distance_field();
        for z in 0..7_u16 {
            for x in 0..7_u16 {
                let i = compact.cell_at(x, z).index() as usize;
                if x == 0 || z == 0 || x == 6 || z == 6 {
                    assert_eq!(compact.dist[i], 0, "({x}, {z})");
                }
            }
        }
    }

    #[test]
    fn distance_grows_towards_the_center() {
        let mut compact = flat_compact_heightfield(7);
        compact.build_distance_field();
        // The center is three orthogonal steps away from the border.
        assert_eq!(compact.max_distance, 6);
        let center = compact.cell_at(3, 3).index() as usize;
        let near_border = compact.cell_at(1, 3).index() as usize;
        assert_eq!(compact.dist[near_border], 2);
        assert!(compact.dist[center] > compact.dist[near_border]);
        assert_eq!(compact.dist.len(), compact.spans.len());
    }

    #[test]
    fn different_areas_form_a_boundary() {
        let mut compact = flat_compact_heightfield(7);
        let i = compact.cell_at(3, 3).index() as usize;
        compact.areas[i] = crate::AreaType(7);
        compact.build_distance_field();
        assert_eq!(compact.dist[i], 0);
        // Every span next to the odd center is a boundary, so nothing is more than one step away from one.
        assert_eq!(compact.max_distance, 2);
        let beside = compact.cell_at(2, 3).index() as usize;
        assert_eq!(compact.dist[beside], 0);
    }
}
