//! Region ids and the passes shared by all partitioning strategies:
//! border painting, removal of tiny regions and merging of small ones.

use thiserror::Error;

use crate::{compact_heightfield::CompactHeightfield, span::AreaType};

bitflags::bitflags! {
    /// The id of a region in a [`CompactHeightfield`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
    #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
    #[repr(transparent)]
    pub struct RegionId: u16 {
        /// The id of spans that are not in a region, i.e. not walkable.
        const NONE = 0;

        /// Heightfield border flag.
        /// If a heightfield region ID has this bit set, then the region is a border
        /// region and its spans are considered un-walkable.
        /// (Used during the region and contour build process.)
        const BORDER_REGION = 0x8000;

        /// The largest representable id, also usable as a mask.
        const MAX = u16::MAX;
    }
}

impl From<u16> for RegionId {
    #[inline]
    fn from(value: u16) -> Self {
        Self::from_bits_retain(value)
    }
}

impl RegionId {
    /// Whether the id is a regular region, i.e. neither [`RegionId::NONE`] nor a border region.
    #[inline]
    pub fn is_regular(self) -> bool {
        self != Self::NONE && !self.contains(Self::BORDER_REGION)
    }
}

/// Strategies for partitioning the walkable surface into regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum PartitionType {
    /// Flood fill from the ridges of a distance field.
    /// Produces the nicest regions but is the slowest.
    #[default]
    Watershed,
    /// Sweep the field row by row.
    /// The fastest option, guaranteed to produce regions without holes or overlaps,
    /// but the regions can be long and thin.
    Monotone,
    /// Sweep the field row by row and merge the results into non-overlapping layers.
    /// Handles stacked surfaces well but produces regions with holes.
    Layers,
}

impl CompactHeightfield {
    /// Partitions the walkable surface into regions with the given strategy.
    ///
    /// For [`PartitionType::Watershed`], the distance field is built first.
    /// [`PartitionType::Layers`] does not merge small regions, so `merge_region_area` is ignored there.
    ///
    /// # Errors
    ///
    /// Returns an error if too many regions are created or if the span connections are inconsistent.
    pub fn partition(
        &mut self,
        partition_type: PartitionType,
        border_size: u16,
        min_region_area: u16,
        merge_region_area: u16,
    ) -> Result<(), RegionError> {
        match partition_type {
            PartitionType::Watershed => {
                self.build_distance_field();
                self.build_regions(border_size, min_region_area, merge_region_area)
            }
            PartitionType::Monotone => {
                self.build_regions_monotone(border_size, min_region_area, merge_region_area)
            }
            PartitionType::Layers => self.build_layer_regions(border_size, min_region_area),
        }
    }
}

/// Errors that can occur when partitioning a [`CompactHeightfield`] into regions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// More regions were created than can be represented by a [`RegionId`].
    #[error("region id overflow after {count} regions")]
    RegionIdOverflow {
        /// Number of regions that were created
        count: usize,
    },
    /// A span claims a connection that does not lead to a neighbor span.
    #[error("broken span connection at ({x}, {z}) in direction {dir}")]
    BrokenConnection {
        /// The x-coordinate of the span
        x: i32,
        /// The z-coordinate of the span
        z: i32,
        /// The direction of the connection
        dir: u8,
    },
    /// The distance field has not been built.
    #[error("the distance field must be built before watershed partitioning")]
    MissingDistanceField,
}

/// Bookkeeping for a single region during the merge passes.
#[derive(Debug, Clone)]
struct Region {
    span_count: usize,
    id: u16,
    area_type: AreaType,
    remap: bool,
    visited: bool,
    overlap: bool,
    connects_to_border: bool,
    y_min: u16,
    y_max: u16,
    /// Neighboring region ids in the order they are met when walking the region outline.
    connections: Vec<u16>,
    /// Region ids stacked above or below this one.
    floors: Vec<u16>,
}

impl Region {
    fn new(id: u16) -> Self {
        Self {
            span_count: 0,
            id,
            area_type: AreaType::NOT_WALKABLE,
            remap: false,
            visited: false,
            overlap: false,
            connects_to_border: false,
            y_min: u16::MAX,
            y_max: 0,
            connections: Vec::new(),
            floors: Vec::new(),
        }
    }

    fn is_live(&self) -> bool {
        RegionId::from(self.id).is_regular()
    }

    fn remove_adjacent_neighbors(&mut self) {
        let mut i = 0;
        while i < self.connections.len() && self.connections.len() > 1 {
            let ni = (i + 1) % self.connections.len();
            if self.connections[i] == self.connections[ni] {
                self.connections.remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn replace_neighbor(&mut self, old_id: u16, new_id: u16) {
        let mut neighbor_changed = false;
        for connection in &mut self.connections {
            if *connection == old_id {
                *connection = new_id;
                neighbor_changed = true;
            }
        }
        for floor in &mut self.floors {
            if *floor == old_id {
                *floor = new_id;
            }
        }
        if neighbor_changed {
            self.remove_adjacent_neighbors();
        }
    }

    fn can_merge_with(&self, other: &Region) -> bool {
        if self.area_type != other.area_type {
            return false;
        }
        let shared_edges = self.connections.iter().filter(|&&c| c == other.id).count();
        if shared_edges > 1 {
            return false;
        }
        !self.floors.contains(&other.id)
    }

    fn add_unique_floor(&mut self, floor: u16) {
        if !self.floors.contains(&floor) {
            self.floors.push(floor);
        }
    }

    fn add_unique_connection(&mut self, connection: u16) {
        if !self.connections.contains(&connection) {
            self.connections.push(connection);
        }
    }

    fn is_connected_to_border(&self) -> bool {
        // Region 0 is the outside of the walkable surface.
        self.connections.contains(&0)
    }
}

/// Merges region `b` into region `a`. Returns `false` if they do not share an edge.
fn merge_regions(a: &mut Region, b: &mut Region) -> bool {
    let a_id = a.id;
    let b_id = b.id;

    let Some(insert_a) = a.connections.iter().position(|&c| c == b_id) else {
        return false;
    };
    let Some(insert_b) = b.connections.iter().position(|&c| c == a_id) else {
        return false;
    };

    // Splice the outline of b into the outline of a at the shared edge.
    let a_connections = std::mem::take(&mut a.connections);
    let a_len = a_connections.len();
    let b_len = b.connections.len();
    a.connections.extend((0..a_len - 1).map(|i| a_connections[(insert_a + 1 + i) % a_len]));
    a.connections
        .extend((0..b_len - 1).map(|i| b.connections[(insert_b + 1 + i) % b_len]));
    a.remove_adjacent_neighbors();

    for &floor in &b.floors {
        a.add_unique_floor(floor);
    }
    a.span_count += b.span_count;
    b.span_count = 0;
    b.connections.clear();
    true
}

/// Borrows two distinct regions mutably.
fn pair_mut(regions: &mut [Region], a: usize, b: usize) -> (&mut Region, &mut Region) {
    debug_assert_ne!(a, b);
    if a < b {
        let (left, right) = regions.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = regions.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

/// Renumbers the live regions to `1..=n` in order of first appearance and returns `n`.
fn compress_region_ids(regions: &mut [Region]) -> u16 {
    for region in regions.iter_mut() {
        region.remap = region.is_live();
    }
    let mut region_id_gen = 0;
    for i in 0..regions.len() {
        if !regions[i].remap {
            continue;
        }
        let old_id = regions[i].id;
        region_id_gen += 1;
        for region in regions[i..].iter_mut() {
            if region.id == old_id {
                region.id = region_id_gen;
                region.remap = false;
            }
        }
    }
    region_id_gen
}

fn remap_spans(regions: &[Region], src_reg: &mut [RegionId]) {
    for region in src_reg.iter_mut() {
        if !region.contains(RegionId::BORDER_REGION) {
            *region = RegionId::from(regions[region.bits() as usize].id);
        }
    }
}

impl CompactHeightfield {
    /// Assigns `region` to every walkable span inside the rectangle `[min_x, max_x) x [min_z, max_z)`.
    pub(crate) fn paint_rect_region(
        &self,
        min_x: u16,
        max_x: u16,
        min_z: u16,
        max_z: u16,
        region: RegionId,
        src_reg: &mut [RegionId],
    ) {
        for z in min_z..max_z {
            for x in min_x..max_x {
                for i in self.cell_at(x, z).index_range() {
                    if self.areas[i].is_walkable() {
                        src_reg[i] = region;
                    }
                }
            }
        }
    }

    /// Paints the border of the field with border regions.
    /// Returns the next free region id.
    pub(crate) fn paint_border_regions(
        &self,
        border_size: u16,
        mut region_id: u16,
        src_reg: &mut [RegionId],
    ) -> u16 {
        if border_size == 0 {
            return region_id;
        }
        let (w, h) = (self.width, self.height);
        let border_width = w.min(border_size);
        let border_height = h.min(border_size);
        let rects = [
            (0, border_width, 0, h),
            (w - border_width, w, 0, h),
            (0, w, 0, border_height),
            (0, w, h - border_height, h),
        ];
        for (min_x, max_x, min_z, max_z) in rects {
            let region = RegionId::from(region_id) | RegionId::BORDER_REGION;
            self.paint_rect_region(min_x, max_x, min_z, max_z, region, src_reg);
            region_id += 1;
        }
        region_id
    }

    fn is_solid_edge(&self, src_reg: &[RegionId], x: i32, z: i32, i: usize, dir: u8) -> bool {
        let region = self
            .neighbor_index(x, z, i, dir)
            .map_or(RegionId::NONE, |a_i| src_reg[a_i]);
        region != src_reg[i]
    }

    /// Walks the outline of the region of span `i`, collecting the ids of the neighboring regions in order.
    fn walk_region_contour(
        &self,
        mut x: i32,
        mut z: i32,
        mut i: usize,
        mut dir: u8,
        src_reg: &[RegionId],
        contour: &mut Vec<u16>,
    ) -> Result<(), RegionError> {
        let start_dir = dir;
        let start_i = i;

        let mut current_region = self
            .neighbor_index(x, z, i, dir)
            .map_or(RegionId::NONE, |a_i| src_reg[a_i]);
        contour.push(current_region.bits());

        for _ in 0..40_000 {
            if self.is_solid_edge(src_reg, x, z, i, dir) {
                // Choose the edge corner
                let region = self
                    .neighbor_index(x, z, i, dir)
                    .map_or(RegionId::NONE, |a_i| src_reg[a_i]);
                if region != current_region {
                    current_region = region;
                    contour.push(current_region.bits());
                }
                // Rotate clockwise
                dir = (dir + 1) & 0x3;
            } else {
                let Some(con) = self.spans[i].con(dir) else {
                    return Err(RegionError::BrokenConnection { x, z, dir });
                };
                let (n_x, n_z, n_i) = self.con_indices(x, z, dir, con);
                x = n_x;
                z = n_z;
                i = n_i;
                // Rotate counterclockwise
                dir = (dir + 3) & 0x3;
            }

            if start_i == i && start_dir == dir {
                break;
            }
        }

        // Remove adjacent duplicates.
        if contour.len() > 1 {
            let mut j = 0;
            while j < contour.len() {
                let nj = (j + 1) % contour.len();
                if contour[j] == contour[nj] && contour.len() > 1 {
                    contour.remove(j);
                } else {
                    j += 1;
                }
            }
        }
        Ok(())
    }

    /// Removes regions that are too small and merges small regions into their neighbors.
    /// Region ids are compacted afterwards and `max_region_id` is updated.
    /// Returns the ids of regions that overlap themselves vertically.
    pub(crate) fn merge_and_filter_regions(
        &self,
        min_region_area: u16,
        merge_region_size: u16,
        max_region_id: &mut u16,
        src_reg: &mut [RegionId],
    ) -> Result<Vec<u16>, RegionError> {
        let region_count = *max_region_id as usize + 1;
        let mut regions: Vec<Region> = (0..region_count).map(|i| Region::new(i as u16)).collect();

        // Find edge of a region and find connections around the contour.
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = *self.cell_at(x, z);
                for i in cell.index_range() {
                    let r = src_reg[i].bits() as usize;
                    if r == 0 || r >= region_count {
                        continue;
                    }
                    regions[r].span_count += 1;

                    // Update floors.
                    for j in cell.index_range() {
                        if i == j {
                            continue;
                        }
                        let floor_id = src_reg[j].bits();
                        if floor_id == 0 || floor_id as usize >= region_count {
                            continue;
                        }
                        if floor_id as usize == r {
                            regions[r].overlap = true;
                        }
                        regions[r].add_unique_floor(floor_id);
                    }

                    // Have found contour
                    if !regions[r].connections.is_empty() {
                        continue;
                    }
                    regions[r].area_type = self.areas[i];

                    // Check if this cell is next to a border.
                    let (x, z) = (x as i32, z as i32);
                    let edge_dir = (0..4).find(|&dir| self.is_solid_edge(src_reg, x, z, i, dir));
                    if let Some(dir) = edge_dir {
                        // The cell is at border. Walk around the contour to find all the neighbors.
                        let mut connections = Vec::new();
                        self.walk_region_contour(x, z, i, dir, src_reg, &mut connections)?;
                        regions[r].connections = connections;
                    }
                }
            }
        }

        // Ids that were handed out but never received any spans.
        for region in regions.iter_mut() {
            if region.span_count == 0 {
                region.id = 0;
            }
        }

        // Remove too small regions.
        let mut stack = Vec::with_capacity(32);
        let mut trace = Vec::with_capacity(32);
        for i in 0..region_count {
            let region = &regions[i];
            if !region.is_live() || region.span_count == 0 || region.visited {
                continue;
            }

            // Count the total size of all the connected regions.
            // Also keep track of the regions connected to a field border.
            let mut connects_to_border = false;
            let mut span_count = 0;
            stack.clear();
            trace.clear();

            regions[i].visited = true;
            stack.push(i);
            while let Some(ri) = stack.pop() {
                span_count += regions[ri].span_count;
                trace.push(ri);
                for j in 0..regions[ri].connections.len() {
                    let connection = regions[ri].connections[j];
                    if RegionId::from(connection).contains(RegionId::BORDER_REGION) {
                        connects_to_border = true;
                        continue;
                    }
                    let neighbor = &mut regions[connection as usize];
                    if neighbor.visited || !neighbor.is_live() {
                        continue;
                    }
                    neighbor.visited = true;
                    stack.push(connection as usize);
                }
            }

            // Regions connected to a field border cannot have their size estimated correctly,
            // so they are kept.
            if span_count < min_region_area as usize && !connects_to_border {
                for &ri in &trace {
                    regions[ri].span_count = 0;
                    regions[ri].id = 0;
                }
            }
        }

        // Merge too small regions to neighbor regions.
        loop {
            let mut merge_count = 0;
            for i in 0..region_count {
                let region = &regions[i];
                if !region.is_live() || region.overlap || region.span_count == 0 {
                    continue;
                }

                // Big regions touching the outside are kept as they are.
                if region.span_count > merge_region_size as usize
                    && region.is_connected_to_border()
                {
                    continue;
                }

                // Find the smallest neighbor region that connects to this one.
                let mut smallest = usize::MAX;
                let mut merge_id = region.id;
                for &connection in &region.connections {
                    if RegionId::from(connection).contains(RegionId::BORDER_REGION) {
                        continue;
                    }
                    let neighbor = &regions[connection as usize];
                    if !neighbor.is_live() || neighbor.overlap {
                        continue;
                    }
                    if neighbor.span_count < smallest
                        && region.can_merge_with(neighbor)
                        && neighbor.can_merge_with(region)
                    {
                        smallest = neighbor.span_count;
                        merge_id = neighbor.id;
                    }
                }

                if merge_id == region.id {
                    continue;
                }
                let old_id = region.id;
                let (target, source) = pair_mut(&mut regions, merge_id as usize, i);
                if !merge_regions(target, source) {
                    continue;
                }
                // Fixup regions pointing to the current region.
                for other in regions.iter_mut() {
                    if !other.is_live() {
                        continue;
                    }
                    // If another region was already merged into the current region,
                    // point it at the new one as well.
                    if other.id == old_id {
                        other.id = merge_id;
                    }
                    other.replace_neighbor(old_id, merge_id);
                }
                merge_count += 1;
            }
            if merge_count == 0 {
                break;
            }
        }

        *max_region_id = compress_region_ids(&mut regions);
        remap_spans(&regions, src_reg);

        Ok(regions
            .iter()
            .filter(|region| region.overlap)
            .map(|region| region.id)
            .collect())
    }

    /// Merges monotone regions into non-overlapping layers and removes layers that are too small.
    /// Region ids are compacted afterwards and `max_region_id` is updated.
    pub(crate) fn merge_and_filter_layer_regions(
        &self,
        min_region_area: u16,
        max_region_id: &mut u16,
        src_reg: &mut [RegionId],
    ) -> Result<(), RegionError> {
        let region_count = *max_region_id as usize + 1;
        let mut regions: Vec<Region> = (0..region_count).map(|i| Region::new(i as u16)).collect();

        // Find region neighbors and overlapping regions.
        let mut layer_regions = Vec::with_capacity(32);
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = *self.cell_at(x, z);
                layer_regions.clear();

                for i in cell.index_range() {
                    let span = &self.spans[i];
                    let ri = src_reg[i].bits();
                    if ri == 0 || ri as usize >= region_count {
                        continue;
                    }
                    let region = &mut regions[ri as usize];
                    region.span_count += 1;
                    region.area_type = self.areas[i];
                    region.y_min = region.y_min.min(span.y);
                    region.y_max = region.y_max.max(span.y);

                    // Collect all region layers.
                    layer_regions.push(ri);

                    // Update neighbors
                    for dir in 0..4 {
                        let Some(a_i) = self.neighbor_index(x as i32, z as i32, i, dir) else {
                            continue;
                        };
                        let rai = src_reg[a_i];
                        if rai.bits() > 0 && (rai.bits() as usize) < region_count && rai.bits() != ri
                        {
                            regions[ri as usize].add_unique_connection(rai.bits());
                        }
                        if rai.contains(RegionId::BORDER_REGION) {
                            regions[ri as usize].connects_to_border = true;
                        }
                    }
                }

                // Update overlapping regions.
                for i in 0..layer_regions.len() {
                    for j in i + 1..layer_regions.len() {
                        let (a, b) = (layer_regions[i], layer_regions[j]);
                        if a != b {
                            regions[a as usize].add_unique_floor(b);
                            regions[b as usize].add_unique_floor(a);
                        }
                    }
                }
            }
        }

        // Create 2D layers from regions.
        let mut layer_id = 1;
        for region in regions.iter_mut() {
            region.id = 0;
        }

        // Merge monotone regions to create non-overlapping areas.
        let mut queue = std::collections::VecDeque::with_capacity(32);
        for i in 1..region_count {
            // Skip already visited and empty regions.
            if regions[i].id != 0 || regions[i].span_count == 0 {
                continue;
            }

            regions[i].id = layer_id;
            queue.clear();
            queue.push_back(i);

            while let Some(ri) = queue.pop_front() {
                for j in 0..regions[ri].connections.len() {
                    let neighbor = regions[ri].connections[j] as usize;
                    // Skip already visited.
                    if regions[neighbor].id != 0 {
                        continue;
                    }
                    // Skip if different area type, do not connect regions with different area type.
                    if regions[ri].area_type != regions[neighbor].area_type {
                        continue;
                    }
                    // Skip if the neighbor is overlapping the root region.
                    if regions[i].floors.contains(&(neighbor as u16)) {
                        continue;
                    }

                    queue.push_back(neighbor);
                    let (root, other) = pair_mut(&mut regions, i, neighbor);
                    other.id = layer_id;
                    // Merge current layers to root.
                    for &floor in &other.floors {
                        root.add_unique_floor(floor);
                    }
                    root.y_min = root.y_min.min(other.y_min);
                    root.y_max = root.y_max.max(other.y_max);
                    root.span_count += other.span_count;
                    other.span_count = 0;
                    root.connects_to_border |= other.connects_to_border;
                }
            }

            if layer_id == RegionId::BORDER_REGION.bits() - 1 {
                return Err(RegionError::RegionIdOverflow {
                    count: layer_id as usize,
                });
            }
            layer_id += 1;
        }

        // Remove small regions
        for i in 0..region_count {
            let region = &regions[i];
            if region.span_count > 0
                && region.span_count < min_region_area as usize
                && !region.connects_to_border
            {
                let id = region.id;
                for other in regions.iter_mut() {
                    if other.id == id {
                        other.id = 0;
                    }
                }
            }
        }

        *max_region_id = compress_region_ids(&mut regions);
        remap_spans(&regions, src_reg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: u16, connections: &[u16]) -> Region {
        let mut region = Region::new(id);
        region.connections = connections.to_vec();
        region.span_count = 10;
        region.area_type = AreaType(1);
        region
    }

    #[test]
    fn border_flag_is_not_a_regular_region() {
        assert!(!RegionId::NONE.is_regular());
        assert!(!(RegionId::from(3) | RegionId::BORDER_REGION).is_regular());
        assert!(RegionId::from(3).is_regular());
    }

    #[test]
    fn merging_splices_outlines() {
        // Region 1 is surrounded by 0 and 2, region 2 by 1 and 3.
        let mut a = region(1, &[0, 2]);
        let mut b = region(2, &[1, 3]);
        assert!(merge_regions(&mut a, &mut b));
        assert_eq!(a.connections, vec![0, 3]);
        assert_eq!(a.span_count, 20);
        assert_eq!(b.span_count, 0);
        assert!(b.connections.is_empty());
    }

    #[test]
    fn regions_without_shared_edge_do_not_merge() {
        let mut a = region(1, &[0]);
        let mut b = region(2, &[0]);
        assert!(!merge_regions(&mut a, &mut b));
        assert_eq!(a.span_count, 10);
    }

    #[test]
    fn cannot_merge_across_areas_or_floors() {
        let a = region(1, &[2]);
        let mut b = region(2, &[1]);
        assert!(a.can_merge_with(&b));
        b.area_type = AreaType(2);
        assert!(!a.can_merge_with(&b));

        let mut a = region(1, &[2]);
        a.floors.push(2);
        let b = region(2, &[1]);
        assert!(!a.can_merge_with(&b));
    }

    #[test]
    fn compress_renumbers_in_order() {
        let mut regions = vec![region(0, &[]), region(5, &[]), region(0, &[]), region(5, &[])];
        regions.push(region(9, &[]));
        let max = compress_region_ids(&mut regions);
        assert_eq!(max, 2);
        let ids: Vec<_> = regions.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 0, 1, 2]);
    }
}
