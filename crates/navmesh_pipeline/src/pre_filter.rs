//! Filters that reclassify heightfield spans an agent cannot stand on.
//! None of them add or remove spans, they only change span areas.

use crate::{
    heightfield::Heightfield,
    math::{dir_offset_x, dir_offset_z},
    span::{AreaType, SpanKey},
};

/// Ceiling of a span that has nothing above it.
const MAX_HEIGHTFIELD_HEIGHT: i32 = 0xffff;

impl Heightfield {
    /// Marks non-walkable spans as walkable if their maximum is within `walkable_climb` of the span below them.
    ///
    /// This removes small obstacles the agent would be able to walk over, such as curbs.
    /// Only the original walkability of the span below is considered, so a stack of
    /// obstacles is not promoted all the way up.
    pub fn filter_low_hanging_walkable_obstacles(&mut self, walkable_climb: u16) {
        for z in 0..self.height {
            for x in 0..self.width {
                let mut previous: Option<(u16, bool, AreaType)> = None;
                let mut span_key = self.span_key_at(x, z);
                while let Some(key) = span_key {
                    let span = self.span_mut(key);
                    let walkable = span.area().is_walkable();

                    if let Some((previous_max, previous_was_walkable, previous_area)) = previous {
                        if !walkable
                            && previous_was_walkable
                            && (span.max() as i32 - previous_max as i32) <= walkable_climb as i32
                        {
                            span.set_area(previous_area);
                        }
                    }

                    // Copy the original walkable value regardless of whether we changed it.
                    previous = Some((span.max(), walkable, span.area()));
                    span_key = span.next();
                }
            }
        }
    }

    /// Marks spans that are ledges as not-walkable.
    ///
    /// A ledge is a span with one or more neighbors whose maximum is further away than `walkable_climb`
    /// from the current span's maximum. Spans on a slope steeper than `walkable_climb` across their
    /// reachable neighbors are also marked as not-walkable.
    pub fn filter_ledge_spans(&mut self, walkable_height: u16, walkable_climb: u16) {
        let walkable_height = walkable_height as i32;
        let walkable_climb = walkable_climb as i32;
        let mut ledges: Vec<SpanKey> = Vec::new();
        for z in 0..self.height {
            for x in 0..self.width {
                for (key, span) in self.column(x, z) {
                    if !span.area().is_walkable() {
                        continue;
                    }
                    let floor = span.max() as i32;
                    let ceiling = self.ceiling_above(span.next());

                    // The difference between this walkable area and the lowest neighbor walkable area.
                    let mut lowest_neighbor_floor_difference = MAX_HEIGHTFIELD_HEIGHT;
                    let mut lowest_traversable_neighbor_floor = floor;
                    let mut highest_traversable_neighbor_floor = floor;

                    for dir in 0..4 {
                        let neighbor_x = x as i32 + dir_offset_x(dir) as i32;
                        let neighbor_z = z as i32 + dir_offset_z(dir) as i32;
                        // The grid edge counts as a drop.
                        if !self.contains(neighbor_x, neighbor_z) {
                            lowest_neighbor_floor_difference = -walkable_climb - 1;
                            break;
                        }
                        let (neighbor_x, neighbor_z) = (neighbor_x as u16, neighbor_z as u16);

                        // The space below the lowest neighbor span counts as a floor at -infinity.
                        let neighbor_ceiling = self
                            .span_at(neighbor_x, neighbor_z)
                            .map_or(MAX_HEIGHTFIELD_HEIGHT, |s| s.min() as i32);
                        if ceiling.min(neighbor_ceiling) - floor >= walkable_height {
                            lowest_neighbor_floor_difference = -walkable_climb - 1;
                            break;
                        }

                        for (_, neighbor) in self.column(neighbor_x, neighbor_z) {
                            let neighbor_floor = neighbor.max() as i32;
                            let neighbor_ceiling = self.ceiling_above(neighbor.next());

                            // Only consider neighbors with enough overlap to be potentially traversable.
                            if ceiling.min(neighbor_ceiling) - floor.max(neighbor_floor)
                                < walkable_height
                            {
                                continue;
                            }

                            let neighbor_floor_difference = neighbor_floor - floor;
                            lowest_neighbor_floor_difference =
                                lowest_neighbor_floor_difference.min(neighbor_floor_difference);

                            if neighbor_floor_difference.abs() <= walkable_climb {
                                lowest_traversable_neighbor_floor =
                                    lowest_traversable_neighbor_floor.min(neighbor_floor);
                                highest_traversable_neighbor_floor =
                                    highest_traversable_neighbor_floor.max(neighbor_floor);
                            } else if neighbor_floor_difference < -walkable_climb {
                                // Already a ledge
                                break;
                            }
                        }
                    }

                    let is_ledge = lowest_neighbor_floor_difference < -walkable_climb;
                    let is_steep = highest_traversable_neighbor_floor
                        - lowest_traversable_neighbor_floor
                        > walkable_climb;
                    if is_ledge || is_steep {
                        ledges.push(key);
                    }
                }
            }
        }
        for key in ledges {
            self.span_mut(key).set_area(AreaType::NOT_WALKABLE);
        }
    }

    /// Marks walkable spans as not walkable if the clearance above the span is less than the specified `walkable_height`.
    pub fn filter_walkable_low_height_spans(&mut self, walkable_height: u16) {
        for column_index in 0..self.spans.len() {
            let mut key = self.spans[column_index];
            while let Some(current) = key {
                let span = self.span(current);
                let floor = span.max() as i32;
                let ceiling = self.ceiling_above(span.next());
                key = span.next();
                if ceiling - floor < walkable_height as i32 {
                    self.span_mut(current).set_area(AreaType::NOT_WALKABLE);
                }
            }
        }
    }

    #[inline]
    fn ceiling_above(&self, next: Option<SpanKey>) -> i32 {
        next.map_or(MAX_HEIGHTFIELD_HEIGHT, |key| self.span(key).min() as i32)
    }
}

#[cfg(test)]
mod tests {
    use crate::heightfield::tests::{height_field, insert, span};
    use crate::span::AreaType;

    fn areas(heightfield: &crate::Heightfield, x: u16, z: u16) -> Vec<AreaType> {
        heightfield.column(x, z).map(|(_, s)| s.area()).collect()
    }

    #[test]
    fn low_hanging_obstacle_becomes_walkable() {
        let mut heightfield = height_field(5.0);
        insert(&mut heightfield, 2, 2, span(0, 2, 1));
        insert(&mut heightfield, 2, 2, span(5, 6, 0));
        heightfield.filter_low_hanging_walkable_obstacles(4);
        assert_eq!(areas(&heightfield, 2, 2), vec![AreaType(1), AreaType(1)]);
    }

    #[test]
    fn low_hanging_obstacle_too_high_stays_unwalkable() {
        let mut heightfield = height_field(5.0);
        insert(&mut heightfield, 2, 2, span(0, 2, 1));
        insert(&mut heightfield, 2, 2, span(5, 9, 0));
        heightfield.filter_low_hanging_walkable_obstacles(4);
        assert_eq!(areas(&heightfield, 2, 2), vec![AreaType(1), AreaType(0)]);
    }

    #[test]
    fn low_hanging_obstacles_do_not_chain() {
        let mut heightfield = height_field(5.0);
        insert(&mut heightfield, 2, 2, span(0, 2, 1));
        insert(&mut heightfield, 2, 2, span(3, 4, 0));
        insert(&mut heightfield, 2, 2, span(5, 6, 0));
        heightfield.filter_low_hanging_walkable_obstacles(4);
        assert_eq!(
            areas(&heightfield, 2, 2),
            vec![AreaType(1), AreaType(1), AreaType(0)]
        );
    }

    #[test]
    fn low_height_spans_become_unwalkable() {
        let mut heightfield = height_field(5.0);
        insert(&mut heightfield, 1, 1, span(0, 2, 1));
        insert(&mut heightfield, 1, 1, span(4, 5, 1));
        heightfield.filter_walkable_low_height_spans(3);
        assert_eq!(areas(&heightfield, 1, 1), vec![AreaType(0), AreaType(1)]);
    }

    #[test]
    fn ledge_filter_marks_grid_edges_and_drops() {
        let mut heightfield = height_field(5.0);
        for z in 0..5 {
            for x in 0..5 {
                insert(&mut heightfield, x, z, span(0, 1, 1));
            }
        }
        heightfield.filter_ledge_spans(2, 1);
        for z in 0..5 {
            for x in 0..5 {
                let on_edge = x == 0 || z == 0 || x == 4 || z == 4;
                let expected = if on_edge { AreaType(0) } else { AreaType(1) };
                assert_eq!(areas(&heightfield, x, z), vec![expected], "at ({x}, {z})");
            }
        }
    }

    #[test]
    fn ledge_filter_marks_cliff_tops() {
        let mut heightfield = height_field(5.0);
        for z in 0..5 {
            for x in 0..5 {
                let top = if x < 3 { 1 } else { 10 };
                insert(&mut heightfield, x, z, span(0, top, 1));
            }
        }
        heightfield.filter_ledge_spans(2, 1);
        // The upper plateau at x=3 looks down the cliff.
        assert_eq!(areas(&heightfield, 3, 2), vec![AreaType(0)]);
        // The lower floor at x=2 has a wall, not a drop, next to it.
        assert_eq!(areas(&heightfield, 2, 2), vec![AreaType(1)]);
        assert_eq!(areas(&heightfield, 1, 2), vec![AreaType(1)]);
    }
}
