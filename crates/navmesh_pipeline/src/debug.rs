//! Colors and geometry for drawing intermediate and final build results.

use glam::Vec3;

use crate::{AreaType, PolygonNavmesh, RC_MESH_NULL_IDX};

/// An RGBA color with 8 bits per channel.
pub type Rgba = [u8; 4];

/// Color of polygons with the [`AreaType::DEFAULT_WALKABLE`] area.
pub const WALKABLE_POLYGON_COLOR: Rgba = [0, 192, 255, 64];

/// Color of polygons with the [`AreaType::NOT_WALKABLE`] area.
pub const NULL_POLYGON_COLOR: Rgba = [0, 0, 0, 64];

/// Spreads the lower six bits of `i` over the color channels so that consecutive ids get distinct colors.
pub fn int_to_color(i: u32, alpha: u8) -> Rgba {
    let bit = |shift: u32| ((i >> shift) & 1) as u8;
    let r = bit(1) + bit(3) * 2 + 1;
    let g = bit(2) + bit(4) * 2 + 1;
    let b = bit(0) + bit(5) * 2 + 1;
    [r * 63, g * 63, b * 63, alpha]
}

/// Opaque color for an area type.
pub fn area_to_color(area: AreaType) -> Rgba {
    if area == AreaType::NOT_WALKABLE {
        [0, 192, 255, 255]
    } else {
        int_to_color(area.0 as u32, 255)
    }
}

/// Translucent color used for polygons of the given area.
pub fn polygon_color(area: AreaType) -> Rgba {
    match area {
        AreaType::DEFAULT_WALKABLE => WALKABLE_POLYGON_COLOR,
        AreaType::NOT_WALKABLE => NULL_POLYGON_COLOR,
        area => area_to_color(area),
    }
}

/// A vertex of a colored triangle list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebugVertex {
    /// World-space position
    pub position: Vec3,
    /// Color of the vertex
    pub color: Rgba,
}

impl PolygonNavmesh {
    /// Fans every polygon into triangles, three [`DebugVertex`]es per triangle.
    ///
    /// Positions are in world space and lifted by one cell height so they are drawn on top of the input geometry.
    pub fn debug_triangles(&self) -> Vec<DebugVertex> {
        let mut triangles = Vec::new();
        let origin = self.aabb.min;
        let scale = Vec3::new(self.cell_size, self.cell_height, self.cell_size);
        let to_world = |index: u16| {
            let vertex = self.vertices[index as usize].as_vec3() + Vec3::Y;
            origin + vertex * scale
        };
        for i in 0..self.polygon_count() {
            let color = polygon_color(self.areas[i]);
            let polygon = self.polygon(i);
            for j in 2..polygon.len() {
                if polygon[j] == RC_MESH_NULL_IDX {
                    break;
                }
                for index in [polygon[0], polygon[j - 1], polygon[j]] {
                    triangles.push(DebugVertex {
                        position: to_world(index),
                        color,
                    });
                }
            }
        }
        triangles
    }
}

#[cfg(test)]
mod tests {
    use glam::U16Vec3;

    use super::*;
    use crate::{Aabb3d, RegionId};

    #[test]
    fn ids_interleave_into_channels() {
        assert_eq!(int_to_color(0, 255), [63, 63, 63, 255]);
        assert_eq!(int_to_color(1, 255), [63, 63, 126, 255]);
        assert_eq!(int_to_color(2, 128), [126, 63, 63, 128]);
        assert_eq!(int_to_color(4, 0), [63, 126, 63, 0]);
        assert_eq!(int_to_color(63, 255), [252, 252, 252, 255]);
        // Only the lower six bits matter.
        assert_eq!(int_to_color(64 + 5, 255), int_to_color(5, 255));
    }

    #[test]
    fn area_colors() {
        assert_eq!(polygon_color(AreaType::DEFAULT_WALKABLE), WALKABLE_POLYGON_COLOR);
        assert_eq!(polygon_color(AreaType::NOT_WALKABLE), NULL_POLYGON_COLOR);
        assert_eq!(area_to_color(AreaType::NOT_WALKABLE), [0, 192, 255, 255]);
        assert_eq!(polygon_color(AreaType(3)), int_to_color(3, 255));
    }

    #[test]
    fn polygons_are_fanned_in_world_space() {
        let mesh = PolygonNavmesh {
            vertices: vec![
                U16Vec3::new(0, 1, 0),
                U16Vec3::new(0, 1, 4),
                U16Vec3::new(4, 1, 4),
                U16Vec3::new(4, 1, 0),
            ],
            polygons: vec![0, 1, 2, 3, RC_MESH_NULL_IDX, RC_MESH_NULL_IDX],
            polygon_neighbors: vec![RC_MESH_NULL_IDX; 6],
            regions: vec![RegionId::from(1)],
            flags: vec![0],
            areas: vec![AreaType::DEFAULT_WALKABLE],
            max_vertices_per_polygon: 6,
            aabb: Aabb3d::new(Vec3::new(10.0, 0.0, 0.0), Vec3::new(12.0, 1.0, 2.0)),
            cell_size: 0.5,
            cell_height: 0.25,
            border_size: 0,
            max_edge_error: 1.3,
        };
        let triangles = mesh.debug_triangles();
        assert_eq!(triangles.len(), 6);
        assert_eq!(triangles[0].position, Vec3::new(10.0, 0.5, 0.0));
        assert_eq!(triangles[1].position, Vec3::new(10.0, 0.5, 2.0));
        assert_eq!(triangles[2].position, Vec3::new(12.0, 0.5, 2.0));
        assert_eq!(triangles[5].position, Vec3::new(12.0, 0.5, 0.0));
        assert!(
            triangles
                .iter()
                .all(|vertex| vertex.color == WALKABLE_POLYGON_COLOR)
        );
    }
}
