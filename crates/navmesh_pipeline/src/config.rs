use thiserror::Error;

use crate::{Aabb3d, BuildContoursFlags, PartitionType, TriMesh};

/// Largest number of vertices per polygon a [`NavmeshConfig`] accepts.
pub const MAX_VERTS_PER_POLYGON: u16 = 6;

/// Specifies a configuration to use when building a navmesh. Usually built using [`NavmeshConfigBuilder`].
///
/// This is an aggregation of parameters used at different stages of the build.
/// Units are either in voxels (vx) or world units (wu). The size of a voxel is given by
/// [`Self::cell_size`] on the xz-plane and [`Self::cell_height`] along the y-axis.
///
/// > Note:
/// >
/// > First you should decide the size of your agent's logical cylinder.
/// > If your game world uses meters as units, a reasonable starting point for a human-sized agent
/// > might be a radius of 0.4 and a height of 2.0.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavmeshConfig {
    /// The width of the field along the x-axis. `[Limit: >= 0] [Units: vx]`
    pub width: u16,

    /// The height of the field along the z-axis. `[Limit: >= 0] [Units: vx]`
    pub height: u16,

    /// The size of the non-navigable border around the heightfield. `[Limit: >=0] [Units: vx]`
    ///
    /// This value represents the the closest the walkable area of the heightfield should come to the xz-plane AABB of the field.
    /// It does not have any impact on the borders around internal obstructions.
    pub border_size: u16,

    /// The xz-plane cell size to use for fields. `[Limit: > 0] [Units: wu]`.
    ///
    /// This value is usually derived from the agent radius r. A recommended starting value is either r/2 or r/3.
    /// Smaller values increase the resolution of the navmesh, but build time grows quickly.
    pub cell_size: f32,

    /// The y-axis cell size to use for fields. `[Limit: > 0] [Units: wu]`
    ///
    /// A good starting point is half of [`Self::cell_size`].
    /// Smaller values let the navmesh connect areas that are only separated by a small curb or ditch.
    pub cell_height: f32,

    /// The field's AABB [Units: wu]
    pub aabb: Aabb3d,

    /// The maximum slope that is considered walkable. `[Limits: 0 <= value < 0.5*π] [Units: Radians]`
    ///
    /// This is the maximum angle the surface normal of a triangle can differ from the world's up vector.
    pub walkable_slope_angle: f32,

    /// Minimum floor to 'ceiling' height that will still allow the floor area to
    /// be considered walkable. `[Limit: >= 3] [Units: vx]`
    ///
    /// Derived from the agent height h as `(h / cell_height).ceil()`.
    pub walkable_height: u16,

    /// Maximum ledge height that is considered to still be traversable. `[Limit: >=0] [Units: vx]`
    ///
    /// Derived from the agent's maximum climb as `(max_climb / cell_height).floor()`.
    /// Allows the mesh to flow over low lying obstructions such as curbs and up/down stairways.
    pub walkable_climb: u16,

    /// The distance to erode/shrink the walkable area of the heightfield away from
    /// obstructions.  `[Limit: >=0] [Units: vx]`
    ///
    /// Derived from the agent radius r as `(r / cell_size).ceil()`.
    /// A radius of zero gives a tight-fitting navmesh, but leaves collision with the navmesh edges to the user.
    pub walkable_radius: u16,

    /// The maximum allowed length for contour edges along the border of the mesh. `[Limit: >=0] [Units: vx]`
    ///
    /// Extra vertices will be inserted as needed to keep contour edges below this length.
    /// A value of zero effectively disables this feature.
    pub max_edge_len: u16,

    /// The maximum distance a simplified contour's border edges should deviate
    /// the original raw contour. `[Limit: >=0] [Units: vx]`
    ///
    /// Good values are in the range `[1.1, 1.5]`. Below that, sawtoothing appears at the edges.
    /// Above that, the simplification starts to cut corners.
    pub max_simplification_error: f32,

    /// The minimum number of spans allowed to form isolated island areas. `[Limit: >=0] [Units: vx]`
    ///
    /// Any regions that are smaller than this area will be marked as unwalkable.
    /// This is useful in removing useless regions that can sometimes form on geometry such as table tops, box tops, etc.
    pub min_region_area: u16,

    /// Any regions with a span count smaller than this value will, if possible,
    /// be merged with larger regions. `[Limit: >=0] [Units: vx]`
    pub merge_region_area: u16,

    /// The maximum number of vertices allowed for polygons generated during the
    /// contour to polygon conversion process. `[Limit: 3..=MAX_VERTS_PER_POLYGON]`
    pub max_vertices_per_polygon: u16,

    /// Sets the sampling distance to use when generating the detail mesh.
    /// (For height detail only.) `[Limits: 0 or >= 0.9] [Units: wu]`
    pub detail_sample_dist: f32,

    /// The maximum distance the detail mesh surface should deviate from heightfield
    /// data. (For height detail only.) `[Limit: >=0] [Units: wu]`
    pub detail_sample_max_error: f32,

    /// Flags controlling the [`ContourSet`](crate::ContourSet) generation process.
    pub contour_flags: BuildContoursFlags,

    /// The algorithm used to partition the walkable surface into regions.
    pub partition_type: PartitionType,

    /// Whether to run [`Heightfield::filter_low_hanging_walkable_obstacles`](crate::Heightfield::filter_low_hanging_walkable_obstacles).
    pub filter_low_hanging_obstacles: bool,

    /// Whether to run [`Heightfield::filter_ledge_spans`](crate::Heightfield::filter_ledge_spans).
    pub filter_ledge_spans: bool,

    /// Whether to run [`Heightfield::filter_walkable_low_height_spans`](crate::Heightfield::filter_walkable_low_height_spans).
    pub filter_walkable_low_height_spans: bool,

    /// Whether the heightfield, compact heightfield and contours are returned alongside the meshes.
    pub keep_intermediate_results: bool,
}

impl NavmeshConfig {
    /// Checks that the configuration can be used for a build.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is not finite, if the cell sizes are not positive,
    /// if the slope is outside of `[0, π/2]` or if the number of vertices per polygon is out of range.
    pub fn validate(&self) -> Result<(), NavmeshConfigError> {
        let floats = [
            ("cell_size", self.cell_size),
            ("cell_height", self.cell_height),
            ("walkable_slope_angle", self.walkable_slope_angle),
            ("max_simplification_error", self.max_simplification_error),
            ("detail_sample_dist", self.detail_sample_dist),
            ("detail_sample_max_error", self.detail_sample_max_error),
        ];
        if let Some(&(name, _)) = floats.iter().find(|(_, value)| !value.is_finite()) {
            return Err(NavmeshConfigError::NonFinite { name });
        }
        if !self.aabb.min.is_finite() || !self.aabb.max.is_finite() {
            return Err(NavmeshConfigError::NonFinite { name: "aabb" });
        }
        if self.cell_size <= 0.0 || self.cell_height <= 0.0 {
            return Err(NavmeshConfigError::NonPositiveCellSize {
                cell_size: self.cell_size,
                cell_height: self.cell_height,
            });
        }
        if !(0.0..=std::f32::consts::FRAC_PI_2).contains(&self.walkable_slope_angle) {
            return Err(NavmeshConfigError::InvalidSlope {
                angle: self.walkable_slope_angle,
            });
        }
        if !(3..=MAX_VERTS_PER_POLYGON).contains(&self.max_vertices_per_polygon) {
            return Err(NavmeshConfigError::InvalidVerticesPerPolygon {
                value: self.max_vertices_per_polygon,
            });
        }
        Ok(())
    }
}

/// Errors reported by [`NavmeshConfig::validate`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NavmeshConfigError {
    /// A parameter is NaN or infinite.
    #[error("{name} must be finite")]
    NonFinite {
        /// Name of the parameter
        name: &'static str,
    },
    /// The cell dimensions are zero or negative.
    #[error("cell size and cell height must be positive, got {cell_size} and {cell_height}")]
    NonPositiveCellSize {
        /// The configured cell size
        cell_size: f32,
        /// The configured cell height
        cell_height: f32,
    },
    /// The walkable slope is not an angle between flat and vertical.
    #[error("walkable slope angle must be within [0, π/2] radians, got {angle}")]
    InvalidSlope {
        /// The configured angle
        angle: f32,
    },
    /// The number of vertices per polygon is out of range.
    #[error("vertices per polygon must be within [3, {MAX_VERTS_PER_POLYGON}], got {value}")]
    InvalidVerticesPerPolygon {
        /// The configured value
        value: u16,
    },
}

/// A builder for [`NavmeshConfig`]. The config has lots of interdependent configurations,
/// so this builder provides a convenient way to set all the necessary parameters in world units.
/// The default values are chosen to be reasonable for an agent resembling an adult human.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavmeshConfigBuilder {
    /// The xz-plane cell size to use for fields. `[Limit: > 0] [Units: wu]`.
    /// See [`NavmeshConfig::cell_size`].
    pub cell_size: f32,
    /// The y-axis cell size to use for fields. `[Limit: > 0] [Units: wu]`
    /// See [`NavmeshConfig::cell_height`].
    pub cell_height: f32,
    /// The height of the agent. `[Limit: > 0] [Units: wu]`
    ///
    /// It's often a good idea to add a little bit of padding to the height. For example,
    /// an agent that is 1.8 world units tall might want to set this value to 2.0 units.
    pub agent_height: f32,
    /// The radius of the agent. `[Limit: > 0] [Units: wu]`
    pub agent_radius: f32,
    /// The maximum height of steps and ledges the agent can walk up. `[Limit: >= 0] [Units: wu]`
    pub agent_max_climb: f32,
    /// The maximum slope the agent can walk on. `[Limits: 0 <= value < 0.5*π] [Units: Radians]`
    pub agent_max_slope: f32,
    /// The side length of the smallest square of walkable area that is kept as its own island. `[Units: vx]`
    pub region_min_size: f32,
    /// The side length of the square area below which regions are merged into their neighbors. `[Units: vx]`
    pub region_merge_size: f32,
    /// The maximum length of contour edges along the border of the mesh. `[Units: wu]`
    pub edge_max_len: f32,
    /// The maximum deviation of simplified contours from the raw contours. `[Units: vx]`
    pub edge_max_error: f32,
    /// The maximum number of vertices per polygon. `[Limit: 3..=MAX_VERTS_PER_POLYGON]`
    pub verts_per_poly: f32,
    /// The detail mesh sampling distance in cells. Values below 0.9 disable sampling.
    pub detail_sample_dist: f32,
    /// The maximum deviation of the detail mesh from the heightfield in cells.
    pub detail_sample_max_error: f32,
    /// The size of the non-navigable border around the heightfield. `[Units: vx]`
    pub border_size: u16,
    /// The AABB of the area to build the navmesh for. [Units: wu]
    pub aabb: Aabb3d,
    /// Flags controlling the contour generation.
    pub contour_flags: BuildContoursFlags,
    /// The algorithm used to partition the walkable surface into regions.
    pub partition_type: PartitionType,
    /// See [`NavmeshConfig::filter_low_hanging_obstacles`].
    pub filter_low_hanging_obstacles: bool,
    /// See [`NavmeshConfig::filter_ledge_spans`].
    pub filter_ledge_spans: bool,
    /// See [`NavmeshConfig::filter_walkable_low_height_spans`].
    pub filter_walkable_low_height_spans: bool,
    /// See [`NavmeshConfig::keep_intermediate_results`].
    pub keep_intermediate_results: bool,
}

impl Default for NavmeshConfigBuilder {
    fn default() -> Self {
        Self {
            cell_size: 0.3,
            cell_height: 0.2,
            agent_height: 2.0,
            agent_radius: 0.6,
            agent_max_climb: 0.9,
            agent_max_slope: 45.0_f32.to_radians(),
            region_min_size: 8.0,
            region_merge_size: 20.0,
            edge_max_len: 12.0,
            edge_max_error: 1.3,
            verts_per_poly: 6.0,
            detail_sample_dist: 6.0,
            detail_sample_max_error: 1.0,
            border_size: 0,
            aabb: Aabb3d::default(),
            contour_flags: BuildContoursFlags::default(),
            partition_type: PartitionType::default(),
            filter_low_hanging_obstacles: true,
            filter_ledge_spans: true,
            filter_walkable_low_height_spans: true,
            keep_intermediate_results: false,
        }
    }
}

impl NavmeshConfigBuilder {
    /// Builds a [`NavmeshConfig`] from the current configuration, converting world units to voxels.
    pub fn build(self) -> NavmeshConfig {
        NavmeshConfig {
            width: ((self.aabb.max.x - self.aabb.min.x) / self.cell_size + 0.5) as u16,
            height: ((self.aabb.max.z - self.aabb.min.z) / self.cell_size + 0.5) as u16,
            border_size: self.border_size,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            aabb: self.aabb,
            walkable_slope_angle: self.agent_max_slope,
            walkable_height: (self.agent_height / self.cell_height).ceil() as u16,
            walkable_climb: (self.agent_max_climb / self.cell_height).floor() as u16,
            walkable_radius: (self.agent_radius / self.cell_size).ceil() as u16,
            max_edge_len: (self.edge_max_len / self.cell_size) as u16,
            max_simplification_error: self.edge_max_error,
            // Note: area = size*size
            min_region_area: (self.region_min_size * self.region_min_size) as u16,
            merge_region_area: (self.region_merge_size * self.region_merge_size) as u16,
            max_vertices_per_polygon: self.verts_per_poly as u16,
            detail_sample_dist: if self.detail_sample_dist < 0.9 {
                0.0
            } else {
                self.cell_size * self.detail_sample_dist
            },
            detail_sample_max_error: self.cell_height * self.detail_sample_max_error,
            contour_flags: self.contour_flags,
            partition_type: self.partition_type,
            filter_low_hanging_obstacles: self.filter_low_hanging_obstacles,
            filter_ledge_spans: self.filter_ledge_spans,
            filter_walkable_low_height_spans: self.filter_walkable_low_height_spans,
            keep_intermediate_results: self.keep_intermediate_results,
        }
    }

    /// Builds a [`NavmeshConfig`] covering the bounds of `trimesh`.
    /// An empty mesh leaves [`Self::aabb`] untouched.
    pub fn build_for_mesh(mut self, trimesh: &TriMesh) -> NavmeshConfig {
        if let Some(aabb) = trimesh.compute_aabb() {
            self.aabb = aabb;
        }
        self.build()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use glam::Vec3;

    use super::*;

    fn builder() -> NavmeshConfigBuilder {
        NavmeshConfigBuilder {
            cell_size: 0.25,
            cell_height: 0.25,
            aabb: Aabb3d::new(Vec3::ZERO, Vec3::new(10.0, 2.0, 5.0)),
            ..Default::default()
        }
    }

    #[test]
    fn height_rounds_up_and_climb_rounds_down() {
        let config = NavmeshConfigBuilder {
            agent_height: 1.1,
            agent_max_climb: 0.9,
            agent_radius: 0.3,
            ..builder()
        }
        .build();
        // 4.4 voxels of height are not enough for 4 voxels of clearance.
        assert_eq!(config.walkable_height, 5);
        // A 3.6 voxel step is only climbable up to 3 voxels.
        assert_eq!(config.walkable_climb, 3);
        assert_eq!(config.walkable_radius, 2);

        let exact = NavmeshConfigBuilder {
            agent_height: 2.0,
            agent_max_climb: 0.5,
            ..builder()
        }
        .build();
        assert_eq!(exact.walkable_height, 8);
        assert_eq!(exact.walkable_climb, 2);
    }

    #[test]
    fn derived_values() {
        let config = builder().build();
        assert_eq!(config.width, 40);
        assert_eq!(config.height, 20);
        assert_eq!(config.max_edge_len, 48);
        assert_eq!(config.min_region_area, 64);
        assert_eq!(config.merge_region_area, 400);
        assert_eq!(config.max_vertices_per_polygon, 6);
        assert_relative_eq!(config.detail_sample_dist, 1.5);
        assert_relative_eq!(config.detail_sample_max_error, 0.25);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn small_detail_sample_distance_disables_sampling() {
        let config = NavmeshConfigBuilder {
            detail_sample_dist: 0.5,
            ..builder()
        }
        .build();
        assert_eq!(config.detail_sample_dist, 0.0);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let config = builder().build();
        assert!(matches!(
            NavmeshConfig {
                cell_size: 0.0,
                ..config.clone()
            }
            .validate(),
            Err(NavmeshConfigError::NonPositiveCellSize { .. })
        ));
        assert_eq!(
            NavmeshConfig {
                cell_height: f32::NAN,
                ..config.clone()
            }
            .validate(),
            Err(NavmeshConfigError::NonFinite {
                name: "cell_height"
            })
        );
        assert_eq!(
            NavmeshConfig {
                max_vertices_per_polygon: 2,
                ..config.clone()
            }
            .validate(),
            Err(NavmeshConfigError::InvalidVerticesPerPolygon { value: 2 })
        );
        assert_eq!(
            NavmeshConfig {
                max_vertices_per_polygon: MAX_VERTS_PER_POLYGON + 1,
                ..config.clone()
            }
            .validate(),
            Err(NavmeshConfigError::InvalidVerticesPerPolygon {
                value: MAX_VERTS_PER_POLYGON + 1
            })
        );
        assert!(matches!(
            NavmeshConfig {
                walkable_slope_angle: -0.1,
                ..config
            }
            .validate(),
            Err(NavmeshConfigError::InvalidSlope { .. })
        ));
    }

    #[test]
    fn build_for_mesh_uses_mesh_bounds() {
        let trimesh =
            TriMesh::from_buffers(&[[0.0, 0.0, 0.0], [0.0, 0.0, 3.0], [6.0, 1.0, 0.0]], &[
                0, 1, 2,
            ])
            .unwrap();
        let config = NavmeshConfigBuilder {
            cell_size: 0.5,
            ..Default::default()
        }
        .build_for_mesh(&trimesh);
        assert_eq!(config.aabb.max, Vec3::new(6.0, 1.0, 3.0));
        assert_eq!(config.width, 12);
        assert_eq!(config.height, 6);
    }

    #[cfg(feature = "serialize")]
    #[test]
    fn config_survives_json() {
        let config = builder().build();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: NavmeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
