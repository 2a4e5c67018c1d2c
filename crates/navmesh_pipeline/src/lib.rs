#![doc = include_str!("../../../readme.md")]

mod compact_cell;
mod compact_heightfield;
mod compact_span;
mod config;
mod context;
mod contours;
pub mod debug;
mod detail_mesh;
mod distance_field;
mod erosion;
mod heightfield;
mod layers;
mod main_api;
pub(crate) mod math;
mod monotone;
mod poly_mesh;
mod pre_filter;
mod rasterize;
mod region;
mod span;
mod trimesh;
mod watershed;

pub use compact_cell::CompactCell;
pub use compact_heightfield::{CompactHeightfield, CompactHeightfieldError};
pub use compact_span::CompactSpan;
pub use config::{
    MAX_VERTS_PER_POLYGON, NavmeshConfig, NavmeshConfigBuilder, NavmeshConfigError,
};
pub use context::{
    BuildContext, BuildProgress, BuildStage, CancellationToken, LogEntry, LogLevel,
};
pub use contours::{BuildContoursFlags, Contour, ContourError, ContourSet, RegionVertexId};
pub use detail_mesh::{DETAIL_EDGE_BOUNDARY, DetailNavmesh, DetailNavmeshError, SubMesh};
pub use heightfield::{Heightfield, HeightfieldBuilder, HeightfieldBuilderError, SpanInsertionError};
pub use main_api::{
    BuildErrorKind, BuildOutcome, IntermediateResults, NavmeshBuild, NavmeshBuildError,
    StageError, build_navmesh, build_navmesh_from_buffers,
};
pub use math::Aabb3d;
pub use poly_mesh::{PolygonMeshError, PolygonNavmesh, RC_MESH_NULL_IDX, RC_PORTAL_FLAG};
pub use rasterize::RasterizationError;
pub use region::{PartitionType, RegionError, RegionId};
pub use span::{AreaType, Span, SpanKey, Spans};
pub use trimesh::{TriMesh, TriMeshError};
