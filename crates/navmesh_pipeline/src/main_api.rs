//! The whole pipeline, from a [`TriMesh`] to a [`PolygonNavmesh`] and its [`DetailNavmesh`].

use std::time::Instant;

use thiserror::Error;

use crate::{
    Aabb3d, CompactHeightfield, CompactHeightfieldError, ContourError, ContourSet, DetailNavmesh,
    DetailNavmeshError, Heightfield, HeightfieldBuilder, HeightfieldBuilderError, NavmeshConfig,
    NavmeshConfigError, PolygonMeshError, PolygonNavmesh, RasterizationError, RegionError,
    TriMesh, TriMeshError,
    context::{BuildContext, BuildStage, LogLevel},
};

/// The meshes produced by a successful build.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavmeshBuild {
    /// The polygons agents walk on.
    pub polygon_mesh: PolygonNavmesh,
    /// The height detail of each polygon.
    pub detail_mesh: DetailNavmesh,
    /// The data of the earlier stages.
    /// Only present if [`NavmeshConfig::keep_intermediate_results`] is set and the input produced walkable spans.
    pub intermediates: Option<IntermediateResults>,
}

/// Data of the earlier stages of a build, kept for inspection and debug drawing.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct IntermediateResults {
    /// The filtered heightfield.
    pub heightfield: Heightfield,
    /// The eroded and partitioned compact heightfield.
    pub compact_heightfield: CompactHeightfield,
    /// The simplified region outlines.
    pub contours: ContourSet,
}

/// How a build that did not fail ended.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// All stages ran.
    Completed(NavmeshBuild),
    /// The [`CancellationToken`](crate::CancellationToken) of the context was cancelled.
    Cancelled {
        /// The stage that would have run next.
        stage: BuildStage,
    },
}

impl BuildOutcome {
    /// The build, if it was not cancelled.
    pub fn completed(self) -> Option<NavmeshBuild> {
        match self {
            BuildOutcome::Completed(build) => Some(build),
            BuildOutcome::Cancelled { .. } => None,
        }
    }

    /// Whether the build was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildOutcome::Cancelled { .. })
    }
}

/// Broad classification of a [`NavmeshBuildError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildErrorKind {
    /// Memory for a buffer could not be reserved.
    AllocationFailure,
    /// The input geometry cannot be turned into a navmesh, e.g. because its bounds are too large or too thin.
    DegenerateInput,
    /// The configuration is unusable.
    InvalidConfig,
    /// A stage failed for any other reason.
    StageFailure,
}

/// The error of the stage that stopped a build.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    /// See [`NavmeshConfigError`].
    #[error(transparent)]
    Config(#[from] NavmeshConfigError),
    /// See [`TriMeshError`].
    #[error(transparent)]
    TriMesh(#[from] TriMeshError),
    /// See [`HeightfieldBuilderError`].
    #[error(transparent)]
    Heightfield(#[from] HeightfieldBuilderError),
    /// See [`RasterizationError`].
    #[error(transparent)]
    Rasterization(#[from] RasterizationError),
    /// See [`CompactHeightfieldError`].
    #[error(transparent)]
    CompactHeightfield(#[from] CompactHeightfieldError),
    /// See [`RegionError`].
    #[error(transparent)]
    Region(#[from] RegionError),
    /// See [`ContourError`].
    #[error(transparent)]
    Contour(#[from] ContourError),
    /// See [`PolygonMeshError`].
    #[error(transparent)]
    PolygonMesh(#[from] PolygonMeshError),
    /// See [`DetailNavmeshError`].
    #[error(transparent)]
    DetailMesh(#[from] DetailNavmeshError),
}

impl StageError {
    fn kind(&self) -> BuildErrorKind {
        match self {
            StageError::Config(_)
            | StageError::Heightfield(HeightfieldBuilderError::InvalidCellSize { .. })
            | StageError::PolygonMesh(PolygonMeshError::InvalidVerticesPerPolygon { .. })
            | StageError::DetailMesh(DetailNavmeshError::TooManyVerticesPerPolygon { .. }) => {
                BuildErrorKind::InvalidConfig
            }
            StageError::Heightfield(HeightfieldBuilderError::Allocation { .. })
            | StageError::CompactHeightfield(CompactHeightfieldError::Allocation { .. }) => {
                BuildErrorKind::AllocationFailure
            }
            StageError::Rasterization(err) if err.is_allocation_failure() => {
                BuildErrorKind::AllocationFailure
            }
            StageError::TriMesh(_)
            | StageError::Heightfield(_)
            | StageError::CompactHeightfield(_) => BuildErrorKind::DegenerateInput,
            StageError::Rasterization(_)
            | StageError::Region(_)
            | StageError::Contour(_)
            | StageError::PolygonMesh(_)
            | StageError::DetailMesh(_) => BuildErrorKind::StageFailure,
        }
    }
}

/// Error returned by [`build_navmesh`]. Names the stage that failed and why.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("navmesh build failed in the {stage} stage: {source}")]
pub struct NavmeshBuildError {
    /// The stage that failed.
    pub stage: BuildStage,
    /// Classification of the failure.
    pub kind: BuildErrorKind,
    /// The error reported by the stage.
    #[source]
    pub source: StageError,
}

impl NavmeshBuildError {
    /// Wraps the error of a stage.
    pub fn new(stage: BuildStage, source: impl Into<StageError>) -> Self {
        let source = source.into();
        Self {
            stage,
            kind: source.kind(),
            source,
        }
    }

    /// Classification of the failure.
    pub fn kind(&self) -> BuildErrorKind {
        self.kind
    }
}

/// Builds a navmesh for `trimesh`.
///
/// Runs all stages in order: the triangles are classified by slope and rasterized into a [`Heightfield`],
/// which is filtered, compacted, eroded by the agent radius and partitioned into regions.
/// The region outlines are traced into a [`ContourSet`], which is turned into a [`PolygonNavmesh`]
/// and finally a [`DetailNavmesh`].
///
/// The heightfield covers [`NavmeshConfig::aabb`]. If that box is empty on the xz-plane,
/// the bounds of `trimesh` are used instead.
/// A mesh without triangles, or without walkable triangles, results in empty meshes.
///
/// # Errors
///
/// Returns an error if the config is invalid or a stage fails. Cancellation is not an error,
/// it is reported as [`BuildOutcome::Cancelled`].
pub fn build_navmesh(
    trimesh: &TriMesh,
    config: &NavmeshConfig,
    ctx: &mut BuildContext,
) -> Result<BuildOutcome, NavmeshBuildError> {
    let start = Instant::now();
    let result = run_pipeline(trimesh, config, ctx);
    ctx.add_total_duration(start.elapsed());
    match result {
        Ok(build) => {
            ctx.log(
                LogLevel::Info,
                format!(
                    " - {} polygons, {} detail triangles in {:.1} ms",
                    build.polygon_mesh.polygon_count(),
                    build.detail_mesh.triangles.len(),
                    start.elapsed().as_secs_f64() * 1000.0
                ),
            );
            Ok(BuildOutcome::Completed(build))
        }
        Err(Interrupt::Cancelled(stage)) => {
            ctx.log(
                LogLevel::Info,
                format!("Build cancelled before the {stage} stage"),
            );
            Ok(BuildOutcome::Cancelled { stage })
        }
        Err(Interrupt::Failed(err)) => {
            ctx.log(LogLevel::Error, err.to_string());
            Err(err)
        }
    }
}

/// Ingests raw vertex and index buffers with [`TriMesh::from_buffers`] and builds a navmesh for them.
/// See [`build_navmesh`].
///
/// # Errors
///
/// Returns an error if the buffers are malformed, the config is invalid or a stage fails.
pub fn build_navmesh_from_buffers(
    positions: &[[f32; 3]],
    indices: &[u32],
    config: &NavmeshConfig,
    ctx: &mut BuildContext,
) -> Result<BuildOutcome, NavmeshBuildError> {
    if ctx.is_cancelled() {
        return Ok(BuildOutcome::Cancelled {
            stage: BuildStage::Ingest,
        });
    }
    let trimesh = ctx
        .time_stage(BuildStage::Ingest, |_| {
            TriMesh::from_buffers(positions, indices)
        })
        .map_err(|source| NavmeshBuildError::new(BuildStage::Ingest, source))?;
    build_navmesh(&trimesh, config, ctx)
}

enum Interrupt {
    Cancelled(BuildStage),
    Failed(NavmeshBuildError),
}

/// Runs a single stage: checks for cancellation, times the stage and reports progress once it is done.
fn run_stage<T>(
    ctx: &mut BuildContext,
    stage: BuildStage,
    f: impl FnOnce(&mut BuildContext) -> Result<T, StageError>,
) -> Result<T, Interrupt> {
    if ctx.is_cancelled() {
        return Err(Interrupt::Cancelled(stage));
    }
    let value = ctx
        .time_stage(stage, f)
        .map_err(|source| Interrupt::Failed(NavmeshBuildError::new(stage, source)))?;
    ctx.report_progress(stage);
    Ok(value)
}

fn run_pipeline(
    trimesh: &TriMesh,
    config: &NavmeshConfig,
    ctx: &mut BuildContext,
) -> Result<NavmeshBuild, Interrupt> {
    let ingested = run_stage(ctx, BuildStage::Ingest, |ctx| {
        config.validate()?;
        let Some(mesh_aabb) = trimesh.compute_aabb().filter(|_| !trimesh.is_empty()) else {
            ctx.log(LogLevel::Warn, "Input mesh has no triangles");
            return Ok(None);
        };
        let size = config.aabb.size();
        let aabb = if size.x > 0.0 && size.z > 0.0 {
            config.aabb
        } else {
            mesh_aabb
        };
        ctx.log(LogLevel::Info, "Building navigation:");
        ctx.log(
            LogLevel::Info,
            format!(
                " - {:.1}K verts, {:.1}K tris",
                trimesh.vertices.len() as f32 / 1000.0,
                trimesh.indices.len() as f32 / 1000.0
            ),
        );
        Ok(Some((trimesh.clone(), aabb)))
    })?;
    let Some((mut trimesh, aabb)) = ingested else {
        return Ok(empty_build(config, config.aabb));
    };

    let heightfield = run_stage(ctx, BuildStage::Rasterize, |ctx| {
        trimesh.mark_walkable_triangles(config.walkable_slope_angle);
        if trimesh.walkable_triangle_count() == 0 {
            ctx.log(LogLevel::Warn, "Input mesh has no walkable triangles");
            return Ok(None);
        }
        let mut heightfield = HeightfieldBuilder {
            aabb,
            cell_size: config.cell_size,
            cell_height: config.cell_height,
        }
        .build()?;
        ctx.log(
            LogLevel::Info,
            format!(" - {} x {} cells", heightfield.width, heightfield.height),
        );
        heightfield.rasterize_triangles(&trimesh, config.walkable_climb)?;
        Ok(Some(heightfield))
    })?;
    drop(trimesh);
    let Some(mut heightfield) = heightfield else {
        return Ok(empty_build(config, aabb));
    };

    run_stage(ctx, BuildStage::Filter, |ctx| {
        if config.filter_low_hanging_obstacles {
            heightfield.filter_low_hanging_walkable_obstacles(config.walkable_climb);
        }
        if config.filter_ledge_spans {
            heightfield.filter_ledge_spans(config.walkable_height, config.walkable_climb);
        }
        if config.filter_walkable_low_height_spans {
            heightfield.filter_walkable_low_height_spans(config.walkable_height);
        }
        ctx.log(
            LogLevel::Debug,
            format!(
                " - {} of {} spans walkable",
                heightfield.walkable_span_count(),
                heightfield.span_count()
            ),
        );
        Ok(())
    })?;
    if heightfield.walkable_span_count() == 0 {
        ctx.log(LogLevel::Warn, "No walkable spans left after filtering");
        return Ok(empty_build(config, aabb));
    }

    let compact = run_stage(ctx, BuildStage::Partition, |ctx| {
        let mut compact = CompactHeightfield::from_heightfield(
            &heightfield,
            config.walkable_height,
            config.walkable_climb,
        )?;
        compact.erode_walkable_area(config.walkable_radius);
        compact.partition(
            config.partition_type,
            config.border_size,
            config.min_region_area,
            config.merge_region_area,
        )?;
        ctx.log(
            LogLevel::Debug,
            format!(
                " - {} regions from {:?} partitioning",
                compact.max_region.bits(),
                config.partition_type
            ),
        );
        Ok(compact)
    })?;
    let heightfield = config.keep_intermediate_results.then_some(heightfield);

    let contours = run_stage(ctx, BuildStage::Contour, |ctx| {
        let contours = compact.build_contours(
            config.max_simplification_error,
            config.max_edge_len,
            config.contour_flags,
        )?;
        ctx.log(
            LogLevel::Debug,
            format!(" - {} contours", contours.contours.len()),
        );
        Ok(contours)
    })?;

    let polygon_mesh = run_stage(ctx, BuildStage::PolygonBuild, |_| {
        Ok(PolygonNavmesh::from_contours(
            &contours,
            config.max_vertices_per_polygon as usize,
        )?)
    })?;

    let detail_mesh = run_stage(ctx, BuildStage::DetailBuild, |_| {
        Ok(DetailNavmesh::new(
            &polygon_mesh,
            &compact,
            config.detail_sample_dist,
            config.detail_sample_max_error,
        )?)
    })?;

    let intermediates = heightfield.map(|heightfield| IntermediateResults {
        heightfield,
        compact_heightfield: compact,
        contours,
    });
    Ok(NavmeshBuild {
        polygon_mesh,
        detail_mesh,
        intermediates,
    })
}

fn empty_build(config: &NavmeshConfig, aabb: Aabb3d) -> NavmeshBuild {
    NavmeshBuild {
        polygon_mesh: PolygonNavmesh {
            vertices: Vec::new(),
            polygons: Vec::new(),
            polygon_neighbors: Vec::new(),
            regions: Vec::new(),
            flags: Vec::new(),
            areas: Vec::new(),
            max_vertices_per_polygon: config.max_vertices_per_polygon as usize,
            aabb,
            cell_size: config.cell_size,
            cell_height: config.cell_height,
            border_size: config.border_size,
            max_edge_error: config.max_simplification_error,
        },
        detail_mesh: DetailNavmesh::default(),
        intermediates: None,
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::{CancellationToken, NavmeshConfigBuilder};

    fn quad(size: f32) -> TriMesh {
        TriMesh::from_buffers(
            &[
                [0.0, 0.0, 0.0],
                [size, 0.0, 0.0],
                [size, 0.0, size],
                [0.0, 0.0, size],
            ],
            &[0, 2, 1, 0, 3, 2],
        )
        .unwrap()
    }

    fn config() -> NavmeshConfig {
        NavmeshConfigBuilder {
            cell_size: 0.5,
            cell_height: 0.5,
            agent_radius: 0.5,
            region_min_size: 2.0,
            aabb: Aabb3d::new(Vec3::new(0.0, -1.0, 0.0), Vec3::new(10.0, 1.0, 10.0)),
            ..Default::default()
        }
        .build()
    }

    #[test]
    fn invalid_config_is_reported_for_ingest() {
        let config = NavmeshConfig {
            max_vertices_per_polygon: 12,
            ..config()
        };
        let err = build_navmesh(&quad(10.0), &config, &mut BuildContext::new()).unwrap_err();
        assert_eq!(err.stage, BuildStage::Ingest);
        assert_eq!(err.kind(), BuildErrorKind::InvalidConfig);
    }

    #[test]
    fn malformed_buffers_are_degenerate_input() {
        let err = build_navmesh_from_buffers(
            &[[0.0; 3]; 3],
            &[0, 1],
            &config(),
            &mut BuildContext::new(),
        )
        .unwrap_err();
        assert_eq!(err.stage, BuildStage::Ingest);
        assert_eq!(err.kind(), BuildErrorKind::DegenerateInput);
        assert!(matches!(err.source, StageError::TriMesh(_)));
    }

    #[test]
    fn cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let mut ctx = BuildContext::new().with_cancellation(token);
        let outcome = build_navmesh(&quad(10.0), &config(), &mut ctx).unwrap();
        assert_eq!(outcome, BuildOutcome::Cancelled {
            stage: BuildStage::Ingest
        });
    }

    #[test]
    fn flat_quad_builds_and_logs() {
        let mut ctx = BuildContext::new();
        let build = build_navmesh(&quad(10.0), &config(), &mut ctx)
            .unwrap()
            .completed()
            .unwrap();
        assert!(build.polygon_mesh.polygon_count() > 0);
        assert_eq!(
            build.detail_mesh.meshes.len(),
            build.polygon_mesh.polygon_count()
        );
        assert!(build.intermediates.is_none());
        assert!(
            ctx.log_entries()
                .iter()
                .any(|entry| entry.message == " - 20 x 20 cells")
        );
    }

    #[test]
    fn intermediates_are_kept_on_request() {
        let config = NavmeshConfig {
            keep_intermediate_results: true,
            ..config()
        };
        let build = build_navmesh(&quad(10.0), &config, &mut BuildContext::new())
            .unwrap()
            .completed()
            .unwrap();
        let intermediates = build.intermediates.unwrap();
        assert_eq!(intermediates.heightfield.width, 20);
        assert!(intermediates.compact_heightfield.max_region.bits() >= 1);
        assert!(!intermediates.contours.contours.is_empty());
        assert_eq!(
            intermediates.contours.aabb,
            build.polygon_mesh.aabb
        );
    }
}
