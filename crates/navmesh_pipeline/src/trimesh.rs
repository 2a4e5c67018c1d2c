//! The triangle soup consumed by the pipeline, expressed as a [`TriMesh`].

use std::collections::HashMap;

use glam::{UVec3, Vec3A};
use thiserror::Error;

use crate::{
    math::{Aabb3d, TriangleIndices as _},
    span::AreaType,
};

/// A mesh used as input for [`Heightfield`](crate::Heightfield) rasterization.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TriMesh {
    /// The vertices composing the mesh.
    /// Follows the convention of a triangle list.
    pub vertices: Vec<Vec3A>,

    /// The indices composing the mesh.
    /// Follows the convention of a triangle list.
    pub indices: Vec<UVec3>,

    /// The area types of the trimesh. Each index corresponds 1:1 to the [`TriMesh::indices`].
    pub area_types: Vec<AreaType>,
}

impl TriMesh {
    /// Copies raw vertex and index buffers into a [`TriMesh`].
    ///
    /// Vertices with bit-identical positions are merged, keeping the first occurrence,
    /// and triangles that collapse to fewer than three distinct vertices are dropped.
    /// All triangles start out as [`AreaType::NOT_WALKABLE`].
    ///
    /// # Errors
    ///
    /// Returns an error if the index buffer does not describe a triangle list over `positions`,
    /// or if any position is not finite.
    pub fn from_buffers(positions: &[[f32; 3]], indices: &[u32]) -> Result<Self, TriMeshError> {
        if indices.len() % 3 != 0 {
            return Err(TriMeshError::IndexCountNotMultipleOfThree { len: indices.len() });
        }
        if positions.len() > u32::MAX as usize {
            return Err(TriMeshError::TooManyVertices {
                len: positions.len(),
            });
        }

        let mut vertices = Vec::with_capacity(positions.len());
        let mut remap = Vec::with_capacity(positions.len());
        let mut seen: HashMap<[u32; 3], u32> = HashMap::with_capacity(positions.len());
        for (index, position) in positions.iter().enumerate() {
            if !position.iter().all(|c| c.is_finite()) {
                return Err(TriMeshError::NonFiniteVertex { index });
            }
            let key = position.map(f32::to_bits);
            let deduplicated = *seen.entry(key).or_insert_with(|| {
                vertices.push(Vec3A::from(*position));
                (vertices.len() - 1) as u32
            });
            remap.push(deduplicated);
        }

        let mut triangles = Vec::with_capacity(indices.len() / 3);
        for triangle in indices.chunks_exact(3) {
            let mut remapped = [0; 3];
            for (slot, &index) in remapped.iter_mut().zip(triangle) {
                *slot = *remap
                    .get(index as usize)
                    .ok_or(TriMeshError::IndexOutOfBounds {
                        index,
                        vertex_count: positions.len(),
                    })?;
            }
            let [a, b, c] = remapped;
            if a == b || b == c || a == c {
                continue;
            }
            triangles.push(UVec3::new(a, b, c));
        }

        Ok(Self {
            vertices,
            area_types: vec![AreaType::NOT_WALKABLE; triangles.len()],
            indices: triangles,
        })
    }

    /// Extends the trimesh with the vertices and indices of another trimesh.
    /// The indices of `other` will be offset by the number of vertices in `self`.
    ///
    /// # Errors
    ///
    /// Returns an error if the combined mesh would not be indexable with `u32`.
    pub fn extend(&mut self, other: TriMesh) -> Result<(), TriMeshError> {
        let len = self.vertices.len() + other.vertices.len();
        if len > u32::MAX as usize {
            return Err(TriMeshError::TooManyVertices { len });
        }
        let next_vertex_index = self.vertices.len() as u32;
        self.vertices.extend(other.vertices);
        self.indices
            .extend(other.indices.iter().map(|i| i + next_vertex_index));
        self.area_types.extend(other.area_types);
        Ok(())
    }

    /// Computes the AABB of the trimesh.
    /// Returns `None` if the trimesh is empty.
    pub fn compute_aabb(&self) -> Option<Aabb3d> {
        Aabb3d::from_verts(&self.vertices)
    }

    /// Whether the mesh has no triangles.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Marks the triangles as walkable or not based on the threshold angle.
    ///
    /// The triangles are marked as walkable if the angle between their normal and the up axis
    /// is smaller than the threshold angle. Triangles that are already walkable are left as they are.
    ///
    /// # Arguments
    ///
    /// * `threshold_rad` - The threshold angle in radians.
    ///
    pub fn mark_walkable_triangles(&mut self, threshold_rad: f32) {
        let threshold_cos = threshold_rad.cos();
        for (i, indices) in self.indices.iter().enumerate() {
            let normal = indices.normal(&self.vertices);

            if normal.y > threshold_cos {
                self.area_types[i] = AreaType::DEFAULT_WALKABLE;
            }
        }
    }

    /// Number of triangles marked as walkable.
    pub fn walkable_triangle_count(&self) -> usize {
        self.area_types.iter().filter(|a| a.is_walkable()).count()
    }
}

/// Errors that can occur when ingesting raw buffers into a [`TriMesh`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriMeshError {
    /// The index buffer does not describe a triangle list.
    #[error("index buffer length {len} is not a multiple of 3")]
    IndexCountNotMultipleOfThree {
        /// Length of the index buffer.
        len: usize,
    },
    /// An index points past the end of the vertex buffer.
    #[error("index {index} is out of bounds for {vertex_count} vertices")]
    IndexOutOfBounds {
        /// The offending index.
        index: u32,
        /// Number of vertices in the buffer.
        vertex_count: usize,
    },
    /// A vertex position contains NaN or infinity.
    #[error("vertex {index} has a non-finite position")]
    NonFiniteVertex {
        /// Position of the vertex in the input buffer.
        index: usize,
    },
    /// The mesh has more vertices than can be addressed with 32-bit indices.
    #[error("mesh has {len} vertices, which exceeds the 32-bit index range")]
    TooManyVertices {
        /// Number of vertices.
        len: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> ([[f32; 3]; 4], [u32; 6]) {
        (
            [
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 0.0, 1.0],
                [0.0, 0.0, 1.0],
            ],
            [0, 2, 1, 0, 3, 2],
        )
    }

    #[test]
    fn ingests_quad() {
        let (positions, indices) = quad();
        let trimesh = TriMesh::from_buffers(&positions, &indices).unwrap();
        assert_eq!(trimesh.vertices.len(), 4);
        assert_eq!(trimesh.indices.len(), 2);
        assert_eq!(trimesh.area_types, vec![AreaType::NOT_WALKABLE; 2]);
    }

    #[test]
    fn deduplicates_coincident_vertices() {
        let positions = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 0.0, 1.0],
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 1.0],
            [0.0, 0.0, 1.0],
        ];
        let trimesh = TriMesh::from_buffers(&positions, &[0, 2, 1, 3, 5, 4]).unwrap();
        assert_eq!(trimesh.vertices.len(), 4);
        assert_eq!(trimesh.indices[1], UVec3::new(0, 3, 2));
    }

    #[test]
    fn drops_collapsed_triangles() {
        let positions = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 0.0]];
        let trimesh = TriMesh::from_buffers(&positions, &[0, 1, 2]).unwrap();
        assert!(trimesh.is_empty());
        assert!(trimesh.area_types.is_empty());
    }

    #[test]
    fn rejects_bad_buffers() {
        let (positions, _) = quad();
        assert_eq!(
            TriMesh::from_buffers(&positions, &[0, 1]),
            Err(TriMeshError::IndexCountNotMultipleOfThree { len: 2 })
        );
        assert_eq!(
            TriMesh::from_buffers(&positions, &[0, 1, 7]),
            Err(TriMeshError::IndexOutOfBounds {
                index: 7,
                vertex_count: 4
            })
        );
        assert_eq!(
            TriMesh::from_buffers(&[[f32::NAN, 0.0, 0.0]], &[]),
            Err(TriMeshError::NonFiniteVertex { index: 0 })
        );
    }

    #[test]
    fn marks_flat_triangles_walkable() {
        let (positions, indices) = quad();
        let mut trimesh = TriMesh::from_buffers(&positions, &indices).unwrap();
        trimesh.mark_walkable_triangles(45.0_f32.to_radians());
        assert_eq!(trimesh.walkable_triangle_count(), 2);
    }

    #[test]
    fn does_not_mark_walls_walkable() {
        let positions = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0]];
        let mut trimesh = TriMesh::from_buffers(&positions, &[0, 1, 2]).unwrap();
        trimesh.mark_walkable_triangles(45.0_f32.to_radians());
        assert_eq!(trimesh.walkable_triangle_count(), 0);
    }

    #[test]
    fn extend_offsets_indices() {
        let (positions, indices) = quad();
        let mut a = TriMesh::from_buffers(&positions, &indices).unwrap();
        let b = a.clone();
        a.extend(b).unwrap();
        assert_eq!(a.vertices.len(), 8);
        assert_eq!(a.indices[2], UVec3::new(4, 6, 5));
        assert_eq!(a.area_types.len(), 4);
    }
}
