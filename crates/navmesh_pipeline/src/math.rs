//! Small geometric helpers shared by the build stages.

use glam::{IVec3, U16Vec3, UVec3, Vec2, Vec3, Vec3A, Vec3Swizzles as _};

/// An axis-aligned bounding box in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Aabb3d {
    /// The minimum corner of the box.
    pub min: Vec3,
    /// The maximum corner of the box.
    pub max: Vec3,
}

impl Aabb3d {
    /// Creates a new AABB from its corners.
    #[inline]
    pub fn new(min: impl Into<Vec3>, max: impl Into<Vec3>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// Computes the AABB of a set of vertices.
    /// Returns `None` if there are no vertices.
    pub fn from_verts(vertices: &[Vec3A]) -> Option<Self> {
        let mut iter = vertices.iter();
        let first = Vec3::from(*iter.next()?);
        let (min, max) = iter.fold((first, first), |(min, max), vertex| {
            let vertex = Vec3::from(*vertex);
            (min.min(vertex), max.max(vertex))
        });
        Some(Self { min, max })
    }

    /// Returns whether the two boxes overlap. Touching boxes count as overlapping.
    #[inline]
    pub fn intersects(&self, other: &Self) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// The extent of the box along each axis.
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }
}

pub(crate) trait TriangleIndices {
    fn normal(&self, vertices: &[Vec3A]) -> Vec3A;
}

impl TriangleIndices for UVec3 {
    #[inline]
    fn normal(&self, vertices: &[Vec3A]) -> Vec3A {
        let a = vertices[self.x as usize];
        let b = vertices[self.y as usize];
        let c = vertices[self.z as usize];
        let ab = b - a;
        let ac = c - a;
        ab.cross(ac).normalize_or_zero()
    }
}

/// Gets the standard width (x-axis) offset for the specified direction.
/// # Arguments
/// - `direction`: The direction. [Limits: 0 <= value < 4]
/// # Returns
///
/// The width offset to apply to the current cell position to move in the direction.
#[inline]
pub(crate) fn dir_offset_x(direction: u8) -> i8 {
    const OFFSET: [i8; 4] = [-1, 0, 1, 0];
    OFFSET[direction as usize & 0x03]
}

/// Gets the standard height (z-axis) offset for the specified direction.
/// # Arguments
/// - `direction`: The direction. [Limits: 0 <= value < 4]
/// # Returns
///
/// The height offset to apply to the current cell position to move in the direction.
#[inline]
pub(crate) fn dir_offset_z(direction: u8) -> i8 {
    const OFFSET: [i8; 4] = [0, 1, 0, -1];
    OFFSET[direction as usize & 0x03]
}

/// Gets the direction for the specified offset. One of x and z should be 0.
#[inline]
pub(crate) fn dir_offset(offset_x: i32, offset_z: i32) -> u8 {
    const DIRS: [u8; 5] = [3, 0, u8::MAX, 2, 1];
    DIRS[(((offset_z + 1) << 1) + offset_x) as usize]
}

#[inline]
pub(crate) fn next(i: usize, n: usize) -> usize {
    if i + 1 < n { i + 1 } else { 0 }
}

#[inline]
pub(crate) fn prev(i: usize, n: usize) -> usize {
    if i >= 1 { i - 1 } else { n - 1 }
}

/// Squared distance from `point` to the segment `(p, q)` on the xz-plane, in voxel units.
pub(crate) fn distance_squared_between_point_and_segment_grid(
    point: (i32, i32),
    (p, q): ((i32, i32), (i32, i32)),
) -> f32 {
    let pqx = (q.0 - p.0) as f32;
    let pqz = (q.1 - p.1) as f32;
    let mut dx = (point.0 - p.0) as f32;
    let mut dz = (point.1 - p.1) as f32;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    dx = p.0 as f32 + t * pqx - point.0 as f32;
    dz = p.1 as f32 + t * pqz - point.1 as f32;
    dx * dx + dz * dz
}

pub(crate) fn distance_squared_between_point_and_segment_xz(point: Vec2, (p, q): (Vec2, Vec2)) -> f32 {
    let pq = q - p;
    let d = pq.length_squared();
    let mut t = pq.dot(point - p);
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    (p + pq * t).distance_squared(point)
}

pub(crate) fn distance_squared_between_point_and_segment(
    point: Vec3A,
    (p, q): (Vec3A, Vec3A),
) -> f32 {
    let pq = q - p;
    let d = pq.length_squared();
    let mut t = pq.dot(point - p);
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    (p + pq * t).distance_squared(point)
}

/// 2D cross product of `(b - a)` and `(c - a)` on the xz-plane.
#[inline]
pub(crate) fn cross_xz(a: Vec3A, b: Vec3A, c: Vec3A) -> f32 {
    let u = (b - a).xz();
    let v = (c - a).xz();
    u.x * v.y - u.y * v.x
}

/// Integer helpers for the polygon predicates on the voxel grid.
/// Only the x and z components are considered.
pub(crate) mod grid {
    use super::*;

    #[inline]
    pub(crate) fn area2(a: IVec3, b: IVec3, c: IVec3) -> i32 {
        (b.x - a.x) * (c.z - a.z) - (c.x - a.x) * (b.z - a.z)
    }

    /// Returns true iff c is strictly to the left of the directed line through a to b.
    #[inline]
    pub(crate) fn left(a: IVec3, b: IVec3, c: IVec3) -> bool {
        area2(a, b, c) < 0
    }

    #[inline]
    pub(crate) fn left_on(a: IVec3, b: IVec3, c: IVec3) -> bool {
        area2(a, b, c) <= 0
    }

    #[inline]
    pub(crate) fn collinear(a: IVec3, b: IVec3, c: IVec3) -> bool {
        area2(a, b, c) == 0
    }

    /// Returns true iff ab properly intersects cd: they share a point interior to both segments.
    pub(crate) fn intersect_prop(a: IVec3, b: IVec3, c: IVec3, d: IVec3) -> bool {
        if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
            return false;
        }
        (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
    }

    /// Returns true iff (a, b, c) are collinear and point c lies on the closed segment ab.
    pub(crate) fn between(a: IVec3, b: IVec3, c: IVec3) -> bool {
        if !collinear(a, b, c) {
            return false;
        }
        if a.x != b.x {
            (a.x <= c.x && c.x <= b.x) || (a.x >= c.x && c.x >= b.x)
        } else {
            (a.z <= c.z && c.z <= b.z) || (a.z >= c.z && c.z >= b.z)
        }
    }

    /// Returns true iff segments ab and cd intersect, properly or improperly.
    pub(crate) fn intersect(a: IVec3, b: IVec3, c: IVec3, d: IVec3) -> bool {
        intersect_prop(a, b, c, d)
            || between(a, b, c)
            || between(a, b, d)
            || between(c, d, a)
            || between(c, d, b)
    }

    #[inline]
    pub(crate) fn equal_xz(a: IVec3, b: IVec3) -> bool {
        a.x == b.x && a.z == b.z
    }

    #[inline]
    pub(crate) fn from_u16(v: U16Vec3) -> IVec3 {
        IVec3::new(v.x as i32, v.y as i32, v.z as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_offset_inverts_dir_offset_xz() {
        for dir in 0..4 {
            let x = dir_offset_x(dir) as i32;
            let z = dir_offset_z(dir) as i32;
            assert_eq!(dir_offset(x, z), dir);
        }
    }

    #[test]
    fn next_and_prev_wrap() {
        assert_eq!(next(2, 3), 0);
        assert_eq!(prev(0, 3), 2);
        assert_eq!(next(0, 3), 1);
    }

    #[test]
    fn aabb_from_verts() {
        let aabb = Aabb3d::from_verts(&[
            Vec3A::new(1.0, -2.0, 3.0),
            Vec3A::new(-1.0, 4.0, 0.0),
        ])
        .unwrap();
        assert_eq!(aabb.min, Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 4.0, 3.0));
        assert!(Aabb3d::from_verts(&[]).is_none());
    }

    #[test]
    fn segment_intersection() {
        let a = IVec3::new(0, 0, 0);
        let b = IVec3::new(4, 0, 4);
        let c = IVec3::new(0, 0, 4);
        let d = IVec3::new(4, 0, 0);
        assert!(grid::intersect(a, b, c, d));
        let e = IVec3::new(5, 0, 5);
        let f = IVec3::new(6, 0, 8);
        assert!(!grid::intersect(a, b, e, f));
    }
}
