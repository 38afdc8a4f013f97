// ============================================================================
// AXIS-ALIGNED REAL INTERVALS — the bounding boxes everything else trades in
// ============================================================================

use glam::{DAffine3, DVec3};

/// A closed axis-aligned box `[min, max]` in real coordinates.
///
/// Planar data flattens z to 0, so a slice's support is an `Interval3` whose
/// z extent is empty. A zero-extent interval (`min == max`) is a valid
/// degenerate box; "no support at all" is expressed as `Option<Interval3>`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interval3 {
    pub min: DVec3,
    pub max: DVec3,
}

impl Interval3 {
    /// Box spanning `min..=max`. Coordinates are normalized per axis so the
    /// result is always well-formed.
    pub fn new(a: DVec3, b: DVec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Degenerate box containing exactly one point.
    pub fn point(p: DVec3) -> Self {
        Self { min: p, max: p }
    }

    /// Smallest box containing every point of the iterator, or `None` when
    /// the iterator is empty.
    pub fn from_points(points: impl IntoIterator<Item = DVec3>) -> Option<Self> {
        let mut it = points.into_iter();
        let first = it.next()?;
        let mut out = Self::point(first);
        for p in it {
            out.min = out.min.min(p);
            out.max = out.max.max(p);
        }
        Some(out)
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Overlap of the two boxes, `None` when they are disjoint.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        if min.x <= max.x && min.y <= max.y && min.z <= max.z {
            Some(Self { min, max })
        } else {
            None
        }
    }

    pub fn contains(&self, p: DVec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// Grow the box by `margin` on every side.
    pub fn expand(&self, margin: f64) -> Self {
        let m = DVec3::splat(margin);
        Self {
            min: self.min - m,
            max: self.max + m,
        }
    }

    pub fn translate(&self, delta: DVec3) -> Self {
        Self {
            min: self.min + delta,
            max: self.max + delta,
        }
    }

    /// Collapse the z extent to 0, keeping x/y. Used when storing planar
    /// selections in mask-local coordinates.
    pub fn flatten_z(&self) -> Self {
        Self {
            min: DVec3::new(self.min.x, self.min.y, 0.0),
            max: DVec3::new(self.max.x, self.max.y, 0.0),
        }
    }

    /// Snap outward to the integer voxel grid.
    pub fn snap_outward(&self) -> Self {
        Self {
            min: self.min.floor(),
            max: self.max.ceil(),
        }
    }

    /// Axis-aligned bounds of the box's image under an affine transform
    /// (the transformed box itself is generally not axis-aligned).
    pub fn transformed(&self, t: &DAffine3) -> Self {
        let (lo, hi) = (self.min, self.max);
        let corners = [
            DVec3::new(lo.x, lo.y, lo.z),
            DVec3::new(hi.x, lo.y, lo.z),
            DVec3::new(lo.x, hi.y, lo.z),
            DVec3::new(hi.x, hi.y, lo.z),
            DVec3::new(lo.x, lo.y, hi.z),
            DVec3::new(hi.x, lo.y, hi.z),
            DVec3::new(lo.x, hi.y, hi.z),
            DVec3::new(hi.x, hi.y, hi.z),
        ];
        Self::from_points(corners.iter().map(|c| t.transform_point3(*c)))
            .unwrap_or(Self::point(DVec3::ZERO))
    }

    /// Union of two optional boxes; `None` only when both are absent.
    pub fn union_opt(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        match (a, b) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_and_intersect() {
        let a = Interval3::new(DVec3::ZERO, DVec3::splat(2.0));
        let b = Interval3::new(DVec3::splat(1.0), DVec3::splat(4.0));
        assert_eq!(a.union(&b), Interval3::new(DVec3::ZERO, DVec3::splat(4.0)));
        assert_eq!(
            a.intersect(&b),
            Some(Interval3::new(DVec3::splat(1.0), DVec3::splat(2.0)))
        );

        let far = Interval3::new(DVec3::splat(10.0), DVec3::splat(11.0));
        assert_eq!(a.intersect(&far), None);
    }

    #[test]
    fn new_normalizes_per_axis() {
        let b = Interval3::new(DVec3::new(3.0, -1.0, 0.0), DVec3::new(1.0, 2.0, 0.0));
        assert_eq!(b.min, DVec3::new(1.0, -1.0, 0.0));
        assert_eq!(b.max, DVec3::new(3.0, 2.0, 0.0));
    }

    #[test]
    fn transformed_is_axis_aligned_hull() {
        let b = Interval3::new(DVec3::ZERO, DVec3::new(2.0, 1.0, 0.0));
        let t = DAffine3::from_translation(DVec3::new(5.0, -3.0, 1.0));
        let moved = b.transformed(&t);
        assert_eq!(moved.min, DVec3::new(5.0, -3.0, 1.0));
        assert_eq!(moved.max, DVec3::new(7.0, -2.0, 1.0));
    }

    #[test]
    fn degenerate_point_box_contains_itself() {
        let p = DVec3::new(1.5, 2.5, 0.0);
        let b = Interval3::point(p);
        assert!(b.contains(p));
        assert_eq!(b.size(), DVec3::ZERO);
    }
}
