// ============================================================================
// COMPOSITE MASK — slice-priority merge of painted planes and interpolants
// ============================================================================

use std::sync::Arc;

use glam::{DAffine3, DVec3};

use crate::interval::Interval3;
use crate::label::{BACKGROUND, Label};
use crate::mask::LabelImage;
use crate::ops::interpolate::Interpolant;
use crate::source::MaskField;

/// Tolerance on the normalized depth gate of an interpolant, so queries on
/// a defining plane itself still hit the field.
const DEPTH_GATE_EPS: f64 = 1e-6;

/// One slice's own painted data placed into global space.
pub struct CompositePlane {
    pub depth: f64,
    /// global → initial mask pixel space; the plane itself is |z| ≤ 0.5.
    pub world_to_mask: DAffine3,
    pub image: LabelImage,
    /// Global-space support, precomputed by the builder.
    pub support: Option<Interval3>,
}

impl CompositePlane {
    /// The slice's stored label at a global point, `None` off the plane or
    /// where nothing was painted. Erased pixels report their marker value:
    /// they are "painted" for priority purposes and occlude interpolants.
    fn label_at(&self, p: DVec3) -> Option<Label> {
        let q = self.world_to_mask.transform_point3(p);
        if q.z.abs() > 0.5 {
            return None;
        }
        let x = q.x.round();
        let y = q.y.round();
        if x < 0.0 || y < 0.0 {
            return None;
        }
        let v = self.image.get(x as u32, y as u32);
        (v != BACKGROUND).then_some(v)
    }
}

/// The single queryable field merging all slices and interpolants.
///
/// Priority at each queried point: a slice's own non-background value wins
/// over an interpolated value; absent slice data falls back to the
/// interpolated value (filled with the session's temporary label);
/// otherwise background. Installed as the live mask on the data source and,
/// remapped, handed to the final commit.
pub struct CompositeMask {
    planes: Vec<CompositePlane>,
    interpolants: Vec<Interpolant>,
    temporary_label: Label,
}

impl CompositeMask {
    pub fn new(
        mut planes: Vec<CompositePlane>,
        interpolants: Vec<Interpolant>,
        temporary_label: Label,
    ) -> Self {
        planes.sort_by(|a, b| a.depth.total_cmp(&b.depth));
        Self {
            planes,
            interpolants,
            temporary_label,
        }
    }

    pub fn temporary_label(&self) -> Label {
        self.temporary_label
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn interpolant_count(&self) -> usize {
        self.interpolants.len()
    }

    /// Union of every plane's and interpolant's global support.
    pub fn support(&self) -> Option<Interval3> {
        let mut out: Option<Interval3> = None;
        for plane in &self.planes {
            out = Interval3::union_opt(out, plane.support);
        }
        for ip in &self.interpolants {
            out = Interval3::union_opt(out, ip.support());
        }
        out
    }

    pub fn label_at(&self, p: DVec3) -> Label {
        // Slice data first: painted planes always win over interpolation.
        for plane in &self.planes {
            if let Some(v) = plane.label_at(p) {
                return v;
            }
        }
        for ip in &self.interpolants {
            let w = ip.normalized_depth(p);
            if (-DEPTH_GATE_EPS..=1.0 + DEPTH_GATE_EPS).contains(&w) && ip.contains(p) {
                return self.temporary_label;
            }
        }
        BACKGROUND
    }

    /// View of this composite with the session's temporary id replaced by
    /// the real target id, for the final commit.
    pub fn remapped(self: &Arc<Self>, target: Label) -> RemappedMask {
        RemappedMask {
            inner: Arc::clone(self),
            from: self.temporary_label,
            to: target,
        }
    }
}

impl MaskField for CompositeMask {
    fn label_at(&self, p: DVec3) -> Label {
        CompositeMask::label_at(self, p)
    }
}

/// Label-remapping wrapper handed to the external apply operation.
pub struct RemappedMask {
    inner: Arc<CompositeMask>,
    from: Label,
    to: Label,
}

impl MaskField for RemappedMask {
    fn label_at(&self, p: DVec3) -> Label {
        let v = self.inner.label_at(p);
        if v == self.from { self.to } else { v }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::{ERASED, default_foreground};
    use crate::mask::SliceSnapshot;
    use crate::ops::CancellationToken;
    use crate::ops::interpolate::interpolate_pair;

    const TEMP: Label = 0xff00_0000_0000_0001;

    fn plane_at(depth: f64, fill: &[(u32, u32, Label)]) -> CompositePlane {
        let mut image = LabelImage::new(64, 64);
        for (x, y, v) in fill {
            image.set(*x, *y, *v);
        }
        let world_to_mask = DAffine3::from_translation(DVec3::new(0.0, 0.0, -depth));
        let support = image
            .foreground_bounds(None, &default_foreground())
            .map(|iv| iv.expand(0.5).transformed(&world_to_mask.inverse()));
        CompositePlane {
            depth,
            world_to_mask,
            image,
            support,
        }
    }

    fn snapshot_of(plane: &CompositePlane) -> SliceSnapshot {
        SliceSnapshot {
            depth: plane.depth,
            initial: plane.world_to_mask,
            current: plane.world_to_mask,
            image: plane.image.clone(),
            support: plane
                .image
                .foreground_bounds(None, &default_foreground()),
        }
    }

    fn interpolant_between(a: &CompositePlane, b: &CompositePlane) -> Interpolant {
        interpolate_pair(
            &snapshot_of(a),
            &snapshot_of(b),
            &default_foreground(),
            &CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn slice_data_wins_over_interpolant() {
        let a = plane_at(0.0, &[(10, 10, 3), (11, 10, 3)]);
        let b = plane_at(4.0, &[(10, 10, 9)]);
        let ip = interpolant_between(&a, &b);
        let composite = CompositeMask::new(vec![a, b], vec![ip], TEMP);

        // On the defining planes, the painted labels come through verbatim.
        assert_eq!(composite.label_at(DVec3::new(10.0, 10.0, 0.0)), 3);
        assert_eq!(composite.label_at(DVec3::new(11.0, 10.0, 0.0)), 3);
        assert_eq!(composite.label_at(DVec3::new(10.0, 10.0, 4.0)), 9);
    }

    #[test]
    fn gap_falls_back_to_interpolated_value() {
        let a = plane_at(0.0, &[(10, 10, 3)]);
        let b = plane_at(4.0, &[(10, 10, 9)]);
        let ip = interpolant_between(&a, &b);
        let composite = CompositeMask::new(vec![a, b], vec![ip], TEMP);

        assert_eq!(composite.label_at(DVec3::new(10.0, 10.0, 2.0)), TEMP);
        assert_eq!(composite.label_at(DVec3::new(40.0, 40.0, 2.0)), BACKGROUND);
    }

    #[test]
    fn erased_pixels_occlude_the_interpolant() {
        let a = plane_at(0.0, &[(10, 10, 3), (10, 11, ERASED)]);
        let b = plane_at(4.0, &[(10, 10, 9), (10, 11, 9)]);
        let ip = interpolant_between(&a, &b);
        let composite = CompositeMask::new(vec![a, b], vec![ip], TEMP);

        // The erased pixel is "painted" for priority purposes: the
        // interpolant may not show through it, and it is not foreground.
        assert_eq!(composite.label_at(DVec3::new(10.0, 11.0, 0.0)), ERASED);
        assert!(!default_foreground()(
            composite.label_at(DVec3::new(10.0, 11.0, 0.0))
        ));
    }

    #[test]
    fn remap_substitutes_only_the_temporary_label() {
        let a = plane_at(0.0, &[(10, 10, 3)]);
        let b = plane_at(4.0, &[(10, 10, 3)]);
        let ip = interpolant_between(&a, &b);
        let composite = Arc::new(CompositeMask::new(vec![a, b], vec![ip], TEMP));
        let remapped = composite.remapped(42);

        assert_eq!(remapped.label_at(DVec3::new(10.0, 10.0, 2.0)), 42);
        assert_eq!(remapped.label_at(DVec3::new(10.0, 10.0, 0.0)), 3);
        assert_eq!(
            remapped.label_at(DVec3::new(40.0, 40.0, 2.0)),
            BACKGROUND
        );
    }

    #[test]
    fn support_unions_planes_and_interpolants() {
        let a = plane_at(0.0, &[(10, 10, 3)]);
        let b = plane_at(6.0, &[(30, 30, 3)]);
        let ip = interpolant_between(&a, &b);
        let composite = CompositeMask::new(vec![a, b], vec![ip], TEMP);
        let s = composite.support().unwrap();
        assert!(s.contains(DVec3::new(10.0, 10.0, 0.0)));
        assert!(s.contains(DVec3::new(30.0, 30.0, 6.0)));
        assert!(s.min.z <= 0.0 && s.max.z >= 6.0);
    }
}
