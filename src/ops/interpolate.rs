// ============================================================================
// PAIRWISE INTERPOLATION — signed-distance morph between two adjacent slices
// ============================================================================

use std::sync::Arc;

use glam::{DAffine3, DVec2, DVec3};
use image::GrayImage;

use super::CancellationToken;
use super::distance::signed_distance_field;
use crate::interval::Interval3;
use crate::label::ForegroundPredicate;
use crate::mask::SliceSnapshot;

/// Sample value returned for queries outside the computed field grid. Far
/// positive, i.e. definitely outside the shape.
const OUTSIDE: f64 = 1e6;

/// Longest allowed field edge. Supports larger than this (extreme zoom) are
/// computed at capped resolution rather than exhausting memory.
const MAX_FIELD_EDGE: i64 = 4096;

/// A computed continuous field between two adjacent slices.
///
/// The field stores the two endpoint signed-distance grids over the union
/// box and interpolates between them along a virtual depth axis at query
/// time; no intermediate plane is ever pre-rasterized. The grids live in
/// `Arc`s so composite snapshots clone cheaply.
///
/// `world_to_field` is the reconciling transform captured when the sweep
/// ran; later camera motion re-displays the composite but never re-derives
/// the field (the next sweep replaces it wholesale).
#[derive(Clone)]
pub struct Interpolant {
    lo_depth: f64,
    hi_depth: f64,
    world_to_field: DAffine3,
    plane_lo_z: f64,
    plane_hi_z: f64,
    width: usize,
    height: usize,
    lo_field: Arc<Vec<f64>>,
    hi_field: Arc<Vec<f64>>,
    support: Option<Interval3>,
}

impl Interpolant {
    /// Sequence depths of the two defining slices, ascending.
    pub fn span(&self) -> (f64, f64) {
        (self.lo_depth, self.hi_depth)
    }

    /// Estimated global-space support, `None` when both endpoints were empty.
    pub fn support(&self) -> Option<Interval3> {
        self.support
    }

    /// Position of a global point along the virtual depth axis:
    /// 0 at the lower slice's plane, 1 at the upper slice's plane.
    pub fn normalized_depth(&self, p: DVec3) -> f64 {
        let q = self.world_to_field.transform_point3(p);
        (q.z - self.plane_lo_z) / (self.plane_hi_z - self.plane_lo_z)
    }

    /// Interpolated signed distance at a global point. The depth parameter
    /// is clamped to [0, 1], extending each endpoint's own field beyond its
    /// plane.
    pub fn distance_at(&self, p: DVec3) -> f64 {
        let q = self.world_to_field.transform_point3(p);
        let w = ((q.z - self.plane_lo_z) / (self.plane_hi_z - self.plane_lo_z)).clamp(0.0, 1.0);
        let lo = sample_bilinear(&self.lo_field, self.width, self.height, q.x, q.y);
        let hi = sample_bilinear(&self.hi_field, self.width, self.height, q.x, q.y);
        (1.0 - w) * lo + w * hi
    }

    /// Thresholded shape query: ≤ 0 ⇒ inside the interpolated shape.
    pub fn contains(&self, p: DVec3) -> bool {
        self.distance_at(p) <= 0.0
    }
}

/// Bilinear sample with integer pixel centers; out-of-grid reads are far
/// outside.
fn sample_bilinear(field: &[f64], w: usize, h: usize, x: f64, y: f64) -> f64 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let at = |xi: f64, yi: f64| -> f64 {
        if xi < 0.0 || yi < 0.0 || xi >= w as f64 || yi >= h as f64 {
            OUTSIDE
        } else {
            field[yi as usize * w + xi as usize]
        }
    };
    let v00 = at(x0, y0);
    let v10 = at(x0 + 1.0, y0);
    let v01 = at(x0, y0 + 1.0);
    let v11 = at(x0 + 1.0, y0 + 1.0);
    let top = v00 * (1.0 - fx) + v10 * fx;
    let bot = v01 * (1.0 - fx) + v11 * fx;
    top * (1.0 - fy) + bot * fy
}

/// Morph two adjacent slices (`lo.depth < hi.depth`) into one continuous
/// interpolant field.
///
/// Works in the lower slice's current display frame: both supports are
/// reconciled into it, the union box is rasterized as two binary planes,
/// and their signed Euclidean distance fields are stacked along the depth
/// axis. An absent/empty support on either side becomes a zero-area box at
/// the partner's center, so one-sided interpolation toward "empty" shrinks
/// to a point.
///
/// Returns `None` only when `token` was cancelled mid-computation; an
/// interrupted morph is "not yet available", never an error, and is always
/// safe to retry.
pub fn interpolate_pair(
    lo: &SliceSnapshot,
    hi: &SliceSnapshot,
    predicate: &ForegroundPredicate,
    token: &CancellationToken,
) -> Option<Interpolant> {
    debug_assert!(lo.depth < hi.depth);
    if token.is_cancelled() {
        return None;
    }

    // Reconciling placements of each slice's painted space into the work
    // frame (the lower slice's current display frame).
    let work = lo.current;
    let lo_place = work * lo.initial.inverse();
    let hi_place = work * hi.initial.inverse();
    let plane_lo_z = lo_place.transform_point3(DVec3::ZERO).z;
    let plane_hi_z = hi_place.transform_point3(DVec3::ZERO).z;

    // Supports in the work frame, flattened to xy.
    let lo_sup = lo.support.map(|iv| iv.transformed(&lo_place).flatten_z());
    let hi_sup = hi.support.map(|iv| iv.transformed(&hi_place).flatten_z());

    let (lo_sup, hi_sup) = match (lo_sup, hi_sup) {
        (None, None) => {
            // Nothing on either plane: a trivial, everywhere-outside field
            // keeps the sequence's alternation uniform.
            return Some(empty_interpolant(lo, hi, work, plane_lo_z, plane_hi_z));
        }
        // Empty side → zero-area box at the partner's center.
        (Some(a), None) => (a, Interval3::point(a.center())),
        (None, Some(b)) => (Interval3::point(b.center()), b),
        (Some(a), Some(b)) => (a, b),
    };

    // Union box U, padded one pixel so boundary samples stay in-grid.
    let union = lo_sup.union(&hi_sup).expand(1.0).snap_outward();
    let off_x = union.min.x as i64;
    let off_y = union.min.y as i64;
    let width = ((union.max.x as i64 - off_x) + 1).clamp(1, MAX_FIELD_EDGE) as usize;
    let height = ((union.max.y as i64 - off_y) + 1).clamp(1, MAX_FIELD_EDGE) as usize;
    if (union.max.x as i64 - off_x) + 1 > MAX_FIELD_EDGE
        || (union.max.y as i64 - off_y) + 1 > MAX_FIELD_EDGE
    {
        log::warn!(
            "interpolate_pair: union box {}×{} capped to {}×{}",
            (union.max.x as i64 - off_x) + 1,
            (union.max.y as i64 - off_y) + 1,
            width,
            height
        );
    }
    let offset = DVec3::new(off_x as f64, off_y as f64, 0.0);
    let world_to_field = DAffine3::from_translation(-offset) * work;

    // Binary foreground planes over U, each resampled from its own painted
    // space through the reconciling transform.
    let lo_mask = lo
        .support
        .is_some()
        .then(|| extract_plane(lo, &work, offset, plane_lo_z, width, height, predicate));
    let hi_mask = hi
        .support
        .is_some()
        .then(|| extract_plane(hi, &work, offset, plane_hi_z, width, height, predicate));

    if token.is_cancelled() {
        return None;
    }

    // The expensive step. One field per side; an empty side gets the
    // distance cone toward the partner's center instead.
    let lo_field = match &lo_mask {
        Some(mask) => signed_distance_field(mask),
        None => point_target_field(hi_sup.center() - offset, width, height),
    };
    if token.is_cancelled() {
        return None;
    }
    let hi_field = match &hi_mask {
        Some(mask) => signed_distance_field(mask),
        None => point_target_field(lo_sup.center() - offset, width, height),
    };
    if token.is_cancelled() {
        return None;
    }

    // Global support: the union box extruded across the two planes.
    let support = {
        let work_inv = work.inverse();
        let lo_box = Interval3::new(
            DVec3::new(union.min.x, union.min.y, plane_lo_z),
            DVec3::new(union.max.x, union.max.y, plane_lo_z),
        );
        let hi_box = Interval3::new(
            DVec3::new(union.min.x, union.min.y, plane_hi_z),
            DVec3::new(union.max.x, union.max.y, plane_hi_z),
        );
        Some(
            lo_box
                .union(&hi_box)
                .transformed(&work_inv),
        )
    };

    Some(Interpolant {
        lo_depth: lo.depth,
        hi_depth: hi.depth,
        world_to_field,
        plane_lo_z,
        plane_hi_z,
        width,
        height,
        lo_field: Arc::new(lo_field),
        hi_field: Arc::new(hi_field),
        support,
    })
}

/// Rasterize one slice's foreground over the union box: inverse-map each
/// field pixel center onto the slice's plane in its painted space and test
/// the nearest stored label.
fn extract_plane(
    slice: &SliceSnapshot,
    work: &DAffine3,
    offset: DVec3,
    plane_z: f64,
    width: usize,
    height: usize,
    predicate: &ForegroundPredicate,
) -> GrayImage {
    let field_to_mask = slice.initial * work.inverse();
    let mut out = GrayImage::new(width as u32, height as u32);
    for y in 0..height {
        for x in 0..width {
            let p = field_to_mask.transform_point3(DVec3::new(
                offset.x + x as f64,
                offset.y + y as f64,
                plane_z,
            ));
            let mx = p.x.round();
            let my = p.y.round();
            if mx < 0.0 || my < 0.0 {
                continue;
            }
            if predicate(slice.image.get(mx as u32, my as u32)) {
                out.put_pixel(x as u32, y as u32, image::Luma([255]));
            }
        }
    }
    out
}

/// Strictly positive distance cone toward a target point (field pixel
/// coordinates). Thresholding never reaches 0, so the shape vanishes
/// exactly at the empty endpoint while shrinking toward the target on the
/// way there.
fn point_target_field(target: DVec3, width: usize, height: usize) -> Vec<f64> {
    let c = DVec2::new(target.x, target.y);
    let mut field = vec![0.0f64; width * height];
    for y in 0..height {
        for x in 0..width {
            let d = (DVec2::new(x as f64, y as f64) - c).length();
            field[y * width + x] = d + 0.5;
        }
    }
    field
}

fn empty_interpolant(
    lo: &SliceSnapshot,
    hi: &SliceSnapshot,
    work: DAffine3,
    plane_lo_z: f64,
    plane_hi_z: f64,
) -> Interpolant {
    Interpolant {
        lo_depth: lo.depth,
        hi_depth: hi.depth,
        world_to_field: work,
        plane_lo_z,
        plane_hi_z,
        width: 1,
        height: 1,
        lo_field: Arc::new(vec![OUTSIDE]),
        hi_field: Arc::new(vec![OUTSIDE]),
        support: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::default_foreground;
    use crate::mask::LabelImage;

    /// Snapshot with a square painted around `center` (identity camera,
    /// plane shifted to `depth` along z).
    fn square_snapshot(depth: f64, half: i64, center: (i64, i64), label: u64) -> SliceSnapshot {
        let mut image = LabelImage::new(128, 128);
        if half >= 0 {
            for y in (center.1 - half)..=(center.1 + half) {
                for x in (center.0 - half)..=(center.0 + half) {
                    image.set(x as u32, y as u32, label);
                }
            }
        }
        // Plane at global z = depth maps to mask z = 0.
        let initial = DAffine3::from_translation(DVec3::new(0.0, 0.0, -depth));
        let pred = default_foreground();
        let support = image.foreground_bounds(None, &pred);
        SliceSnapshot {
            depth,
            initial,
            current: initial,
            image,
            support,
        }
    }

    fn empty_snapshot(depth: f64) -> SliceSnapshot {
        square_snapshot(depth, -1, (0, 0), 0)
    }

    #[test]
    fn endpoint_planes_reproduce_their_shapes() {
        let pred = default_foreground();
        let token = CancellationToken::new();
        let lo = square_snapshot(0.0, 3, (20, 20), 5);
        let hi = square_snapshot(8.0, 1, (20, 20), 5);
        let ip = interpolate_pair(&lo, &hi, &pred, &token).unwrap();

        // At depth 0 the field reproduces the 7×7 square exactly.
        for y in 10..30 {
            for x in 10..30 {
                let inside_square = (17..=23).contains(&x) && (17..=23).contains(&y);
                let p = DVec3::new(x as f64, y as f64, 0.0);
                assert_eq!(ip.contains(p), inside_square, "pixel ({x},{y})");
            }
        }
        // At depth 8 it reproduces the 3×3 square.
        for y in 10..30 {
            for x in 10..30 {
                let inside_square = (19..=21).contains(&x) && (19..=21).contains(&y);
                let p = DVec3::new(x as f64, y as f64, 8.0);
                assert_eq!(ip.contains(p), inside_square, "pixel ({x},{y})");
            }
        }
    }

    #[test]
    fn morph_toward_empty_shrinks_monotonically() {
        let pred = default_foreground();
        let token = CancellationToken::new();
        let lo = square_snapshot(0.0, 5, (30, 30), 7);
        let hi = empty_snapshot(10.0);
        let ip = interpolate_pair(&lo, &hi, &pred, &token).unwrap();

        let area_at = |depth: f64| -> usize {
            let mut n = 0;
            for y in 0..80 {
                for x in 0..80 {
                    if ip.contains(DVec3::new(x as f64, y as f64, depth)) {
                        n += 1;
                    }
                }
            }
            n
        };

        let mut prev = usize::MAX;
        for step in 0..=10 {
            let a = area_at(step as f64);
            assert!(a <= prev, "area grew at depth {step}: {a} > {prev}");
            prev = a;
        }
        assert_eq!(area_at(10.0), 0, "must vanish at the empty endpoint");
        assert!(area_at(0.0) > 0);
    }

    #[test]
    fn shrinking_shape_stays_centered() {
        // Square centered at (30, 30) morphing to empty: intermediate
        // shapes stay point-symmetric about the center.
        let pred = default_foreground();
        let token = CancellationToken::new();
        let lo = square_snapshot(0.0, 4, (30, 30), 7);
        let hi = empty_snapshot(6.0);
        let ip = interpolate_pair(&lo, &hi, &pred, &token).unwrap();

        for y in 0..60 {
            for x in 0..60 {
                let p = DVec3::new(x as f64, y as f64, 3.0);
                let mirrored = DVec3::new(60.0 - x as f64, 60.0 - y as f64, 3.0);
                assert_eq!(
                    ip.contains(p),
                    ip.contains(mirrored),
                    "asymmetry at ({x},{y})"
                );
            }
        }
    }

    #[test]
    fn cancelled_token_yields_no_result() {
        let pred = default_foreground();
        let token = CancellationToken::new();
        token.cancel();
        let lo = square_snapshot(0.0, 3, (20, 20), 5);
        let hi = square_snapshot(4.0, 3, (20, 20), 5);
        assert!(interpolate_pair(&lo, &hi, &pred, &token).is_none());
    }

    #[test]
    fn both_empty_yields_trivial_field() {
        let pred = default_foreground();
        let token = CancellationToken::new();
        let ip = interpolate_pair(&empty_snapshot(0.0), &empty_snapshot(4.0), &pred, &token)
            .unwrap();
        assert!(ip.support().is_none());
        assert!(!ip.contains(DVec3::new(10.0, 10.0, 2.0)));
    }

    #[test]
    fn panned_partner_is_reconciled_before_morphing() {
        // Second slice painted after the camera panned +16 in x: identical
        // painted pixel coordinates, different frames. The reconciled morph
        // must keep the shape at the same global location at both ends.
        let pred = default_foreground();
        let token = CancellationToken::new();

        let lo = square_snapshot(0.0, 3, (20, 20), 5);

        let mut image = LabelImage::new(128, 128);
        for y in 17..=23 {
            for x in 17..=23 {
                image.set(x, y, 5);
            }
        }
        // Camera panned: global (x, y, 4) ↦ mask (x + 16, y, 0)
        let initial = DAffine3::from_translation(DVec3::new(16.0, 0.0, -4.0));
        let support = image.foreground_bounds(None, &pred);
        let hi = SliceSnapshot {
            depth: 4.0,
            initial,
            current: initial,
            image,
            support,
        };

        let ip = interpolate_pair(&lo, &hi, &pred, &token).unwrap();
        // hi's painted square (17..=23 in its mask) sits at global x 1..=7.
        assert!(ip.contains(DVec3::new(4.0, 20.0, 4.0)));
        assert!(!ip.contains(DVec3::new(20.0, 20.0, 4.0)));
        // lo's square is at global 17..=23.
        assert!(ip.contains(DVec3::new(20.0, 20.0, 0.0)));
        assert!(!ip.contains(DVec3::new(4.0, 20.0, 0.0)));
    }
}
