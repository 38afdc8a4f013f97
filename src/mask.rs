// ============================================================================
// MASK STORAGE — chunked label images and per-slice coordinate frames
// ============================================================================

use std::sync::{Arc, Mutex};

use glam::{DAffine3, DVec3};

use crate::interval::Interval3;
use crate::label::{BACKGROUND, ForegroundPredicate, Label};

pub const CHUNK_SIZE: u32 = 64;

// ============================================================================
// LABEL IMAGE — sparse 64×64 chunk storage (Vec-indexed for speed)
// ============================================================================

/// Sparse tiled 2D label image backed by a flat `Vec<Option<Arc<…>>>`.
/// Chunk coordinates are mapped to a flat index via `cy * chunks_per_row + cx`,
/// giving O(1) access with zero hashing overhead. Pixels outside any
/// allocated chunk read [`BACKGROUND`].
///
/// Chunks are wrapped in `Arc` for copy-on-write semantics: `clone()` only
/// bumps reference counts, and mutations use `Arc::make_mut` to COW-clone
/// only the touched chunk. Sweep snapshots rely on this being cheap.
#[derive(Clone)]
pub struct LabelImage {
    width: u32,
    height: u32,
    chunks_per_row: u32,
    chunks: Vec<Option<Arc<Vec<Label>>>>,
}

impl LabelImage {
    /// Create an empty (all-background) label image.
    pub fn new(width: u32, height: u32) -> Self {
        // Sanity: clamp dimensions to prevent overflow (max ~256 megapixels)
        let (width, height) = {
            let total = (width as u64) * (height as u64);
            if total > 256_000_000 || width == 0 || height == 0 {
                log::warn!(
                    "LabelImage::new: dimensions {}×{} out of range, clamped to 1×1",
                    width,
                    height
                );
                (1, 1)
            } else {
                (width, height)
            }
        };
        let chunks_per_row = (width + CHUNK_SIZE - 1) / CHUNK_SIZE;
        let chunks_per_col = (height + CHUNK_SIZE - 1) / CHUNK_SIZE;
        let total = (chunks_per_row * chunks_per_col) as usize;
        Self {
            width,
            height,
            chunks_per_row,
            chunks: vec![None; total],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    fn chunk_index(&self, x: u32, y: u32) -> usize {
        ((y / CHUNK_SIZE) * self.chunks_per_row + x / CHUNK_SIZE) as usize
    }

    /// Read the label at (x, y). Out-of-bounds and unallocated pixels read
    /// [`BACKGROUND`].
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> Label {
        if x >= self.width || y >= self.height {
            return BACKGROUND;
        }
        match &self.chunks[self.chunk_index(x, y)] {
            Some(chunk) => {
                chunk[((y % CHUNK_SIZE) * CHUNK_SIZE + x % CHUNK_SIZE) as usize]
            }
            None => BACKGROUND,
        }
    }

    /// Write the label at (x, y). Out-of-bounds writes are ignored; writing
    /// [`BACKGROUND`] into an unallocated chunk allocates nothing.
    pub fn set(&mut self, x: u32, y: u32, label: Label) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = self.chunk_index(x, y);
        if self.chunks[idx].is_none() {
            if label == BACKGROUND {
                return;
            }
            self.chunks[idx] = Some(Arc::new(vec![
                BACKGROUND;
                (CHUNK_SIZE * CHUNK_SIZE) as usize
            ]));
        }
        let chunk = Arc::make_mut(self.chunks[idx].as_mut().unwrap());
        chunk[((y % CHUNK_SIZE) * CHUNK_SIZE + x % CHUNK_SIZE) as usize] = label;
    }

    /// Fill an axis-aligned region (mask-local coordinates, z ignored) with
    /// one label value.
    pub fn fill_interval(&mut self, region: &Interval3, label: Label) {
        let x0 = region.min.x.round().max(0.0) as i64;
        let y0 = region.min.y.round().max(0.0) as i64;
        let x1 = (region.max.x.round() as i64).min(self.width as i64 - 1);
        let y1 = (region.max.y.round() as i64).min(self.height as i64 - 1);
        if x0 > x1 || y0 > y1 {
            return;
        }
        for y in y0..=y1 {
            for x in x0..=x1 {
                self.set(x as u32, y as u32, label);
            }
        }
    }

    /// Merge every non-background pixel of `src` into `self`, mapping pixel
    /// centers through `src_to_self` and writing to the nearest pixel.
    /// Later writes win, so an erase gesture painted over an earlier
    /// selection lands as [`crate::label::ERASED`] here.
    pub fn merge_from(&mut self, src: &Self, src_to_self: &DAffine3) {
        for (cx, cy, chunk) in src.occupied_chunks() {
            let base_x = cx * CHUNK_SIZE;
            let base_y = cy * CHUNK_SIZE;
            let cw = CHUNK_SIZE.min(src.width - base_x);
            let ch = CHUNK_SIZE.min(src.height - base_y);
            for ly in 0..ch {
                for lx in 0..cw {
                    let v = chunk[(ly * CHUNK_SIZE + lx) as usize];
                    if v == BACKGROUND {
                        continue;
                    }
                    let p = src_to_self.transform_point3(DVec3::new(
                        (base_x + lx) as f64,
                        (base_y + ly) as f64,
                        0.0,
                    ));
                    let tx = p.x.round();
                    let ty = p.y.round();
                    if tx >= 0.0 && ty >= 0.0 {
                        self.set(tx as u32, ty as u32, v);
                    }
                }
            }
        }
    }

    /// Iterate occupied chunks as (chunk x, chunk y, data).
    fn occupied_chunks(&self) -> impl Iterator<Item = (u32, u32, &Arc<Vec<Label>>)> {
        let cpr = self.chunks_per_row;
        self.chunks
            .iter()
            .enumerate()
            .filter_map(move |(i, slot)| {
                slot.as_ref()
                    .map(|c| (i as u32 % cpr, i as u32 / cpr, c))
            })
    }

    /// Tight bounding interval of all pixels matching `predicate`, restricted
    /// to `within` when given. `None` when no pixel matches (e.g. everything
    /// was erased). Coordinates are mask-local with z flattened to 0.
    pub fn foreground_bounds(
        &self,
        within: Option<&Interval3>,
        predicate: &ForegroundPredicate,
    ) -> Option<Interval3> {
        use rayon::prelude::*;

        let clip = within.map(|iv| iv.snap_outward());
        let per_chunk: Vec<Option<(u32, u32, u32, u32)>> = self
            .chunks
            .par_iter()
            .enumerate()
            .map(|(i, slot)| {
                let chunk = slot.as_ref()?;
                let cx = i as u32 % self.chunks_per_row;
                let cy = i as u32 / self.chunks_per_row;
                let base_x = cx * CHUNK_SIZE;
                let base_y = cy * CHUNK_SIZE;
                if let Some(clip) = &clip {
                    // Chunk entirely outside the scan window
                    if (base_x + CHUNK_SIZE) as f64 <= clip.min.x
                        || (base_y + CHUNK_SIZE) as f64 <= clip.min.y
                        || (base_x as f64) > clip.max.x
                        || (base_y as f64) > clip.max.y
                    {
                        return None;
                    }
                }
                let cw = CHUNK_SIZE.min(self.width - base_x);
                let ch = CHUNK_SIZE.min(self.height - base_y);
                let mut bounds: Option<(u32, u32, u32, u32)> = None;
                for ly in 0..ch {
                    for lx in 0..cw {
                        let x = base_x + lx;
                        let y = base_y + ly;
                        if let Some(clip) = &clip {
                            if (x as f64) < clip.min.x
                                || (x as f64) > clip.max.x
                                || (y as f64) < clip.min.y
                                || (y as f64) > clip.max.y
                            {
                                continue;
                            }
                        }
                        if predicate(chunk[(ly * CHUNK_SIZE + lx) as usize]) {
                            bounds = Some(match bounds {
                                None => (x, y, x, y),
                                Some((x0, y0, x1, y1)) => {
                                    (x0.min(x), y0.min(y), x1.max(x), y1.max(y))
                                }
                            });
                        }
                    }
                }
                bounds
            })
            .collect();

        let mut out: Option<(u32, u32, u32, u32)> = None;
        for b in per_chunk.into_iter().flatten() {
            out = Some(match out {
                None => b,
                Some((x0, y0, x1, y1)) => {
                    (x0.min(b.0), y0.min(b.1), x1.max(b.2), y1.max(b.3))
                }
            });
        }
        out.map(|(x0, y0, x1, y1)| {
            Interval3::new(
                DVec3::new(x0 as f64, y0 as f64, 0.0),
                DVec3::new(x1 as f64, y1 as f64, 0.0),
            )
        })
    }

    /// Number of pixels matching `predicate`. Test/diagnostic helper.
    pub fn count_foreground(&self, predicate: &ForegroundPredicate) -> usize {
        self.occupied_chunks()
            .map(|(_, _, chunk)| chunk.iter().filter(|v| predicate(**v)).count())
            .sum()
    }
}

// ============================================================================
// MASK COORDINATE FRAME
// ============================================================================

/// Pairs a backing [`LabelImage`] with the affine frames that place it.
///
/// The *initial* transform (global → mask pixels) is captured at creation
/// and never rewritten: pixel values are only ever written in initial space.
/// The *current* transform (global → display) follows the camera; placement
/// under a moved camera is always a transform composition, never a repaint.
///
/// Current-transform updates arrive on the UI thread and take only this
/// frame's own lock, never the session mutation lock.
pub struct MaskFrame {
    initial: DAffine3,
    current: Mutex<DAffine3>,
    image: Mutex<LabelImage>,
}

impl MaskFrame {
    /// `initial` maps global coordinates to mask pixel space with the
    /// painted plane at z = 0. `current` is the live global → display
    /// transform at creation time.
    pub fn new(initial: DAffine3, current: DAffine3, image: LabelImage) -> Self {
        Self {
            initial,
            current: Mutex::new(current),
            image: Mutex::new(image),
        }
    }

    pub fn initial(&self) -> DAffine3 {
        self.initial
    }

    pub fn current(&self) -> DAffine3 {
        *self.current.lock().unwrap()
    }

    /// Republish under a new camera. Touches no pixel data.
    pub fn set_current(&self, transform: DAffine3) {
        *self.current.lock().unwrap() = transform;
    }

    /// Placement of the painted pixels in the current display frame:
    /// `current ∘ initial⁻¹`.
    pub fn display_transform(&self) -> DAffine3 {
        self.current() * self.initial.inverse()
    }

    /// Reconciliation of two independently-moving frames:
    /// `other.current ∘ self.initial⁻¹`, mapping a point in this frame's
    /// painted (initial) pixel space into `other`'s current display space.
    /// Correct regardless of how either camera has moved since creation.
    pub fn frame_to_frame(&self, other: &MaskFrame) -> DAffine3 {
        other.current() * self.initial.inverse()
    }

    /// Cheap COW snapshot of the backing pixels.
    pub fn clone_image(&self) -> LabelImage {
        self.image.lock().unwrap().clone()
    }

    pub fn with_image<R>(&self, f: impl FnOnce(&mut LabelImage) -> R) -> R {
        f(&mut self.image.lock().unwrap())
    }

    /// Merge a gesture painted in another frame into this frame's initial
    /// space. `gesture_transform` maps global → gesture pixel space.
    pub fn merge_gesture(&self, src: &LabelImage, gesture_transform: &DAffine3) {
        let src_to_self = self.initial * gesture_transform.inverse();
        self.image.lock().unwrap().merge_from(src, &src_to_self);
    }
}

// ============================================================================
// SLICE — one user-authored planar selection, with lazy support tracking
// ============================================================================

/// A user-authored 2D label selection on one cross-sectional plane.
///
/// Selection regions are kept in initial-mask local coordinates (z flattened
/// to 0). The support interval is computed lazily from the painted pixels,
/// cached, and invalidated on every mutation; it is `None` once every
/// painted pixel has been erased.
pub struct Slice {
    pub frame: Arc<MaskFrame>,
    regions: Vec<Interval3>,
    support_cache: Option<Option<Interval3>>,
}

impl Slice {
    pub fn new(frame: Arc<MaskFrame>, region: Interval3) -> Self {
        Self {
            frame,
            regions: vec![region.flatten_z()],
            support_cache: None,
        }
    }

    pub fn regions(&self) -> &[Interval3] {
        &self.regions
    }

    /// Record a further gesture on this slice's plane. Regions append; the
    /// cached support is dropped and the caller must invalidate any
    /// flanking interpolants.
    pub fn add_region(&mut self, region: Interval3) {
        self.regions.push(region.flatten_z());
        self.support_cache = None;
    }

    pub fn invalidate_support(&mut self) {
        self.support_cache = None;
    }

    /// Tight support of the painted foreground in initial-mask coordinates,
    /// `None` when nothing (or only erased pixels) remains.
    pub fn support(&mut self, predicate: &ForegroundPredicate) -> Option<Interval3> {
        if let Some(cached) = self.support_cache {
            return cached;
        }
        let window = self
            .regions
            .iter()
            .copied()
            .reduce(|a, b| a.union(&b));
        let bounds = self
            .frame
            .with_image(|img| img.foreground_bounds(window.as_ref(), predicate));
        self.support_cache = Some(bounds);
        bounds
    }

    /// Support expressed in global/source coordinates.
    pub fn global_support(&mut self, predicate: &ForegroundPredicate) -> Option<Interval3> {
        let initial_inv = self.frame.initial().inverse();
        self.support(predicate)
            // Half-voxel padding accounts for the one-voxel plane thickness.
            .map(|iv| iv.expand(0.5).transformed(&initial_inv))
    }

    /// Immutable copy of everything a background sweep needs.
    pub fn snapshot(&mut self, depth: f64, predicate: &ForegroundPredicate) -> SliceSnapshot {
        SliceSnapshot {
            depth,
            initial: self.frame.initial(),
            current: self.frame.current(),
            image: self.frame.clone_image(),
            support: self.support(predicate),
        }
    }
}

/// Frozen view of a [`Slice`] taken under the session lock and handed to the
/// sweep worker. Image data is a COW clone, so this is cheap.
#[derive(Clone)]
pub struct SliceSnapshot {
    pub depth: f64,
    pub initial: DAffine3,
    pub current: DAffine3,
    pub image: LabelImage,
    pub support: Option<Interval3>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::{ERASED, default_foreground};

    fn filled(w: u32, h: u32, region: Interval3, label: Label) -> LabelImage {
        let mut img = LabelImage::new(w, h);
        img.fill_interval(&region, label);
        img
    }

    #[test]
    fn unallocated_pixels_read_background() {
        let img = LabelImage::new(200, 200);
        assert_eq!(img.get(0, 0), BACKGROUND);
        assert_eq!(img.get(199, 199), BACKGROUND);
        assert_eq!(img.get(5000, 0), BACKGROUND);
    }

    #[test]
    fn clone_is_copy_on_write() {
        let mut a = LabelImage::new(128, 128);
        a.set(10, 10, 7);
        let b = a.clone();
        a.set(10, 10, 9);
        assert_eq!(b.get(10, 10), 7);
        assert_eq!(a.get(10, 10), 9);
        // Untouched chunk in the other corner stays shared and background
        assert_eq!(b.get(127, 127), BACKGROUND);
    }

    #[test]
    fn foreground_bounds_ignore_erased() {
        let pred = default_foreground();
        let mut img = LabelImage::new(100, 100);
        img.set(20, 30, 5);
        img.set(40, 60, 5);
        img.set(90, 90, ERASED);
        let b = img.foreground_bounds(None, &pred).unwrap();
        assert_eq!(b.min, DVec3::new(20.0, 30.0, 0.0));
        assert_eq!(b.max, DVec3::new(40.0, 60.0, 0.0));
    }

    #[test]
    fn bounds_none_when_everything_erased() {
        let pred = default_foreground();
        let mut img = filled(
            64,
            64,
            Interval3::new(DVec3::new(4.0, 4.0, 0.0), DVec3::new(9.0, 9.0, 0.0)),
            3,
        );
        img.fill_interval(
            &Interval3::new(DVec3::new(4.0, 4.0, 0.0), DVec3::new(9.0, 9.0, 0.0)),
            ERASED,
        );
        assert_eq!(img.foreground_bounds(None, &pred), None);
    }

    #[test]
    fn frame_reconciliation_round_trips_through_global() {
        // Two frames created under different camera offsets. A painted
        // pixel must land on the same global voxel through either frame.
        let view_a = DAffine3::from_translation(DVec3::new(-10.0, 0.0, 0.0));
        let view_b = DAffine3::from_translation(DVec3::new(-4.0, -2.0, 0.0));
        let fa = MaskFrame::new(view_a, view_a, LabelImage::new(64, 64));
        let fb = MaskFrame::new(view_b, view_b, LabelImage::new(64, 64));

        // frame_to_frame(a -> b) maps a's painted pixels into b's display
        let map = fa.frame_to_frame(&fb);
        let p_in_a = DVec3::new(12.0, 5.0, 0.0);
        let global = view_a.inverse().transform_point3(p_in_a);
        let expected_in_b = view_b.transform_point3(global);
        let got = map.transform_point3(p_in_a);
        assert!((got - expected_in_b).length() < 1e-12);
    }

    #[test]
    fn current_transform_moves_placement_without_touching_pixels() {
        let initial = DAffine3::IDENTITY;
        let frame = MaskFrame::new(initial, initial, LabelImage::new(64, 64));
        frame.with_image(|img| img.set(3, 4, 11));

        let moved = DAffine3::from_translation(DVec3::new(100.0, 0.0, 0.0));
        frame.set_current(moved);

        // Placement reflects the camera; backing pixels are untouched.
        let placed = frame.display_transform().transform_point3(DVec3::new(3.0, 4.0, 0.0));
        assert!((placed - DVec3::new(103.0, 4.0, 0.0)).length() < 1e-12);
        assert_eq!(frame.clone_image().get(3, 4), 11);
    }

    #[test]
    fn slice_support_caches_and_invalidates() {
        let pred = default_foreground();
        let region = Interval3::new(DVec3::new(2.0, 2.0, 0.0), DVec3::new(6.0, 6.0, 0.0));
        let frame = Arc::new(MaskFrame::new(
            DAffine3::IDENTITY,
            DAffine3::IDENTITY,
            filled(64, 64, region, 5),
        ));
        let mut slice = Slice::new(frame.clone(), region);
        let s1 = slice.support(&pred).unwrap();
        assert_eq!(s1.min, DVec3::new(2.0, 2.0, 0.0));
        assert_eq!(s1.max, DVec3::new(6.0, 6.0, 0.0));

        // Erase everything; stale cache must be dropped by the mutation.
        frame.with_image(|img| img.fill_interval(&region, ERASED));
        slice.invalidate_support();
        assert_eq!(slice.support(&pred), None);
    }

    #[test]
    fn merge_gesture_resamples_into_initial_space() {
        // Slice created with the camera at the origin; second gesture painted
        // after the camera panned right by 8.
        let initial = DAffine3::IDENTITY;
        let frame = MaskFrame::new(initial, initial, LabelImage::new(64, 64));

        let panned = DAffine3::from_translation(DVec3::new(8.0, 0.0, 0.0));
        let mut gesture = LabelImage::new(64, 64);
        gesture.set(10, 10, 6); // global x = 2 under the panned camera

        frame.merge_gesture(&gesture, &panned);
        assert_eq!(frame.clone_image().get(2, 10), 6);
    }
}
