// ============================================================================
// SESSION CONTROLLER — mode transitions, single-flight sweep, apply/commit
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use glam::{DAffine3, DVec3};

use crate::error::MaskError;
use crate::interval::Interval3;
use crate::label::{BACKGROUND, ForegroundPredicate, IdService, Label, default_foreground};
use crate::mask::{LabelImage, MaskFrame, Slice};
use crate::ops::CancellationToken;
use crate::ops::composite::{CompositeMask, CompositePlane};
use crate::ops::interpolate::interpolate_pair;
use crate::sequence::SliceSequence;
use crate::source::{DataSource, InvalidateHook, MaskField, MaskInfo, Viewer};

/// Two gestures land on the same plane when their depths differ by less
/// than half a voxel along the session normal.
pub const DEPTH_MATCH_EPS: f64 = 0.5;

/// Lifecycle of one interpolation session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    /// Not active; no session mask installed.
    Off,
    /// Awaiting picks.
    Select,
    /// Background recompute running.
    Interpolate,
    /// Composite ready.
    Preview,
    /// Transient camera-jump navigation between slice planes.
    Moving,
}

/// Which existing slice `edit_selection` should navigate to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceTarget {
    First,
    Previous,
    Next,
    Last,
}

/// Session-level knobs supplied by the host application.
#[derive(Clone)]
pub struct SessionConfig {
    /// Volume voxel → world transform, composed into every view transform
    /// so the whole core works in source/voxel coordinates.
    pub volume_transform: DAffine3,
    /// Start with the interpolation preview enabled.
    pub preview: bool,
    /// What counts as painted. Defaults to "neither background nor erased".
    pub foreground: ForegroundPredicate,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            volume_transform: DAffine3::IDENTITY,
            preview: true,
            foreground: default_foreground(),
        }
    }
}

// ---------------------------------------------------------------------------
//  Shared state between the trigger surface and the sweep worker
// ---------------------------------------------------------------------------

struct SweepRequest {
    token: CancellationToken,
}

/// Deferred repaint: outer `None` = nothing pending, `Some(None)` = full
/// repaint, `Some(Some(iv))` = repaint over the interval.
type RepaintSpan = Option<Option<Interval3>>;

fn merge_repaint(a: RepaintSpan, b: RepaintSpan) -> RepaintSpan {
    match (a, b) {
        (None, b) => b,
        (a, None) => a,
        (Some(None), _) | (_, Some(None)) => Some(None),
        (Some(Some(x)), Some(Some(y))) => Some(Some(x.union(&y))),
    }
}

struct SessionInner {
    state: ControllerState,
    sequence: SliceSequence,
    /// First slice's initial transform; depths are z in this frame.
    reference: Option<DAffine3>,
    /// Depth last navigated to or painted on, for Previous/Next navigation.
    active_depth: Option<f64>,
    temporary_label: Label,
    target_label: Label,
    pending: Option<SweepRequest>,
    active_token: Option<CancellationToken>,
    sweeping: bool,
    shutdown: bool,
    preview: bool,
    deferred_repaint: RepaintSpan,
    composite: Option<Arc<CompositeMask>>,
}

struct SharedState {
    inner: Mutex<SessionInner>,
    /// Wakes the sweep worker when a request is enqueued (or on shutdown).
    work_cv: Condvar,
    /// Wakes `apply_mask` waiters when a sweep finishes.
    idle_cv: Condvar,
    /// Live voxel → display transform; touched by UI-thread view callbacks
    /// without taking the session lock.
    view: Mutex<DAffine3>,
    /// Every slice frame ever handed out, for current-transform updates.
    frames: Mutex<Vec<Weak<MaskFrame>>>,
    viewer: Mutex<Option<Arc<dyn Viewer>>>,
    /// Snapshot read by the installed live mask; swapped only while the
    /// session lock is held, so readers always see a (Sequence, composite)
    /// pair that belonged together.
    published: RwLock<Option<Arc<CompositeMask>>>,
    foreground: ForegroundPredicate,
    /// Sweep counter, for log correlation only.
    sweep_serial: AtomicU64,
}

/// The field installed on the data source. Reads the currently published
/// composite; before the first sweep (or after exit) everything is
/// background.
struct LiveMask {
    shared: Weak<SharedState>,
}

impl MaskField for LiveMask {
    fn label_at(&self, p: DVec3) -> Label {
        match self.shared.upgrade() {
            Some(shared) => match shared.published.read().unwrap().as_ref() {
                Some(composite) => composite.label_at(p),
                None => BACKGROUND,
            },
            None => BACKGROUND,
        }
    }
}

// ---------------------------------------------------------------------------
//  Controller
// ---------------------------------------------------------------------------

/// Orchestrates one shape-interpolation session: exactly one active
/// instance per session.
///
/// The trigger surface (`enter`, `add_selection`, `delete_slice_at`,
/// `toggle_preview`, `apply_mask`, `edit_selection`, `exit`) is called by
/// the host UI layer; the recompute sweep runs on a single long-lived
/// worker thread consuming a single-slot latest-request queue with a
/// cooperative cancellation token.
pub struct InterpolationController {
    shared: Arc<SharedState>,
    data_source: Mutex<Box<dyn DataSource>>,
    ids: Mutex<Box<dyn IdService>>,
    config: SessionConfig,
    worker: Option<JoinHandle<()>>,
}

impl InterpolationController {
    pub fn new(
        data_source: Box<dyn DataSource>,
        ids: Box<dyn IdService>,
        config: SessionConfig,
    ) -> Self {
        let shared = Arc::new(SharedState {
            inner: Mutex::new(SessionInner {
                state: ControllerState::Off,
                sequence: SliceSequence::new(),
                reference: None,
                active_depth: None,
                temporary_label: BACKGROUND,
                target_label: BACKGROUND,
                pending: None,
                active_token: None,
                sweeping: false,
                shutdown: false,
                preview: config.preview,
                deferred_repaint: None,
                composite: None,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            view: Mutex::new(DAffine3::IDENTITY),
            frames: Mutex::new(Vec::new()),
            viewer: Mutex::new(None),
            published: RwLock::new(None),
            foreground: config.foreground.clone(),
            sweep_serial: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("volseg-sweep".into())
            .spawn(move || sweep_loop(worker_shared))
            .expect("failed to spawn sweep worker");

        Self {
            shared,
            data_source: Mutex::new(data_source),
            ids: Mutex::new(ids),
            config,
            worker: Some(worker),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.shared.inner.lock().unwrap().state
    }

    pub fn slice_count(&self) -> usize {
        self.shared.inner.lock().unwrap().sequence.slice_count()
    }

    pub fn slice_depths(&self) -> Vec<f64> {
        self.shared.inner.lock().unwrap().sequence.slice_depths()
    }

    pub fn preview(&self) -> bool {
        self.shared.inner.lock().unwrap().preview
    }

    /// The session-scoped label the UI should paint gestures with. Remapped
    /// to the real target id at commit time.
    pub fn temporary_label(&self) -> Label {
        self.shared.inner.lock().unwrap().temporary_label
    }

    /// The currently published composite, as the render overlay sees it.
    pub fn composite(&self) -> Option<Arc<CompositeMask>> {
        self.shared.published.read().unwrap().clone()
    }

    /// Block until no sweep is running or queued. Returns false on timeout.
    pub fn await_idle(&self, timeout: Duration) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        let (_guard, result) = self
            .shared
            .idle_cv
            .wait_timeout_while(inner, timeout, |i| i.sweeping || i.pending.is_some())
            .unwrap();
        !result.timed_out()
    }

    // -- lifecycle ----------------------------------------------------------

    /// Off → Select: install the session mask on the data source and start
    /// listening to the viewer. A foreign mask already occupying the slot is
    /// recovered by resetting, loudly.
    pub fn enter(&self, viewer: Arc<dyn Viewer>) -> Result<(), MaskError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state != ControllerState::Off {
            log::debug!("enter ignored: session already active ({:?})", inner.state);
            return Ok(());
        }

        let (temporary, target) = {
            let mut ids = self.ids.lock().unwrap();
            (ids.next_temporary(), ids.next())
        };
        inner.temporary_label = temporary;
        inner.target_label = target;

        *self.shared.view.lock().unwrap() =
            viewer.view_transform() * self.config.volume_transform;
        *self.shared.viewer.lock().unwrap() = Some(Arc::clone(&viewer));

        let info = MaskInfo::new(temporary);
        self.install_mask(&info, &viewer)?;
        inner.state = ControllerState::Select;
        log::info!(
            "entered shape interpolation: mask {}, temporary label {temporary:#x}",
            info.id
        );
        Ok(())
    }

    fn install_mask(&self, info: &MaskInfo, viewer: &Arc<dyn Viewer>) -> Result<(), MaskError> {
        let live: Arc<dyn MaskField> = Arc::new(LiveMask {
            shared: Arc::downgrade(&self.shared),
        });
        let hook_viewer = Arc::clone(viewer);
        let hook: InvalidateHook =
            Box::new(move |iv: &Interval3| hook_viewer.request_repaint(Some(*iv)));

        let mut source = self.data_source.lock().unwrap();
        match source.set_mask(
            info.clone(),
            Arc::clone(&live),
            Arc::clone(&live),
            Some(hook),
            self.shared.foreground.clone(),
        ) {
            Err(MaskError::MaskInUse(owner)) => {
                log::warn!("mask slot occupied ({owner}); resetting data source");
                source.reset_masks(true)?;
                let hook_viewer = Arc::clone(viewer);
                let hook: InvalidateHook =
                    Box::new(move |iv: &Interval3| hook_viewer.request_repaint(Some(*iv)));
                source.set_mask(
                    info.clone(),
                    Arc::clone(&live),
                    live,
                    Some(hook),
                    self.shared.foreground.clone(),
                )
            }
            other => other,
        }
    }

    /// Leave the session. With `commit` the pending preview is applied
    /// first; a commit failure is propagated but the controller still
    /// returns to Off.
    pub fn exit(&self, commit: bool) -> Result<(), MaskError> {
        let commit_result = if commit {
            self.apply_mask(true).map(|_| ())
        } else {
            Ok(())
        };

        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state != ControllerState::Off {
            if let Some(token) = inner.active_token.take() {
                token.cancel();
            }
            inner.pending = None;
            inner.sequence.clear();
            inner.composite = None;
            inner.reference = None;
            inner.active_depth = None;
            inner.deferred_repaint = None;
            inner.state = ControllerState::Off;
            *self.shared.published.write().unwrap() = None;
            drop(inner);

            self.shared.frames.lock().unwrap().clear();
            *self.shared.viewer.lock().unwrap() = None;
            // Discard the uncommitted session fill.
            self.data_source.lock().unwrap().reset_masks(true)?;
            log::info!("exited shape interpolation (commit: {commit})");
        }
        commit_result
    }

    // -- selection editing --------------------------------------------------

    /// Record a gesture: `gesture` holds the painted labels in the frame
    /// described by `transform` (global → gesture pixel space, plane at
    /// z = 0), `region` the gesture's extent in that same frame.
    ///
    /// A gesture within half a voxel of an existing slice's plane merges
    /// into that slice (regions append); otherwise a new slice is created.
    /// Either way the affected interpolants are invalidated and the
    /// single-flight sweep relaunches.
    pub fn add_selection(
        &self,
        region: Interval3,
        transform: DAffine3,
        gesture: LabelImage,
    ) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.state {
            ControllerState::Select
            | ControllerState::Interpolate
            | ControllerState::Preview => {}
            _ => return false,
        }

        let reference = *inner.reference.get_or_insert(transform);
        let plane_origin = transform.inverse().transform_point3(DVec3::ZERO);
        let depth = reference.transform_point3(plane_origin).z;

        let repaint_span = region
            .expand(DEPTH_MATCH_EPS)
            .transformed(&transform.inverse());

        let existing = inner
            .sequence
            .slice_depths()
            .into_iter()
            .find(|d| (d - depth).abs() <= DEPTH_MATCH_EPS);
        match existing {
            Some(at) => {
                let slice = inner.sequence.slice_at_mut(at, DEPTH_MATCH_EPS).unwrap();
                slice.frame.merge_gesture(&gesture, &transform);
                let local = region
                    .transformed(&(slice.frame.initial() * transform.inverse()))
                    .flatten_z();
                slice.add_region(local);
                inner.sequence.remove_interpolants_adjacent_to(at);
                inner.active_depth = Some(at);
                log::debug!("merged gesture into slice at depth {at:.2}");
            }
            None => {
                let frame = Arc::new(MaskFrame::new(
                    transform,
                    *self.shared.view.lock().unwrap(),
                    gesture,
                ));
                self.shared
                    .frames
                    .lock()
                    .unwrap()
                    .push(Arc::downgrade(&frame));
                inner
                    .sequence
                    .insert_slice(depth, Slice::new(frame, region));
                inner.active_depth = Some(depth);
                log::debug!(
                    "new slice at depth {depth:.2} ({} total)",
                    inner.sequence.slice_count()
                );
            }
        }

        self.launch_sweep(&mut inner);
        let repaint = self.queue_repaint(&mut inner, Some(Some(repaint_span)));
        drop(inner);
        self.send_repaint(repaint);
        true
    }

    /// Remove the slice at `depth` (within half a voxel) together with its
    /// flanking interpolants. A sweep defined by that slice is cancelled
    /// and relaunched from the remaining sequence.
    pub fn delete_slice_at(&self, depth: f64) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.state {
            ControllerState::Select
            | ControllerState::Interpolate
            | ControllerState::Preview => {}
            _ => return false,
        }
        let Some(mut removed) = inner.sequence.remove_slice_at(depth, DEPTH_MATCH_EPS) else {
            return false;
        };
        let span = removed.global_support(&self.shared.foreground);
        if inner.active_depth.is_some_and(|d| (d - depth).abs() <= DEPTH_MATCH_EPS) {
            inner.active_depth = inner.sequence.slice_depths().last().copied();
        }
        log::debug!(
            "deleted slice at depth {depth:.2} ({} remaining)",
            inner.sequence.slice_count()
        );

        if inner.sequence.is_empty() {
            // Nothing left to interpolate: back to picking.
            if let Some(token) = inner.active_token.take() {
                token.cancel();
            }
            inner.pending = None;
            inner.composite = None;
            *self.shared.published.write().unwrap() = None;
            inner.state = ControllerState::Select;
        } else {
            self.launch_sweep(&mut inner);
        }
        let repaint = self.queue_repaint(&mut inner, Some(span.map(|s| s.expand(1.0))));
        drop(inner);
        self.send_repaint(repaint);
        true
    }

    /// Flip the interpolation preview. Forces an immediate repaint, flushing
    /// anything coalesced behind a running sweep.
    pub fn toggle_preview(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state == ControllerState::Off {
            return;
        }
        inner.preview = !inner.preview;
        let preview = inner.preview;
        log::debug!("preview {}", if preview { "on" } else { "off" });

        let composite = Arc::new(build_composite(
            &mut inner,
            !preview,
            preview,
            &self.shared.foreground,
        ));
        let span = composite.support();
        inner.composite = Some(Arc::clone(&composite));
        *self.shared.published.write().unwrap() = Some(composite);

        // Forced flush: the deferred span joins this repaint instead of
        // waiting for the sweep to finish.
        let repaint = merge_repaint(inner.deferred_repaint.take(), Some(span));
        drop(inner);
        self.send_repaint(repaint);
    }

    /// Navigate the camera to an existing slice's plane. The state goes
    /// Moving until the host reports arrival via `navigation_finished`.
    pub fn edit_selection(&self, which: SliceTarget) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.state {
            ControllerState::Select
            | ControllerState::Interpolate
            | ControllerState::Preview => {}
            _ => return false,
        }
        let depths = inner.sequence.slice_depths();
        if depths.is_empty() {
            return false;
        }
        let current = inner.active_depth;
        let target = match which {
            SliceTarget::First => depths.first().copied(),
            SliceTarget::Last => depths.last().copied(),
            SliceTarget::Previous => match current {
                Some(c) => depths.iter().rev().find(|d| **d < c - DEPTH_MATCH_EPS).copied(),
                None => depths.last().copied(),
            },
            SliceTarget::Next => match current {
                Some(c) => depths.iter().find(|d| **d > c + DEPTH_MATCH_EPS).copied(),
                None => depths.first().copied(),
            },
        };
        let Some(target) = target else { return false };

        let pose = inner
            .sequence
            .slice_at(target, DEPTH_MATCH_EPS)
            .map(|slice| slice.frame.initial());
        let Some(pose) = pose else { return false };
        inner.active_depth = Some(target);
        inner.state = ControllerState::Moving;
        drop(inner);

        let viewer = self.shared.viewer.lock().unwrap().clone();
        if let Some(viewer) = viewer {
            viewer.navigate_to(pose);
        }
        log::debug!("navigating to slice at depth {target:.2}");
        true
    }

    /// Host callback: the camera jump requested by `edit_selection` landed.
    pub fn navigation_finished(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state == ControllerState::Moving {
            inner.state = ControllerState::Select;
        }
    }

    // -- commit -------------------------------------------------------------

    /// Commit the composite to persistent storage.
    ///
    /// Valid only with ≥ 2 slices and a (possibly still recomputing)
    /// preview; returns `Ok(false)` otherwise — an expected UI condition,
    /// not an error. Blocks until the in-flight sweep finishes so the
    /// committed result is never stale, then remaps the temporary label to
    /// the target id and hands the composite to the data source in one
    /// shot. With `exit` the session ends; otherwise a fresh Select round
    /// starts for the next object.
    pub fn apply_mask(&self, exit: bool) -> Result<bool, MaskError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if !matches!(
            inner.state,
            ControllerState::Preview | ControllerState::Interpolate
        ) {
            return Ok(false);
        }
        if inner.sequence.slice_count() < 2 {
            return Ok(false);
        }

        // Block until the sweep result is current.
        while inner.sweeping || inner.pending.is_some() {
            if inner.shutdown {
                return Ok(false);
            }
            inner = self.shared.idle_cv.wait(inner).unwrap();
        }
        if inner.state != ControllerState::Preview || inner.sequence.slice_count() < 2 {
            return Ok(false);
        }

        let predicate = self.shared.foreground.clone();
        let Some(target_interval) = inner.sequence.global_support(&predicate) else {
            return Ok(false);
        };
        let target_interval = target_interval.snap_outward();

        // Commit sees every slice's own data plus every interpolant,
        // regardless of the preview-economy setting.
        let full = Arc::new(build_composite(&mut inner, true, true, &predicate));
        let target = inner.target_label;
        let remapped: Arc<dyn MaskField> = Arc::new(full.remapped(target));

        let mut source = self.data_source.lock().unwrap();
        source.apply_mask(remapped, target_interval, predicate)?;
        log::info!(
            "committed composite of {} slice(s) as label {target:#x} over {target_interval:?}",
            inner.sequence.slice_count()
        );

        // Success: tear the session down to Off, or straight into a fresh
        // Select round when the user keeps going.
        inner.sequence.clear();
        inner.composite = None;
        inner.reference = None;
        inner.active_depth = None;
        inner.deferred_repaint = None;
        *self.shared.published.write().unwrap() = None;
        self.shared.frames.lock().unwrap().clear();
        inner.state = if exit {
            ControllerState::Off
        } else {
            ControllerState::Select
        };
        source.reset_masks(false)?;

        if exit {
            drop(source);
            *self.shared.viewer.lock().unwrap() = None;
        } else {
            // Fresh round for the next object.
            let (temporary, target) = {
                let mut ids = self.ids.lock().unwrap();
                (ids.next_temporary(), ids.next())
            };
            inner.temporary_label = temporary;
            inner.target_label = target;
            drop(source);
            let viewer = self.shared.viewer.lock().unwrap().clone();
            if let Some(viewer) = viewer {
                let info = MaskInfo::new(temporary);
                self.install_mask(&info, &viewer)?;
            }
        }
        Ok(true)
    }

    // -- view callbacks -----------------------------------------------------

    /// Synchronous UI-thread notification of a camera change. Updates the
    /// live view and every slice frame's current transform; touches no
    /// pixel data and never takes the session mutation lock.
    pub fn view_transform_changed(&self, view: DAffine3) {
        let composed = view * self.config.volume_transform;
        *self.shared.view.lock().unwrap() = composed;
        let mut frames = self.shared.frames.lock().unwrap();
        frames.retain(|weak| match weak.upgrade() {
            Some(frame) => {
                frame.set_current(composed);
                true
            }
            None => false,
        });
    }

    // -- internals ----------------------------------------------------------

    /// Replace-on-enqueue into the single-slot request queue, cancelling
    /// whatever sweep is in flight.
    fn launch_sweep(&self, inner: &mut SessionInner) {
        if let Some(token) = &inner.active_token {
            token.cancel();
        }
        let token = CancellationToken::new();
        inner.active_token = Some(token.clone());
        inner.pending = Some(SweepRequest { token });
        inner.state = ControllerState::Interpolate;
        self.shared.work_cv.notify_one();
    }

    /// Coalesce a repaint behind a running sweep, or pass it through.
    fn queue_repaint(&self, inner: &mut SessionInner, span: RepaintSpan) -> RepaintSpan {
        if inner.sweeping || inner.pending.is_some() {
            inner.deferred_repaint = merge_repaint(inner.deferred_repaint.take(), span);
            None
        } else {
            span
        }
    }

    fn send_repaint(&self, span: RepaintSpan) {
        if let Some(interval) = span {
            let viewer = self.shared.viewer.lock().unwrap().clone();
            if let Some(viewer) = viewer {
                viewer.request_repaint(interval);
            }
        }
    }
}

impl Drop for InterpolationController {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.shutdown = true;
            if let Some(token) = inner.active_token.take() {
                token.cancel();
            }
            self.shared.work_cv.notify_all();
            self.shared.idle_cv.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Assemble the composite from the current sequence. `include_all_planes`
/// adds intermediate slices' own data (always on for commits, off in
/// preview-economy where the interpolant covers them);
/// `include_interpolants` adds the morphed fields.
fn build_composite(
    inner: &mut SessionInner,
    include_all_planes: bool,
    include_interpolants: bool,
    predicate: &ForegroundPredicate,
) -> CompositeMask {
    let depths = inner.sequence.slice_depths();
    let first = depths.first().copied();
    let last = depths.last().copied();

    let mut planes = Vec::new();
    for (depth, slice) in inner.sequence.slices_mut() {
        let endpoint = Some(depth) == first || Some(depth) == last;
        if !(include_all_planes || endpoint) {
            continue;
        }
        planes.push(CompositePlane {
            depth,
            world_to_mask: slice.frame.initial(),
            image: slice.frame.clone_image(),
            support: slice.global_support(predicate),
        });
    }
    let interpolants = if include_interpolants {
        inner.sequence.interpolants().cloned().collect()
    } else {
        Vec::new()
    };
    CompositeMask::new(planes, interpolants, inner.temporary_label)
}

// ---------------------------------------------------------------------------
//  Sweep worker
// ---------------------------------------------------------------------------

/// One long-lived worker: waits on the single-slot queue, recomputes every
/// adjacent pair from a frozen snapshot, and installs the result only if
/// the request was not cancelled underneath it. A cancelled sweep leaves
/// the sequence exactly as it found it — interpolants are computed into
/// private buffers and never partially installed.
fn sweep_loop(shared: Arc<SharedState>) {
    loop {
        let mut inner = shared.inner.lock().unwrap();
        let request = loop {
            if inner.shutdown {
                return;
            }
            if let Some(request) = inner.pending.take() {
                break request;
            }
            inner = shared.work_cv.wait(inner).unwrap();
        };
        inner.sweeping = true;
        let token = request.token;
        let serial = shared.sweep_serial.fetch_add(1, Ordering::Relaxed);
        let snapshots = inner.sequence.snapshots(&shared.foreground);
        drop(inner);

        let started = Instant::now();
        let mut computed = Vec::with_capacity(snapshots.len().saturating_sub(1));
        let mut interrupted = false;
        for pair in snapshots.windows(2) {
            if token.is_cancelled() {
                interrupted = true;
                break;
            }
            match interpolate_pair(&pair[0], &pair[1], &shared.foreground, &token) {
                Some(ip) => computed.push(ip),
                None => {
                    interrupted = true;
                    break;
                }
            }
        }

        let mut inner = shared.inner.lock().unwrap();
        if interrupted || token.is_cancelled() {
            // Drop everything on the floor; the sequence was never touched.
            log::debug!(
                "sweep #{serial} cancelled after {:?} ({} pair(s) done)",
                started.elapsed(),
                computed.len()
            );
            inner.sweeping = false;
            shared.idle_cv.notify_all();
            continue;
        }

        // Not cancelled ⟹ no mutation happened since the snapshot (every
        // mutation cancels the active token under this lock), so the
        // computed interpolants match the sequence one-to-one.
        inner.sequence.clear_interpolants();
        let pairs = computed.len();
        for ip in computed {
            inner.sequence.insert_interpolant(ip);
        }

        let preview = inner.preview;
        let composite = Arc::new(build_composite(
            &mut inner,
            !preview,
            preview,
            &shared.foreground,
        ));
        let span = composite.support();
        inner.composite = Some(Arc::clone(&composite));
        *shared.published.write().unwrap() = Some(composite);
        if inner.state == ControllerState::Interpolate {
            inner.state = ControllerState::Preview;
        }
        let repaint = merge_repaint(inner.deferred_repaint.take(), Some(span));
        inner.sweeping = false;
        shared.idle_cv.notify_all();
        drop(inner);

        log::debug!(
            "sweep #{serial}: {pairs} pair(s) in {:?}",
            started.elapsed()
        );
        if let Some(interval) = repaint {
            let viewer = shared.viewer.lock().unwrap().clone();
            if let Some(viewer) = viewer {
                viewer.request_repaint(interval);
            }
        }
    }
}
