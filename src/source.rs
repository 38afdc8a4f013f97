// ============================================================================
// COLLABORATOR CONTRACTS — data source, viewer, installed-mask metadata
// ============================================================================
//
// The core is library-style: it never renders and owns no durable state.
// Everything it needs from the host application comes through these traits,
// and everything durable goes back out through `DataSource::apply_mask`.

use std::sync::Arc;

use glam::{DAffine3, DVec3};
use uuid::Uuid;

use crate::error::MaskError;
use crate::interval::Interval3;
use crate::label::{ForegroundPredicate, Label};

/// A queryable label field over global/source coordinates. The live
/// composite and its commit-time remapping both speak this.
pub trait MaskField: Send + Sync {
    fn label_at(&self, p: DVec3) -> Label;
}

/// Invalidation callback handed to the data source alongside an installed
/// mask, so it can flush caches over a changed region.
pub type InvalidateHook = Box<dyn Fn(&Interval3) + Send + Sync>;

/// Identity of a mask installed on the data source.
#[derive(Clone, Debug)]
pub struct MaskInfo {
    pub id: Uuid,
    /// The session-scoped temporary label the composite is filled with.
    pub temporary_label: Label,
}

impl MaskInfo {
    pub fn new(temporary_label: Label) -> Self {
        Self {
            id: Uuid::new_v4(),
            temporary_label,
        }
    }
}

/// The persistent segmentation storage behind the session.
///
/// `set_mask` may fail with [`MaskError::MaskInUse`] when another actor
/// already owns the mutable mask slot; the controller recovers by resetting
/// and retrying, never by silently ignoring it. `apply_mask` is the one-shot
/// atomic commit of a composite into storage.
pub trait DataSource: Send {
    fn set_mask(
        &mut self,
        info: MaskInfo,
        data: Arc<dyn MaskField>,
        volatile: Arc<dyn MaskField>,
        invalidate: Option<InvalidateHook>,
        foreground: ForegroundPredicate,
    ) -> Result<(), MaskError>;

    fn apply_mask(
        &mut self,
        mask: Arc<dyn MaskField>,
        target_interval: Interval3,
        foreground: ForegroundPredicate,
    ) -> Result<(), MaskError>;

    fn reset_masks(&mut self, clear_fill: bool) -> Result<(), MaskError>;
}

/// The host viewer. The core only reads transforms, asks for repaints, and
/// requests camera jumps for slice navigation; it never draws anything.
/// View-change notifications flow the other way, through
/// [`crate::session::InterpolationController::view_transform_changed`].
pub trait Viewer: Send + Sync {
    /// Current world → display transform.
    fn view_transform(&self) -> DAffine3;

    /// Ask the host to redraw, optionally only over a global interval.
    fn request_repaint(&self, interval: Option<Interval3>);

    /// Ask the host to move the camera to a slice's plane. The host calls
    /// `navigation_finished` on the controller once it arrives.
    fn navigate_to(&self, pose: DAffine3);
}
