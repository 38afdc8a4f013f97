//! Shape-interpolation core for interactive volumetric segmentation.
//!
//! Users draw 2D label shapes ("slices") on a few cross-sectional planes
//! through a 3D volume; this crate synthesizes the shape that should occupy
//! the planes in between. Drawn slices and derived interpolants live in a
//! depth-sorted [`sequence::SliceSequence`]; each slice carries its own
//! [`mask::MaskFrame`] so painted pixels stay correctly placed under later
//! camera motion; adjacent slices are morphed through signed Euclidean
//! distance fields ([`ops::interpolate`]); and everything is merged —
//! slice data over interpolation — into one queryable
//! [`ops::composite::CompositeMask`] that is previewed live and finally
//! committed to the external [`source::DataSource`].
//!
//! The [`session::InterpolationController`] ties it together: the mode
//! state machine, a single-flight cancellable recompute sweep on one
//! long-lived worker thread, repaint coalescing, and the apply/commit
//! hand-off. The crate never renders and persists nothing itself; the host
//! application supplies the viewer, the storage backend and id allocation
//! through the traits in [`source`] and [`label`].

#![allow(clippy::too_many_arguments)]

pub mod error;
pub mod interval;
pub mod label;
pub mod mask;
pub mod ops;
pub mod sequence;
pub mod session;
pub mod source;

pub use error::MaskError;
pub use interval::Interval3;
pub use label::{BACKGROUND, ERASED, ForegroundPredicate, IdService, Label, default_foreground};
pub use mask::{LabelImage, MaskFrame, Slice, SliceSnapshot};
pub use ops::CancellationToken;
pub use ops::composite::CompositeMask;
pub use ops::interpolate::Interpolant;
pub use sequence::SliceSequence;
pub use session::{
    ControllerState, InterpolationController, SessionConfig, SliceTarget,
};
pub use source::{DataSource, MaskField, MaskInfo, Viewer};
