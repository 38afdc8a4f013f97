use thiserror::Error;

/// Errors surfaced across the data-source boundary.
///
/// Cooperative cancellation is *not* an error (an interrupted sweep simply
/// yields no result), and UI-driven invalid transitions are reported as
/// `false` returns on the trigger surface, so neither appears here.
#[derive(Debug, Error)]
pub enum MaskError {
    /// The data source's mutable mask slot is already owned by another actor.
    #[error("mask already in use: {0}")]
    MaskInUse(String),

    /// The external apply operation failed while committing the composite.
    #[error("mask commit failed: {0}")]
    Commit(String),

    /// Any other failure reported by the data source.
    #[error("data source error: {0}")]
    Source(String),
}
