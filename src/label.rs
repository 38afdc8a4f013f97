// ============================================================================
// LABEL VALUES — reserved ids, foreground predicates, id allocation
// ============================================================================

use std::sync::Arc;

/// A segmentation label value as stored in the volume.
pub type Label = u64;

/// Never-painted pixels read as this value.
pub const BACKGROUND: Label = 0;

/// Explicitly painted-out pixels. Erased pixels are not foreground, but they
/// occlude interpolated values underneath them in the composite.
pub const ERASED: Label = u64::MAX;

/// Decides whether a label value counts as "painted" vs. background/invalid.
pub type ForegroundPredicate = Arc<dyn Fn(Label) -> bool + Send + Sync>;

/// Returns true for every label except the two reserved values.
#[inline(always)]
pub fn is_foreground(label: Label) -> bool {
    label != BACKGROUND && label != ERASED
}

/// The default predicate: anything that is neither background nor erased.
pub fn default_foreground() -> ForegroundPredicate {
    Arc::new(is_foreground)
}

/// External id allocation. Session-scoped temporary ids must never collide
/// with a persisted id.
pub trait IdService: Send {
    /// Allocate a fresh persistent label id.
    fn next(&mut self) -> Label;

    /// Allocate a session-scoped temporary id.
    fn next_temporary(&mut self) -> Label;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_values_are_not_foreground() {
        assert!(!is_foreground(BACKGROUND));
        assert!(!is_foreground(ERASED));
        assert!(is_foreground(1));
        assert!(is_foreground(ERASED - 1));
    }

    #[test]
    fn default_predicate_matches_helper() {
        let pred = default_foreground();
        for v in [BACKGROUND, 1, 17, ERASED] {
            assert_eq!(pred(v), is_foreground(v));
        }
    }
}
