// ============================================================================
// ALGORITHMS — distance transforms, pairwise morphs, composite assembly
// ============================================================================

pub mod composite;
pub mod distance;
pub mod interpolate;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cancellation token shared between the controller and the sweep worker.
///
/// Cancellation is cooperative: long computations poll the token at
/// well-defined points and bail out with "no result" — never an error.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
