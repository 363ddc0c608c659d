//! Cooperative pause signal for a reconciliation run.
//!
//! The engine never interrupts a store call. It polls a [`PauseSignal`] at
//! fixed points (before each page fetch, each grouping probe and each unit
//! of work) and stops cleanly when a pause has been requested. Because the
//! flag lives outside the run state, a UI task can hold a clone and request
//! a pause while the engine is busy inside `start()` or `resume()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ReconcileError;

/// A shareable pause-intent flag.
///
/// Cloning yields another handle to the same flag.
///
/// # Example
///
/// ```
/// use reconcile_core::PauseSignal;
///
/// let signal = PauseSignal::new();
/// let ui_handle = signal.clone();
///
/// ui_handle.request();
/// assert!(signal.is_requested());
/// ```
#[derive(Debug, Clone, Default)]
pub struct PauseSignal {
    requested: Arc<AtomicBool>,
}

impl PauseSignal {
    /// Create a signal with no pause requested.
    pub fn new() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request a pause. Takes effect at the next check point.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Check if a pause has been requested.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Withdraw any pending request.
    ///
    /// The engine calls this when a run starts or resumes.
    pub fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    /// Return `Err(ReconcileError::Paused)` if a pause is pending.
    pub fn check(&self) -> Result<(), ReconcileError> {
        if self.is_requested() {
            Err(ReconcileError::Paused)
        } else {
            Ok(())
        }
    }
}
