#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "loom")]
pub(crate) use loom::sync::atomic::{AtomicUsize, Ordering};

#[cfg(not(feature = "loom"))]
pub(crate) use crossbeam::utils::Backoff;

/// Under loom the space-acquisition spin must yield to the model's
/// scheduler instead of burning a core.
#[cfg(feature = "loom")]
pub(crate) struct Backoff;

#[cfg(feature = "loom")]
impl Backoff {
    pub(crate) fn new() -> Self {
        Backoff
    }

    pub(crate) fn spin(&self) {
        loom::thread::yield_now();
    }
}
