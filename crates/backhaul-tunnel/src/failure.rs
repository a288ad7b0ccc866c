use std::sync::atomic::{AtomicU32, Ordering};

/// Consecutive failure count owned by one component
///
/// A success resets the count; callers compare the value returned by
/// [`record`](Self::record) against their own threshold.
#[derive(Debug, Default)]
pub struct FailureCounter {
    count: AtomicU32,
}

impl FailureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure and return the new consecutive count
    pub fn record(&self) -> u32 {
        self.count.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}
