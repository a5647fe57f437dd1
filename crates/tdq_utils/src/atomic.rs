use std::sync::atomic::Ordering;

/// Ordering used for all atomics shared between queue threads.
pub const ORDERING: Ordering = Ordering::SeqCst;
