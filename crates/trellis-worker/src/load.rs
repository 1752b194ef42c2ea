//! In-flight request accounting

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Counts requests in flight and derives the load score sent in heartbeats
#[derive(Debug)]
pub struct LoadTracker {
    in_flight: AtomicU32,
    completed: AtomicU64,
    max_concurrency: u32,
}

impl LoadTracker {
    /// Tracker with the given capacity (at least 1)
    pub fn new(max_concurrency: u32) -> Self {
        Self {
            in_flight: AtomicU32::new(0),
            completed: AtomicU64::new(0),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Mark a request as started; it ends when the guard drops
    pub fn begin(self: &Arc<Self>) -> LoadGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        LoadGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Requests currently in flight
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Requests finished since start
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// `in_flight / max_concurrency`, clamped to [0, 1]
    pub fn score(&self) -> f64 {
        (f64::from(self.in_flight()) / f64::from(self.max_concurrency)).clamp(0.0, 1.0)
    }
}

/// Ends a tracked request on drop
#[derive(Debug)]
pub struct LoadGuard {
    tracker: Arc<LoadTracker>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.tracker.completed.fetch_add(1, Ordering::SeqCst);
    }
}
