//! Reconciliation counters
//!
//! Distinct counters for completed, failed and released containers:
//! release-induced completions never touch the request/allocation
//! arithmetic, so a clean release cannot masquerade as churn.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

fn dec(cell: &AtomicU32) {
    let _ = cell.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
}

/// Shared counters of the reconciliation engine.
///
/// Only the reconciler task writes them; the heartbeat, the control
/// RPC and the lifecycle read them.
#[derive(Debug, Default)]
pub struct Gauges {
    /// Desired worker count.
    desired: AtomicU32,
    /// Containers asked of the RM: outstanding plus allocated.
    requested: AtomicU32,
    /// Containers currently assigned.
    allocated: AtomicU32,
    /// Real (non-release) completions since start.
    completed: AtomicU32,
    /// Completions that counted as failures.
    failed: AtomicU32,
    /// Release-induced completions.
    released: AtomicU32,
}

/// Point-in-time copy of the gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GaugeSnapshot {
    pub desired: u32,
    pub requested: u32,
    pub allocated: u32,
    pub completed: u32,
    pub failed: u32,
    pub released: u32,
}

impl Gauges {
    pub fn new(desired: u32) -> Self {
        let gauges = Self::default();
        gauges.desired.store(desired, Ordering::SeqCst);
        gauges
    }

    pub fn desired(&self) -> u32 {
        self.desired.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> u32 {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn allocated(&self) -> u32 {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u32 {
        self.released.load(Ordering::SeqCst)
    }

    pub fn add_requested(&self, n: u32) {
        self.requested.fetch_add(n, Ordering::SeqCst);
    }

    pub fn dec_requested(&self) {
        dec(&self.requested);
    }

    pub fn inc_allocated(&self) {
        self.allocated.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_allocated(&self) {
        dec(&self.allocated);
    }

    pub fn inc_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn inc_released(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> GaugeSnapshot {
        GaugeSnapshot {
            desired: self.desired(),
            requested: self.requested(),
            allocated: self.allocated(),
            completed: self.completed(),
            failed: self.failed(),
            released: self.released(),
        }
    }
}
