//! Readiness Tracker: `expected`/`observed` counters per watched
//! kind, and a single boolean readiness probe.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::matcher::GroupVersionKind;

/// `Starting -> Syncing -> Ready -> (re-Syncing on config change) -> Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    Starting,
    Syncing,
    Ready,
}

struct Counters {
    expected: BTreeMap<GroupVersionKind, u32>,
    observed: BTreeMap<GroupVersionKind, u32>,
}

/// Thread-safe readiness state shared between the watcher pool (which
/// reports initial-list completion) and the admission pipeline (which reads
/// `is_ready` on every request).
pub struct ReadinessTracker {
    counters: RwLock<Counters>,
    ready: Arc<AtomicBool>,
    state: RwLock<ReadinessState>,
}

impl Default for ReadinessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessTracker {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(Counters { expected: BTreeMap::new(), observed: BTreeMap::new() }),
            ready: Arc::new(AtomicBool::new(false)),
            state: RwLock::new(ReadinessState::Starting),
        }
    }

    /// Replaces the expected-kind set, e.g. after a sync config change.
    /// Re-enters Syncing until the new set is fully observed.
    pub fn set_expected(&self, expected: BTreeMap<GroupVersionKind, u32>) {
        let mut counters = self.counters.write();
        for kind in expected.keys() {
            counters.observed.entry(kind.clone()).or_insert(0);
        }
        counters.expected = expected;
        drop(counters);
        *self.state.write() = ReadinessState::Syncing;
        self.recompute();
    }

    /// Called once a kind's initial list has been fully applied to the
    /// inventory.
    pub fn mark_observed(&self, kind: &GroupVersionKind) {
        {
            let mut counters = self.counters.write();
            *counters.observed.entry(kind.clone()).or_insert(0) += 1;
        }
        self.recompute();
    }

    fn recompute(&self) {
        let counters = self.counters.read();
        let ready = counters
            .expected
            .iter()
            .all(|(kind, &expected)| counters.observed.get(kind).copied().unwrap_or(0) >= expected);
        drop(counters);

        self.ready.store(ready, Ordering::SeqCst);
        if ready {
            let mut state = self.state.write();
            if *state != ReadinessState::Ready {
                info!("inventory readiness reached");
            }
            *state = ReadinessState::Ready;
        }
    }

    /// The readiness probe: boolean only, no detail.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ReadinessState {
        *self.state.read()
    }

    /// A cheap clone of the atomic flag for wiring into an HTTP readiness
    /// handler without sharing the whole tracker.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }
}
