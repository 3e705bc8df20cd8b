//! Export Fanout: multiplexes violation events to N configured
//! sinks, each with a bounded drop-oldest queue so one slow sink never
//! blocks the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use parking_lot::RwLock;
use tracing::warn;

use crate::driver::Violation;

/// A single deduplicated violation ready to leave the process.
#[derive(Debug, Clone)]
pub struct ViolationEvent {
    pub constraint_full_id: String,
    pub resource: String,
    pub enforcement_action: String,
    pub violation: Violation,
}

/// Per-sink counters exposed for observability: accepted, dropped,
/// last-error.
#[derive(Default)]
pub struct SinkMetrics {
    pub accepted: AtomicU64,
    pub dropped: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SinkMetrics {
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("lock poisoned").clone()
    }

    fn record_error(&self, error: String) {
        *self.last_error.lock().expect("lock poisoned") = Some(error);
    }
}

/// A sink receives events pushed to it by the fanout; failures are recorded
/// but never propagate back to the publisher — one sink's failure never
/// blocks the others.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    fn send(&self, event: &ViolationEvent) -> Result<(), String>;
}

/// A bounded, drop-oldest queue in front of one `Sink`. `capacity` events
/// may sit in the queue; `publish` drains synchronously on the calling
/// thread, trading a little publisher latency for simplicity — sinks are
/// expected to be fast (metrics counters, a log line, a small HTTP POST)
/// and none of this crate's failure semantics require async fanout.
struct SinkHandle {
    sink: Box<dyn Sink>,
    queue: RwLock<std::collections::VecDeque<ViolationEvent>>,
    capacity: usize,
    metrics: Arc<SinkMetrics>,
}

impl SinkHandle {
    fn new(sink: Box<dyn Sink>, capacity: usize) -> Self {
        Self {
            sink,
            queue: RwLock::new(std::collections::VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            metrics: Arc::new(SinkMetrics::default()),
        }
    }

    fn enqueue(&self, event: ViolationEvent) {
        let mut queue = self.queue.write();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
    }

    fn drain(&self) {
        let batch: Vec<ViolationEvent> = {
            let mut queue = self.queue.write();
            queue.drain(..).collect()
        };
        for event in batch {
            match self.sink.send(&event) {
                Ok(()) => {
                    self.metrics.accepted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(sink = self.sink.name(), error = %e, "export sink failed");
                    self.metrics.record_error(e);
                }
            }
        }
    }
}

/// The fanout itself: one `SinkHandle` per configured sink. Each sink is
/// independent — a panic-free `send` failure on one never prevents delivery
/// to the rest.
pub struct ExportFanout {
    sinks: Vec<SinkHandle>,
}

/// Default per-sink queue capacity when a sink doesn't need a tighter
/// bound; chosen to absorb one audit pass's worth of violations on a
/// mid-size cluster without unbounded growth.
pub const DEFAULT_SINK_QUEUE_CAPACITY: usize = 2000;

impl ExportFanout {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self::with_capacity(sinks, DEFAULT_SINK_QUEUE_CAPACITY)
    }

    pub fn with_capacity(sinks: Vec<Box<dyn Sink>>, capacity: usize) -> Self {
        Self { sinks: sinks.into_iter().map(|s| SinkHandle::new(s, capacity)).collect() }
    }

    /// Enqueues `event` on every sink then immediately drains each queue.
    /// Draining inline (rather than on a background task) keeps ordering
    /// simple: "violations for one resource appear atomically" falls
    /// out naturally since `publish` is called once per violation and each
    /// sink processes its queue in FIFO order.
    pub fn publish(&self, event: ViolationEvent) {
        for sink in &self.sinks {
            sink.enqueue(event.clone());
            sink.drain();
        }
    }

    pub fn metrics_for(&self, name: &str) -> Option<Arc<SinkMetrics>> {
        self.sinks.iter().find(|s| s.sink.name() == name).map(|s| Arc::clone(&s.metrics))
    }
}

/// A sink that records accepted events in memory, useful for tests and as
/// the default when no external sinks are configured.
pub struct MemorySink {
    name: String,
    events: Mutex<Vec<ViolationEvent>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), events: Mutex::new(Vec::new()) }
    }

    pub fn events(&self) -> Vec<ViolationEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, event: &ViolationEvent) -> Result<(), String> {
        self.events.lock().expect("lock poisoned").push(event.clone());
        Ok(())
    }
}

/// A sink that always fails, used to prove one sink's failure never blocks
/// delivery to the others.
pub struct FailingSink {
    name: String,
}

impl FailingSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Sink for FailingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, _event: &ViolationEvent) -> Result<(), String> {
        Err("sink unavailable".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(msg: &str) -> ViolationEvent {
        ViolationEvent {
            constraint_full_id: "t/c".into(),
            resource: "default/pod-a".into(),
            enforcement_action: "deny".into(),
            violation: Violation { msg: msg.into(), details: serde_json::Value::Null },
        }
    }

    #[test]
    fn test_publish_reaches_memory_sink() {
        let fanout = ExportFanout::new(vec![Box::new(MemorySink::new("mem"))]);
        fanout.publish(event("missing owner"));
        let metrics = fanout.metrics_for("mem").unwrap();
        assert_eq!(metrics.accepted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_one_sink_failure_does_not_block_others() {
        let good = MemorySink::new("good");
        let fanout = ExportFanout::new(vec![Box::new(FailingSink::new("bad")), Box::new(good)]);
        fanout.publish(event("x"));
        assert_eq!(fanout.metrics_for("bad").unwrap().dropped.load(Ordering::Relaxed), 0);
        assert!(fanout.metrics_for("bad").unwrap().last_error().is_some());
        assert_eq!(fanout.metrics_for("good").unwrap().accepted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_bounded_queue_drops_oldest_on_overflow() {
        // With capacity 1 and no draining between enqueues, the second
        // enqueue must evict the first before `publish`'s own drain runs.
        let handle = SinkHandle::new(Box::new(MemorySink::new("tiny")), 1);
        handle.enqueue(event("first"));
        handle.enqueue(event("second"));
        assert_eq!(handle.metrics.dropped.load(Ordering::Relaxed), 1);
        handle.drain();
    }
}
