//! kwatch store: throttle -> buffer -> periodic dispatch into the application store.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kwatch_core::{put_resource, receive_events, remove_resource, EventType, RawEvent, Store};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

pub mod mem;
pub mod throttle;

pub use mem::{EventLogEntry, MemStore, ReportedError};
pub use throttle::EventThrottle;

/// Ordered events awaiting the next flush.
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Vec<RawEvent>,
}

impl EventBuffer {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, ev: RawEvent) { self.events.push(ev); }

    pub fn len(&self) -> usize { self.events.len() }

    pub fn is_empty(&self) -> bool { self.events.is_empty() }

    /// Swap the buffer for an empty one and hand back everything in arrival order.
    pub fn drain(&mut self) -> Vec<RawEvent> { std::mem::take(&mut self.events) }
}

/// Translates surviving events into store actions.
pub struct DispatchBridge {
    store: Arc<dyn Store>,
    event_log_kind: String,
}

impl DispatchBridge {
    pub fn new(store: Arc<dyn Store>, event_log_kind: impl Into<String>) -> Self {
        Self { store, event_log_kind: event_log_kind.into() }
    }

    /// Returns false when the event was dropped (unrecognized tag).
    pub fn dispatch(&self, ev: RawEvent) -> bool {
        if ev.object.kind == self.event_log_kind {
            let resources = self.store.get_state();
            self.store.dispatch(receive_events(resources, ev));
            return true;
        }
        let action = match ev.event_type {
            EventType::Added => put_resource(ev.object, true),
            EventType::Modified => put_resource(ev.object, false),
            EventType::Deleted => remove_resource(ev.object),
            EventType::Unrecognized(tag) => {
                trace!(tag = %tag, kind = %ev.object.kind, "aggregate: dropping unrecognized event type");
                return false;
            }
        };
        self.store.dispatch(action);
        true
    }
}

/// Sending side of a running aggregator plus its task.
pub struct AggregatorHandle {
    tx: mpsc::Sender<RawEvent>,
    task: Option<JoinHandle<()>>,
}

impl AggregatorHandle {
    /// Producer handle for one connection.
    pub fn sender(&self) -> mpsc::Sender<RawEvent> { self.tx.clone() }

    /// Stop the tick timer. Buffered-but-unflushed events are discarded. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("aggregate: stopped");
        }
    }

    pub fn is_running(&self) -> bool { self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) }
}

impl Drop for AggregatorHandle {
    fn drop(&mut self) { self.stop(); }
}

fn flush(buffer: &mut EventBuffer, bridge: &DispatchBridge) {
    if buffer.is_empty() {
        return;
    }
    let batch = buffer.drain();
    let n = batch.len();
    let mut dispatched = 0u64;
    for ev in batch {
        if bridge.dispatch(ev) {
            dispatched += 1;
        }
    }
    histogram!("aggregate_batch_size", n as f64);
    counter!("aggregate_flushes_total", 1u64);
    counter!("aggregate_dispatched_total", dispatched);
    debug!(events = n, dispatched, "aggregate: flushed");
}

/// Spawn the aggregation loop. Events received on the returned handle's senders are
/// throttled, buffered, and dispatched in arrival order on every `tick` (first tick one
/// period after spawn). The handle holds a sender of its own, so the loop keeps ticking
/// with no producers attached and only ends through [`AggregatorHandle::stop`] or drop.
pub fn spawn_aggregator(
    bridge: DispatchBridge,
    mut throttle: EventThrottle,
    tick: Duration,
    cap: usize,
) -> AggregatorHandle {
    let (tx, mut rx) = mpsc::channel::<RawEvent>(cap.max(1));
    let task = tokio::spawn(async move {
        let mut buffer = EventBuffer::new();
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = tick.as_millis() as u64, "aggregate: started");
        loop {
            tokio::select! {
                Some(ev) = rx.recv() => {
                    if let Some(ev) = throttle.admit(ev, Instant::now()) {
                        buffer.push(ev);
                    }
                }
                _ = ticker.tick() => flush(&mut buffer, &bridge),
            }
        }
    });
    AggregatorHandle { tx, task: Some(task) }
}
