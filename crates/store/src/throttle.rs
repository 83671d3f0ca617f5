//! Per-object suppression of noisy event classes.

use std::time::Duration;

use kwatch_core::{EventType, RawEvent, ThrottleConfig};
use metrics::counter;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ThrottleKey {
    namespace: Option<String>,
    kind: String,
    name: String,
    event_type: EventType,
}

/// Entry: last time the key was let through, and the window it is held to.
type Seen = (Instant, Duration);

pub struct EventThrottle {
    windows: FxHashMap<String, SmallVec<[(EventType, Duration); 2]>>,
    seen: FxHashMap<ThrottleKey, Seen>,
    purge_interval: Duration,
    last_purge: Instant,
}

impl EventThrottle {
    pub fn new(cfg: &ThrottleConfig, now: Instant) -> Self {
        let mut windows: FxHashMap<String, SmallVec<[(EventType, Duration); 2]>> = FxHashMap::default();
        for rule in &cfg.rules {
            windows
                .entry(rule.kind.clone())
                .or_default()
                .push((rule.event_type.clone(), Duration::from_millis(rule.window_ms)));
        }
        Self { windows, seen: FxHashMap::default(), purge_interval: cfg.purge_interval(), last_purge: now }
    }

    fn window_for(&self, kind: &str, event_type: &EventType) -> Option<Duration> {
        self.windows.get(kind)?.iter().find(|(t, _)| t == event_type).map(|(_, w)| *w)
    }

    /// Pass the event through, or `None` when an identical class/object was let through
    /// less than one window ago. Unthrottled classes always pass.
    pub fn admit(&mut self, ev: RawEvent, now: Instant) -> Option<RawEvent> {
        self.maybe_purge(now);
        let Some(window) = self.window_for(&ev.object.kind, &ev.event_type) else {
            return Some(ev);
        };
        let key = ThrottleKey {
            namespace: ev.object.namespace.clone(),
            kind: ev.object.kind.clone(),
            name: ev.object.name.clone(),
            event_type: ev.event_type.clone(),
        };
        let allow = match self.seen.get(&key) {
            Some((last, _)) => now.saturating_duration_since(*last) > window,
            None => true,
        };
        if allow {
            self.seen.insert(key, (now, window));
            Some(ev)
        } else {
            debug!(kind = %key.kind, name = %key.name, event = %key.event_type, "throttle: suppressed");
            counter!("throttle_suppressed_total", 1u64, "kind" => key.kind);
            None
        }
    }

    fn maybe_purge(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_purge) <= self.purge_interval {
            return;
        }
        let before = self.seen.len();
        self.seen.retain(|_, (last, window)| now.saturating_duration_since(*last) <= *window);
        let purged = before - self.seen.len();
        if purged > 0 {
            debug!(purged, remaining = self.seen.len(), "throttle: purged stale keys");
            counter!("throttle_purged_total", purged as u64);
        }
        self.last_purge = now;
    }

    /// Number of keys currently remembered.
    pub fn tracked(&self) -> usize { self.seen.len() }
}
