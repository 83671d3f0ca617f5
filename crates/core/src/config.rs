//! Engine configuration with environment overrides (`KWATCH_*`).

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::EventType;

/// Reconnect budget for a single transport connection. Fixed delay, no exponential growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_retries: 3, delay_ms: 3000 } }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration { Duration::from_millis(self.delay_ms) }
}

/// One throttled event class: `(kind, event type)` with its window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRule {
    pub kind: String,
    pub event_type: EventType,
    pub window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub rules: Vec<ThrottleRule>,
    pub purge_interval_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            rules: vec![ThrottleRule { kind: "Endpoints".into(), event_type: EventType::Modified, window_ms: 10_000 }],
            purge_interval_secs: 120,
        }
    }
}

impl ThrottleConfig {
    /// Parse `Kind/VERB=ms[,Kind/VERB=ms...]`. An empty string yields no rules.
    pub fn parse_rules(raw: &str) -> Result<Vec<ThrottleRule>, String> {
        let mut rules = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (class, ms) = part.split_once('=').ok_or_else(|| format!("missing '=' in {part:?}"))?;
            let (kind, verb) = class.split_once('/').ok_or_else(|| format!("expected Kind/VERB in {class:?}"))?;
            let window_ms = ms.trim().parse::<u64>().map_err(|e| format!("bad window in {part:?}: {e}"))?;
            rules.push(ThrottleRule {
                kind: kind.trim().to_string(),
                event_type: EventType::from(verb.trim()),
                window_ms,
            });
        }
        Ok(rules)
    }

    pub fn purge_interval(&self) -> Duration { Duration::from_secs(self.purge_interval_secs) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub tick_interval_ms: u64,
    pub retry: RetryPolicy,
    pub throttle: ThrottleConfig,
    /// Capacity of the channel between connections and the aggregator.
    pub queue_cap: usize,
    /// Kind tag routed to the event-log sink instead of being applied as a resource.
    pub event_log_kind: String,
    /// Log every inbound frame payload.
    pub trace_frames: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            retry: RetryPolicy::default(),
            throttle: ThrottleConfig::default(),
            queue_cap: 2048,
            event_log_kind: "Event".to_string(),
            trace_frames: false,
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration { Duration::from_millis(self.tick_interval_ms.max(1)) }

    /// Defaults overlaid with `KWATCH_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = parsed(&get, "KWATCH_TICK_MS") { cfg.tick_interval_ms = v; }
        if let Some(v) = parsed(&get, "KWATCH_RETRY_MAX") { cfg.retry.max_retries = v; }
        if let Some(v) = parsed(&get, "KWATCH_RETRY_DELAY_MS") { cfg.retry.delay_ms = v; }
        if let Some(v) = parsed(&get, "KWATCH_QUEUE_CAP") { cfg.queue_cap = v; }
        if let Some(v) = parsed(&get, "KWATCH_THROTTLE_PURGE_SECS") { cfg.throttle.purge_interval_secs = v; }
        if let Some(v) = parsed(&get, "KWATCH_TRACE_FRAMES") { cfg.trace_frames = v; }
        if let Some(kind) = get("KWATCH_EVENT_KIND").filter(|s| !s.trim().is_empty()) {
            cfg.event_log_kind = kind.trim().to_string();
        }
        if let Some(raw) = get("KWATCH_THROTTLES") {
            match ThrottleConfig::parse_rules(&raw) {
                Ok(rules) => cfg.throttle.rules = rules,
                Err(e) => warn!(error = %e, "config: invalid KWATCH_THROTTLES; keeping defaults"),
            }
        }
        cfg
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "config: unparseable value; using default");
            None
        }
    }
}
