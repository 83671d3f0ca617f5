//! kwatch engine: per-kind, per-namespace watch subscriptions feeding one ordered,
//! throttled, batched change feed into the application store.
//!
//! All operations are synchronous and infallible from the caller's side; they spawn
//! tokio tasks and must be called from within a runtime. Failures are reported
//! asynchronously through [`Store::dispatch`] as `ReportError` actions.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kwatch_core::{
    report_error, scopes_for, EngineConfig, KindCatalog, RawEvent, ResourceVersion, Severity, Store, WatchError,
    WatchTarget,
};
use kwatch_kubehub::{watch_url, Connector, Origin};
use kwatch_store::{spawn_aggregator, AggregatorHandle, DispatchBridge, EventThrottle};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

mod connection;

pub use connection::{ConnState, ConnectionHandle};
use connection::ConnectionCtx;

/// Parameters of the last `start`, replayed by `reset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartParams {
    pub kind: String,
    pub namespaces: Vec<String>,
    pub from_version: ResourceVersion,
    pub tick_interval: Option<Duration>,
}

pub struct WatchEngine {
    config: EngineConfig,
    origin: Origin,
    catalog: Arc<dyn KindCatalog>,
    store: Arc<dyn Store>,
    connector: Arc<dyn Connector>,
    params: Option<StartParams>,
    aggregator: Option<AggregatorHandle>,
    /// Keyed by watch URL; at most one connection per target.
    connections: FxHashMap<String, ConnectionHandle>,
}

impl WatchEngine {
    pub fn new(
        origin: Origin,
        catalog: Arc<dyn KindCatalog>,
        store: Arc<dyn Store>,
        connector: Arc<dyn Connector>,
        config: EngineConfig,
    ) -> Self {
        Self {
            config,
            origin,
            catalog,
            store,
            connector,
            params: None,
            aggregator: None,
            connections: FxHashMap::default(),
        }
    }

    /// Open one watch per namespace (one wildcard watch when `namespaces` is empty).
    /// Targets that already have a live connection are left alone.
    pub fn start<S: AsRef<str>>(
        &mut self,
        kind: &str,
        namespaces: &[S],
        from_version: impl Into<ResourceVersion>,
        tick_interval: Option<Duration>,
    ) {
        let params = StartParams {
            kind: kind.to_string(),
            namespaces: namespaces.iter().map(|s| s.as_ref().to_string()).collect(),
            from_version: from_version.into(),
            tick_interval,
        };
        self.start_with(params);
    }

    fn start_with(&mut self, params: StartParams) {
        if self.params.as_ref().map(|p| p.kind != params.kind).unwrap_or(false) {
            info!(from = %self.params.as_ref().map(|p| p.kind.as_str()).unwrap_or(""), to = %params.kind, "watch: kind changed; tearing down");
            self.stop();
        }
        self.params = Some(params.clone());

        let Some(kind) = self.catalog.lookup(&params.kind) else {
            warn!(kind = %params.kind, "watch: kind not in catalog");
            let err = WatchError::UnknownKind(params.kind.clone());
            self.store.dispatch(report_error(err, Severity::Error, format!("Cannot watch unknown kind {}", params.kind)));
            return;
        };

        let scopes = scopes_for(&params.namespaces);
        info!(kind = %kind.kind, targets = scopes.len(), rv = %params.from_version, "watch: start");
        for namespace in scopes {
            let target = WatchTarget { kind: kind.clone(), namespace, from_version: params.from_version.clone() };
            let Some(url) = self.url_or_report(&target) else { continue };
            if self.connections.get(url.as_str()).map(|c| c.is_live()).unwrap_or(false) {
                debug!(url = %url, "watch: already open");
                continue;
            }
            self.open(target, url);
        }
    }

    /// Cancel the aggregation timer, then close every connection. Safe to repeat.
    pub fn stop(&mut self) {
        if let Some(mut agg) = self.aggregator.take() {
            agg.stop();
        }
        let n = self.connections.len();
        for (_, mut conn) in self.connections.drain() {
            conn.close();
        }
        if n > 0 {
            info!(closed = n, "watch: stopped");
        }
    }

    /// `stop` followed by `start` with the last parameters.
    pub fn reset(&mut self) {
        self.stop();
        if let Some(params) = self.params.clone() {
            self.start_with(params);
        }
    }

    /// Replace the connection for one target with a fresh one (retry budget reset).
    /// Sibling targets are untouched.
    pub fn reload(&mut self, target: &WatchTarget) {
        let Some(url) = self.url_or_report(target) else { return };
        info!(url = %url, "watch: reload");
        self.open(target.clone(), url);
    }

    pub fn targets(&self) -> Vec<WatchTarget> {
        let mut out: Vec<WatchTarget> = self.connections.values().map(|c| c.target().clone()).collect();
        out.sort_by(|a, b| a.namespace.to_string().cmp(&b.namespace.to_string()));
        out
    }

    pub fn state(&self, target: &WatchTarget) -> Option<ConnState> {
        let url = watch_url(&self.origin, target).ok()?;
        self.connections.get(url.as_str()).map(|c| c.state())
    }

    pub fn params(&self) -> Option<&StartParams> { self.params.as_ref() }

    fn url_or_report(&self, target: &WatchTarget) -> Option<url::Url> {
        match watch_url(&self.origin, target) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(error = %e, "watch: cannot address target");
                let err = WatchError::Transport { url: self.origin.host.clone(), reason: e.to_string() };
                self.store.dispatch(report_error(err, Severity::Error, e.to_string()));
                None
            }
        }
    }

    fn events_sender(&mut self) -> mpsc::Sender<RawEvent> {
        if let Some(agg) = self.aggregator.as_ref().filter(|a| a.is_running()) {
            return agg.sender();
        }
        let tick = self.params.as_ref().and_then(|p| p.tick_interval).unwrap_or_else(|| self.config.tick_interval());
        let bridge = DispatchBridge::new(self.store.clone(), self.config.event_log_kind.clone());
        let throttle = EventThrottle::new(&self.config.throttle, Instant::now());
        let agg = spawn_aggregator(bridge, throttle, tick, self.config.queue_cap);
        let tx = agg.sender();
        self.aggregator = Some(agg);
        tx
    }

    fn open(&mut self, target: WatchTarget, url: url::Url) {
        if let Some(mut old) = self.connections.remove(url.as_str()) {
            old.close();
        }
        let events = self.events_sender();
        let ctx = ConnectionCtx {
            connector: self.connector.clone(),
            store: self.store.clone(),
            retry: self.config.retry,
            trace_frames: self.config.trace_frames,
        };
        let conn = ConnectionHandle::open(target, url.clone(), ctx, events);
        self.connections.insert(url.to_string(), conn);
    }
}

impl Drop for WatchEngine {
    fn drop(&mut self) { self.stop(); }
}
