//! One streaming link to one watch endpoint, with its own fixed-delay retry budget.

use std::sync::Arc;

use futures::StreamExt;
use kwatch_core::{report_error, RawEvent, RetryPolicy, Severity, Store, WatchError, WatchTarget};
use kwatch_kubehub::{Connector, FrameStream, TransportError};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Dialing; `retry` is 0 for the first attempt of a cycle.
    Connecting { retry: u32 },
    Open,
    /// Waiting out the retry delay before attempt number `retry`.
    Backoff { retry: u32 },
    /// Peer closed cleanly, the consumer went away, or the link was closed locally.
    Closed,
    /// Retry budget exhausted; reported once, not retried until reloaded.
    Abandoned,
}

impl ConnState {
    pub fn is_terminal(self) -> bool { matches!(self, ConnState::Closed | ConnState::Abandoned) }
}

/// Shared, read-only inputs of every connection task.
#[derive(Clone)]
pub(crate) struct ConnectionCtx {
    pub connector: Arc<dyn Connector>,
    pub store: Arc<dyn Store>,
    pub retry: RetryPolicy,
    pub trace_frames: bool,
}

pub struct ConnectionHandle {
    url: Url,
    target: WatchTarget,
    state: watch::Receiver<ConnState>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub(crate) fn open(target: WatchTarget, url: Url, ctx: ConnectionCtx, events: mpsc::Sender<RawEvent>) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnState::Connecting { retry: 0 });
        let task = tokio::spawn(run(url.clone(), ctx, events, state_tx));
        Self { url, target, state: state_rx, task: Some(task) }
    }

    pub fn url(&self) -> &Url { &self.url }

    pub fn target(&self) -> &WatchTarget { &self.target }

    pub fn state(&self) -> ConnState {
        if self.task.is_none() { ConnState::Closed } else { *self.state.borrow() }
    }

    /// Still connecting, open, or backing off.
    pub fn is_live(&self) -> bool {
        let running = self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false);
        running && !self.state().is_terminal()
    }

    /// Stop frame processing now. Idempotent.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(url = %self.url, "watch: closed");
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) { self.close(); }
}

enum PumpEnd {
    Closed,
    ConsumerGone,
    Failed(TransportError),
}

async fn pump(url: &Url, mut frames: FrameStream, ctx: &ConnectionCtx, events: &mpsc::Sender<RawEvent>) -> PumpEnd {
    while let Some(item) = frames.next().await {
        let bytes = match item {
            Ok(b) => b,
            Err(e) => return PumpEnd::Failed(e),
        };
        counter!("watch_frames_total", 1u64);
        if ctx.trace_frames {
            info!(url = %url, frame = %String::from_utf8_lossy(&bytes), "watch: frame");
        }
        match RawEvent::parse(&bytes) {
            Ok(ev) => {
                if events.send(ev).await.is_err() {
                    return PumpEnd::ConsumerGone;
                }
            }
            Err(e) => {
                counter!("watch_frames_malformed_total", 1u64);
                debug!(url = %url, error = %e, "watch: skipping malformed frame");
            }
        }
    }
    PumpEnd::Closed
}

async fn run(url: Url, ctx: ConnectionCtx, events: mpsc::Sender<RawEvent>, state: watch::Sender<ConnState>) {
    let mut retry = 0u32;
    loop {
        state.send_replace(ConnState::Connecting { retry });
        counter!("watch_connect_attempts_total", 1u64);
        info!(url = %url, retry, "watch: connecting");
        let failure = match ctx.connector.connect(&url).await {
            Ok(frames) => {
                retry = 0;
                state.send_replace(ConnState::Open);
                info!(url = %url, "watch: open");
                match pump(&url, frames, &ctx, &events).await {
                    PumpEnd::Closed => {
                        info!(url = %url, "watch: stream closed by peer");
                        state.send_replace(ConnState::Closed);
                        return;
                    }
                    PumpEnd::ConsumerGone => {
                        debug!(url = %url, "watch: aggregator gone; closing");
                        state.send_replace(ConnState::Closed);
                        return;
                    }
                    PumpEnd::Failed(e) => e,
                }
            }
            Err(e) => e,
        };
        counter!("watch_connect_failures_total", 1u64);
        if retry >= ctx.retry.max_retries {
            error!(url = %url, retries = retry, error = %failure, "watch: retries exhausted; giving up");
            counter!("watch_retries_exhausted_total", 1u64);
            let err = WatchError::Exhausted { url: url.to_string(), attempts: retry, reason: failure.to_string() };
            ctx.store.dispatch(report_error(err, Severity::Error, format!("Error occurred in watch for {}", url)));
            state.send_replace(ConnState::Abandoned);
            return;
        }
        retry += 1;
        state.send_replace(ConnState::Backoff { retry });
        warn!(url = %url, retry, delay_ms = ctx.retry.delay_ms, error = %failure, "watch: link failed; retrying");
        tokio::time::sleep(ctx.retry.delay()).await;
    }
}
