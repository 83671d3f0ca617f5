//! kwatch kubehub: watch endpoint addressing, transports and kind catalogs

#![forbid(unsafe_code)]

use std::time::Duration;

use futures::stream::BoxStream;
use futures::{future, StreamExt};
use kwatch_core::WatchTarget;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;
use url::Url;

pub mod catalog;

pub use catalog::{DiscoveryCatalog, StaticCatalog};

/// The page (or proxy) the watches are served through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub host: String,
    /// Page served over https; selects `wss`.
    pub secure: bool,
}

impl Origin {
    pub fn scheme(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }
}

/// Build the proxied watch URL for a target:
/// `<scheme>://<host>/proxy/<base>/[namespaces/<ns>/]<plural>?watch=true&resourceVersion=<v>`.
pub fn watch_url(origin: &Origin, target: &WatchTarget) -> Result<Url, TransportError> {
    let bad = |reason: String| TransportError::InvalidUrl { host: origin.host.clone(), reason };
    let mut url = Url::parse(&format!("{}://{}/", origin.scheme(), origin.host)).map_err(|e| bad(e.to_string()))?;
    {
        let mut segs = url.path_segments_mut().map_err(|_| bad("url cannot carry a path".into()))?;
        segs.pop_if_empty();
        segs.push("proxy");
        segs.extend(target.kind.base_path.split('/').filter(|s| !s.is_empty()));
        if let Some(ns) = target.namespace.name() {
            segs.push("namespaces");
            segs.push(ns);
        }
        segs.push(&target.kind.plural);
    }
    url.query_pairs_mut()
        .append_pair("watch", "true")
        .append_pair("resourceVersion", &target.from_version.0);
    Ok(url)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid watch url for host {host:?}: {reason}")]
    InvalidUrl { host: String, reason: String },
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake rejected with http status {status}")]
    Handshake { status: u16 },
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("stream error: {0}")]
    Stream(String),
}

/// Inbound frame payloads. The stream ends when the peer closes cleanly;
/// an `Err` item means the link failed.
pub type FrameStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Opens streaming links to watch endpoints.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<FrameStream, TransportError>;
}

/// Websocket connector (tokio-tungstenite). Ping/pong is answered by the transport.
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new() -> Self { Self { connect_timeout: Duration::from_secs(10) } }

    pub fn with_timeout(connect_timeout: Duration) -> Self { Self { connect_timeout } }
}

impl Default for WsConnector {
    fn default() -> Self { Self::new() }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<FrameStream, TransportError> {
        let dial = tokio_tungstenite::connect_async(url.as_str());
        let (ws, resp) = match tokio::time::timeout(self.connect_timeout, dial).await {
            Err(_) => return Err(TransportError::Timeout(self.connect_timeout)),
            Ok(Err(tungstenite::Error::Http(resp))) => {
                return Err(TransportError::Handshake { status: resp.status().as_u16() })
            }
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Ok(Ok(pair)) => pair,
        };
        debug!(url = %url, status = resp.status().as_u16(), "transport: websocket upgraded");
        let frames = ws
            .take_while(|m| future::ready(!matches!(m, Ok(Message::Close(_)))))
            .filter_map(|m| {
                future::ready(match m {
                    Ok(Message::Text(t)) => Some(Ok(t.as_bytes().to_vec())),
                    Ok(Message::Binary(b)) => Some(Ok(b.to_vec())),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::Stream(e.to_string()))),
                })
            });
        Ok(frames.boxed())
    }
}
