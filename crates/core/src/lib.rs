//! kwatch core types: watch targets, wire events and the error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod action;
pub mod config;

pub use action::{
    put_resource, receive_events, remove_resource, report_error, Action, Severity, StateSnapshot, Store,
};
pub use config::{EngineConfig, RetryPolicy, ThrottleConfig, ThrottleRule};

/// Addressing data for one resource kind, as served by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct KindDescriptor {
    pub kind: String,
    /// API base path without surrounding slashes, e.g. `api/v1` or `apis/apps/v1`.
    pub base_path: String,
    pub plural: String,
}

/// Lookup of resource kinds by their kind name (e.g. `Pod`).
pub trait KindCatalog: Send + Sync {
    fn lookup(&self, kind: &str) -> Option<KindDescriptor>;

    /// All kinds known to the catalog, in a stable order.
    fn kinds(&self) -> Vec<KindDescriptor>;
}

/// Namespace half of a watch target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamespaceScope {
    All,
    Named(String),
}

impl NamespaceScope {
    /// `""` and `"*"` both select every namespace.
    pub fn parse(ns: &str) -> Self {
        let ns = ns.trim();
        if ns.is_empty() || ns == "*" {
            NamespaceScope::All
        } else {
            NamespaceScope::Named(ns.to_string())
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            NamespaceScope::All => None,
            NamespaceScope::Named(ns) => Some(ns.as_str()),
        }
    }
}

impl fmt::Display for NamespaceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceScope::All => f.write_str("*"),
            NamespaceScope::Named(ns) => f.write_str(ns),
        }
    }
}

/// Expand a caller's namespace selection into distinct scopes, preserving order.
/// An empty selection watches all namespaces.
pub fn scopes_for<S: AsRef<str>>(namespaces: &[S]) -> SmallVec<[NamespaceScope; 4]> {
    let mut out: SmallVec<[NamespaceScope; 4]> = SmallVec::new();
    for ns in namespaces {
        let scope = NamespaceScope::parse(ns.as_ref());
        if !out.contains(&scope) {
            out.push(scope);
        }
    }
    if out.is_empty() {
        out.push(NamespaceScope::All);
    }
    out
}

/// Opaque cursor into a change history. `"0"` means "from now".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceVersion(pub String);

impl Default for ResourceVersion {
    fn default() -> Self { ResourceVersion("0".to_string()) }
}

impl From<u64> for ResourceVersion {
    fn from(v: u64) -> Self { ResourceVersion(v.to_string()) }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self {
        if v.trim().is_empty() { ResourceVersion::default() } else { ResourceVersion(v.trim().to_string()) }
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// One subscription: a kind in one namespace scope, starting at a resource version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchTarget {
    pub kind: KindDescriptor,
    pub namespace: NamespaceScope,
    pub from_version: ResourceVersion,
}

/// Watch event tag. Anything other than the three mutation tags is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Unrecognized(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Unrecognized(s) => s.as_str(),
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "ADDED" => EventType::Added,
            "MODIFIED" => EventType::Modified,
            "DELETED" => EventType::Deleted,
            other => EventType::Unrecognized(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self { EventType::from(s.as_str()) }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self { t.as_str().to_string() }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Identity of a materialized resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace.as_deref().unwrap_or(""), self.kind, self.name)
    }
}

/// Resource object embedded in a watch event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    /// Unix seconds of the last change seen on the object (0 when unknown).
    pub last_change_ts: i64,
    pub raw: serde_json::Value,
}

impl ResourceObject {
    pub fn from_raw(raw: serde_json::Value) -> Result<Self, FrameError> {
        if !raw.is_object() {
            return Err(FrameError::NotAnObject);
        }
        let str_at = |v: Option<&serde_json::Value>| v.and_then(|v| v.as_str()).map(|s| s.to_string());
        let meta = raw.get("metadata");
        let kind = str_at(raw.get("kind")).unwrap_or_default();
        let namespace = str_at(meta.and_then(|m| m.get("namespace"))).filter(|s| !s.is_empty());
        let name = str_at(meta.and_then(|m| m.get("name"))).unwrap_or_default();
        // Event objects carry lastTimestamp/eventTime; everything else falls back to creation.
        let last_change_ts = [
            raw.get("lastTimestamp"),
            raw.get("eventTime"),
            meta.and_then(|m| m.get("creationTimestamp")),
        ]
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
        .find_map(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0);
        Ok(Self { kind, namespace, name, last_change_ts, raw })
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey { kind: self.kind.clone(), namespace: self.namespace.clone(), name: self.name.clone() }
    }
}

/// A decoded watch frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_type: EventType,
    pub object: ResourceObject,
}

#[derive(Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    event_type: EventType,
    object: Option<serde_json::Value>,
}

impl RawEvent {
    /// Decode one frame payload (`{"type": "...", "object": {...}}`).
    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        let wire: WireEvent = serde_json::from_slice(frame)?;
        let object = wire.object.ok_or(FrameError::MissingObject)?;
        Ok(RawEvent { event_type: wire.event_type, object: ResourceObject::from_raw(object)? })
    }
}

/// Per-frame decoding failure. Never fatal for the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no object")]
    MissingObject,
    #[error("frame object is not a json object")]
    NotAnObject,
}

/// Errors that cross the engine boundary (always via the store).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum WatchError {
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),
    #[error("watch for {url} abandoned after {attempts} retries: {reason}")]
    Exhausted { url: String, attempts: u32, reason: String },
    #[error("watch transport for {url}: {reason}")]
    Transport { url: String, reason: String },
    #[error("catalog: {0}")]
    Catalog(String),
}

pub mod prelude {
    pub use super::{
        Action, EngineConfig, EventType, KindCatalog, KindDescriptor, NamespaceScope, RawEvent, ResourceKey,
        ResourceObject, ResourceVersion, Severity, StateSnapshot, Store, WatchError, WatchTarget,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_added_frame() {
        let frame = br#"{"type":"ADDED","object":{"kind":"Pod","metadata":{"name":"web-0","namespace":"default","creationTimestamp":"2020-01-01T00:00:00Z"}}}"#;
        let ev = RawEvent::parse(frame).unwrap();
        assert_eq!(ev.event_type, EventType::Added);
        assert_eq!(ev.object.kind, "Pod");
        assert_eq!(ev.object.namespace.as_deref(), Some("default"));
        assert_eq!(ev.object.name, "web-0");
        assert_eq!(ev.object.last_change_ts, 1_577_836_800);
    }

    #[test]
    fn event_objects_prefer_last_timestamp() {
        let frame = br#"{"type":"ADDED","object":{"kind":"Event","lastTimestamp":"2020-01-01T00:01:00Z","metadata":{"name":"e","namespace":"ns","creationTimestamp":"2020-01-01T00:00:00Z"}}}"#;
        let ev = RawEvent::parse(frame).unwrap();
        assert_eq!(ev.object.last_change_ts, 1_577_836_860);
    }

    #[test]
    fn unknown_tags_are_kept() {
        let ev = RawEvent::parse(br#"{"type":"BOOKMARK","object":{"kind":"Pod","metadata":{}}}"#).unwrap();
        assert_eq!(ev.event_type, EventType::Unrecognized("BOOKMARK".into()));
        assert_eq!(ev.object.name, "");
        assert_eq!(ev.object.namespace, None);
    }

    #[test]
    fn malformed_frames_fail() {
        assert!(matches!(RawEvent::parse(b"not json"), Err(FrameError::Json(_))));
        assert!(matches!(RawEvent::parse(br#"{"type":"ADDED"}"#), Err(FrameError::MissingObject)));
        assert!(matches!(RawEvent::parse(br#"{"type":"ADDED","object":3}"#), Err(FrameError::NotAnObject)));
    }

    #[test]
    fn namespace_selection_defaults_to_all() {
        let none: [&str; 0] = [];
        assert_eq!(scopes_for(&none).as_slice(), &[NamespaceScope::All]);
        let sel = scopes_for(&["a", "*", "a", " b "]);
        assert_eq!(
            sel.as_slice(),
            &[NamespaceScope::Named("a".into()), NamespaceScope::All, NamespaceScope::Named("b".into())]
        );
    }
}
