//! In-RAM application store: materialized resources, an event log, and reported errors.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use kwatch_core::{Action, EventType, RawEvent, ResourceKey, ResourceObject, Severity, StateSnapshot, Store, WatchError};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Event-log entry correlated (when possible) to the resource it describes.
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub event_type: EventType,
    pub event: ResourceObject,
    /// `involvedObject` of the event, if it names one.
    pub involved: Option<ResourceKey>,
    /// Whether `involved` was materialized when the entry arrived.
    pub correlated: bool,
}

#[derive(Debug, Clone)]
pub struct ReportedError {
    pub error: WatchError,
    pub severity: Severity,
    pub message: String,
}

struct Inner {
    epoch: u64,
    /// Epoch of the last resource mutation; snapshots are rebuilt only when it moves.
    resources_epoch: u64,
    published: u64,
    resources: FxHashMap<ResourceKey, ResourceObject>,
    events: VecDeque<EventLogEntry>,
    errors: Vec<ReportedError>,
}

pub struct MemStore {
    inner: Mutex<Inner>,
    snap: ArcSwap<StateSnapshot>,
    epoch_tx: watch::Sender<u64>,
    event_cap: usize,
}

fn involved_key(ev: &RawEvent) -> Option<ResourceKey> {
    let inv = ev.object.raw.get("involvedObject")?;
    let s = |k: &str| inv.get(k).and_then(|v| v.as_str()).map(|s| s.to_string());
    Some(ResourceKey {
        kind: s("kind")?,
        namespace: s("namespace").filter(|n| !n.is_empty()),
        name: s("name")?,
    })
}

impl MemStore {
    /// Keeps at most `event_cap` event-log entries (oldest dropped first).
    pub fn new(event_cap: usize) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            inner: Mutex::new(Inner {
                epoch: 0,
                resources_epoch: 0,
                published: 0,
                resources: FxHashMap::default(),
                events: VecDeque::new(),
                errors: Vec::new(),
            }),
            snap: ArcSwap::from_pointee(StateSnapshot::default()),
            epoch_tx,
            event_cap: event_cap.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last published snapshot; may lag behind unread mutations.
    pub fn current(&self) -> Arc<StateSnapshot> { self.snap.load_full() }

    /// Epoch bumps on every applied mutation.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    pub fn events(&self) -> Vec<EventLogEntry> { self.lock().events.iter().cloned().collect() }

    pub fn errors(&self) -> Vec<ReportedError> { self.lock().errors.clone() }

    fn bump(&self, inner: &mut Inner) {
        inner.epoch = inner.epoch.saturating_add(1);
        self.epoch_tx.send_replace(inner.epoch);
    }
}

impl Default for MemStore {
    fn default() -> Self { Self::new(1000) }
}

impl Store for MemStore {
    fn dispatch(&self, action: Action) {
        let mut inner = self.lock();
        let changes_resources = matches!(action, Action::PutResource { .. } | Action::RemoveResource { .. });
        match action {
            Action::PutResource { object, is_new } => {
                let prev = inner.resources.insert(object.key(), object);
                if is_new && prev.is_some() {
                    debug!("store: ADDED for a resource already present; replaced");
                }
            }
            Action::RemoveResource { object } => {
                inner.resources.remove(&object.key());
            }
            Action::ReceiveEvents { resources, envelope } => {
                let involved = involved_key(&envelope);
                let correlated = involved.as_ref().map(|k| resources.resources.contains_key(k)).unwrap_or(false);
                if inner.events.len() >= self.event_cap {
                    inner.events.pop_front();
                }
                inner.events.push_back(EventLogEntry {
                    event_type: envelope.event_type,
                    event: envelope.object,
                    involved,
                    correlated,
                });
            }
            Action::ReportError { error, severity, message } => {
                warn!(error = %error, ?severity, "store: error reported: {}", message);
                inner.errors.push(ReportedError { error, severity, message });
            }
        }
        self.bump(&mut inner);
        if changes_resources {
            inner.resources_epoch = inner.epoch;
        }
    }

    fn get_state(&self) -> Arc<StateSnapshot> {
        let mut inner = self.lock();
        if inner.published != inner.resources_epoch {
            let next = Arc::new(StateSnapshot { epoch: inner.resources_epoch, resources: inner.resources.clone() });
            self.snap.store(next);
            inner.published = inner.resources_epoch;
        }
        self.snap.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwatch_core::{put_resource, receive_events, remove_resource, report_error};

    fn obj(raw: serde_json::Value) -> ResourceObject { ResourceObject::from_raw(raw).unwrap() }

    fn pod(name: &str) -> ResourceObject {
        obj(serde_json::json!({ "kind": "Pod", "metadata": { "name": name, "namespace": "default" } }))
    }

    #[test]
    fn applies_puts_and_removes() {
        let store = MemStore::default();
        store.dispatch(put_resource(pod("a"), true));
        store.dispatch(put_resource(pod("b"), true));
        store.dispatch(put_resource(pod("a"), false));
        store.dispatch(remove_resource(pod("b")));
        let snap = store.get_state();
        assert_eq!(snap.epoch, 4);
        assert_eq!(snap.resources.len(), 1);
        assert!(snap.resources.contains_key(&pod("a").key()));
        assert_eq!(*store.subscribe_epoch().borrow(), 4);
    }

    #[test]
    fn correlates_event_log_entries() {
        let store = MemStore::new(2);
        store.dispatch(put_resource(pod("a"), true));
        let event = |name: &str, target: &str| RawEvent {
            event_type: EventType::Added,
            object: obj(serde_json::json!({
                "kind": "Event",
                "metadata": { "name": name, "namespace": "default" },
                "involvedObject": { "kind": "Pod", "namespace": "default", "name": target },
            })),
        };
        store.dispatch(receive_events(store.get_state(), event("e1", "a")));
        store.dispatch(receive_events(store.get_state(), event("e2", "ghost")));
        store.dispatch(receive_events(store.get_state(), event("e3", "a")));
        let log = store.events();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].event.name, "e2");
        assert!(!log[0].correlated);
        assert!(log[1].correlated);
        assert_eq!(log[1].involved.as_ref().unwrap().name, "a");
        // event log entries are not materialized as resources
        assert_eq!(store.get_state().resources.len(), 1);
    }

    #[test]
    fn event_log_traffic_reuses_the_published_snapshot() {
        let store = MemStore::default();
        store.dispatch(put_resource(pod("a"), true));
        let first = store.get_state();
        let event = |name: &str| RawEvent {
            event_type: EventType::Added,
            object: obj(serde_json::json!({ "kind": "Event", "metadata": { "name": name, "namespace": "default" } })),
        };
        for name in ["e1", "e2", "e3"] {
            store.dispatch(receive_events(store.get_state(), event(name)));
            assert!(Arc::ptr_eq(&first, &store.get_state()));
        }
        store.dispatch(report_error(WatchError::UnknownKind("X".into()), Severity::Info, "x"));
        assert!(Arc::ptr_eq(&first, &store.get_state()));
        assert_eq!(*store.subscribe_epoch().borrow(), 5);

        store.dispatch(put_resource(pod("b"), true));
        let next = store.get_state();
        assert!(!Arc::ptr_eq(&first, &next));
        assert_eq!(next.epoch, 6);
        assert_eq!(next.resources.len(), 2);
    }

    #[test]
    fn keeps_reported_errors() {
        let store = MemStore::default();
        let err = WatchError::UnknownKind("Widget".into());
        store.dispatch(report_error(err.clone(), Severity::Error, "no such kind"));
        let errs = store.errors();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].error, err);
        assert_eq!(errs[0].severity, Severity::Error);
    }
}
