//! Store boundary: the actions the engine emits and the store interface it consumes.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{RawEvent, ResourceKey, ResourceObject, WatchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Mutations the engine requests from the store.
#[derive(Debug, Clone)]
pub enum Action {
    PutResource { object: ResourceObject, is_new: bool },
    RemoveResource { object: ResourceObject },
    /// Event-log entry, with the resources materialized at dispatch time for correlation.
    ReceiveEvents { resources: Arc<StateSnapshot>, envelope: RawEvent },
    ReportError { error: WatchError, severity: Severity, message: String },
}

pub fn put_resource(object: ResourceObject, is_new: bool) -> Action {
    Action::PutResource { object, is_new }
}

pub fn remove_resource(object: ResourceObject) -> Action {
    Action::RemoveResource { object }
}

pub fn receive_events(resources: Arc<StateSnapshot>, envelope: RawEvent) -> Action {
    Action::ReceiveEvents { resources, envelope }
}

pub fn report_error(error: WatchError, severity: Severity, message: impl Into<String>) -> Action {
    Action::ReportError { error, severity, message: message.into() }
}

/// Read view of the store's materialized state.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    /// Store epoch at the last resource mutation.
    pub epoch: u64,
    pub resources: FxHashMap<ResourceKey, ResourceObject>,
}

/// The application state store, as seen by the engine.
///
/// `dispatch` is fire-and-forget: the engine never waits on or retries a store-side failure.
pub trait Store: Send + Sync {
    fn dispatch(&self, action: Action);
    fn get_state(&self) -> Arc<StateSnapshot>;
}
