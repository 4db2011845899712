//! RemoteRef trait abstraction for the hierarchical real-time store.
//!
//! Implementations:
//! - `MemoryRef` (from `InMemoryStore`) - For testing
//! - Bridges to a hosted store live outside this crate and only need to
//!   honour the contract below.
//!
//! Every write is issued synchronously inside the call and acknowledged later
//! through its `OnComplete`. Child and value listeners may fire from inside a
//! write (local echo), so callers must not hold borrows across these calls.

use crate::completion::{self, Completion};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::rc::Rc;
use thiserror::Error;

/// A flat key-value bag, the materialised form of an entity.
pub type Attributes = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Remote error: {0}")]
    Other(String),
}

/// Acknowledgement callback for a write.
pub type OnComplete = Box<dyn FnOnce(Result<(), RemoteError>)>;
/// Continuous value listener.
pub type ValueCallback = Rc<dyn Fn(Snapshot)>;
/// Cancellation listener for continuous subscriptions.
pub type ErrorCallback = Rc<dyn Fn(RemoteError)>;
/// Child listener, receives the child snapshot and the key of its predecessor.
pub type ChildCallback = Rc<dyn Fn(Snapshot, Option<String>)>;

/// Handle returned by a subscription, passed back to `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// The four structural child events a container emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildEvent {
    #[serde(rename = "child_added")]
    Added,
    #[serde(rename = "child_changed")]
    Changed,
    #[serde(rename = "child_moved")]
    Moved,
    #[serde(rename = "child_removed")]
    Removed,
}

/// Immutable point-in-time read of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    key: String,
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<Value>,
}

impl Snapshot {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: Option<Value>) -> Self {
        self.priority = priority.filter(|p| !p.is_null());
        self
    }

    /// Key of the node this snapshot was read from.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Materialised value, `Value::Null` when the node is absent.
    pub fn val(&self) -> &Value {
        &self.value
    }

    pub fn into_val(self) -> Value {
        self.value
    }

    pub fn priority(&self) -> Option<&Value> {
        self.priority.as_ref()
    }

    pub fn exists(&self) -> bool {
        !self.value.is_null()
    }
}

/// Handle to a node in the hierarchical remote store.
pub trait RemoteRef {
    /// Key of this node, `None` for the root.
    fn key(&self) -> Option<String>;

    /// Slash-separated absolute path of this node.
    fn path(&self) -> String;

    /// Navigate to a sub-node.
    fn child(&self, key: &str) -> Rc<dyn RemoteRef>;

    /// Reference to a new child under a freshly generated push-id.
    fn push(&self) -> Rc<dyn RemoteRef>;

    /// One-shot read.
    fn once_value(&self, on_value: Box<dyn FnOnce(Snapshot)>, on_error: Box<dyn FnOnce(RemoteError)>);

    /// Continuous value subscription. Fires once with the current value.
    fn on_value(&self, on_value: ValueCallback, on_error: ErrorCallback) -> ListenerId;

    /// Continuous child subscription. `ChildEvent::Added` replays existing children.
    fn on_child(&self, kind: ChildEvent, callback: ChildCallback) -> ListenerId;

    /// Remove a subscription. Unknown ids are ignored.
    fn off(&self, id: ListenerId);

    /// Destructive write; `Value::Null` deletes the node.
    fn set(&self, value: Value, on_complete: Option<OnComplete>);

    /// Merge write; keys mapped to `null` are deleted.
    fn update(&self, patch: Attributes, on_complete: Option<OnComplete>);

    /// Destructive write that also sets the node's ordering priority.
    fn set_with_priority(&self, value: Value, priority: Value, on_complete: Option<OnComplete>);
}

impl std::fmt::Debug for dyn RemoteRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRef").field("path", &self.path()).finish()
    }
}

/// Turns a url into a `RemoteRef`.
pub trait Connector {
    fn connect(&self, url: &str) -> crate::Result<Rc<dyn RemoteRef>>;
}

/// Bridge a one-shot read into a future.
pub fn read_once(remote: &dyn RemoteRef) -> Completion<Snapshot> {
    let (resolver, completion) = completion::channel();
    let on_error = resolver.clone();
    remote.once_value(
        Box::new(move |snap| resolver.resolve(Ok(snap))),
        Box::new(move |err| on_error.resolve(Err(err.into()))),
    );
    completion
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_accessors() {
        let snap = Snapshot::new("abc", json!({"title": "blah"}));
        assert_eq!(snap.key(), "abc");
        assert!(snap.exists());
        assert_eq!(snap.val()["title"], "blah");
        assert!(snap.priority().is_none());

        let empty = Snapshot::new("gone", Value::Null);
        assert!(!empty.exists());
    }

    #[test]
    fn test_null_priority_is_dropped() {
        let snap = Snapshot::new("a", json!(1)).with_priority(Some(Value::Null));
        assert!(snap.priority().is_none());

        let snap = Snapshot::new("a", json!(1)).with_priority(Some(json!(14)));
        assert_eq!(snap.priority(), Some(&json!(14)));
    }

    #[test]
    fn test_child_event_serialization() {
        let json = serde_json::to_string(&ChildEvent::Added).unwrap();
        assert_eq!(json, "\"child_added\"");
        let parsed: ChildEvent = serde_json::from_str("\"child_removed\"").unwrap();
        assert_eq!(parsed, ChildEvent::Removed);
    }
}
