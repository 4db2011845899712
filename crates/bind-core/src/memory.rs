//! In-memory hierarchical store for testing.
//!
//! Behaves like the hosted real-time store as far as the binding layer can
//! observe: nulls and empty objects are pruned, listeners registered on a
//! node get the current state replayed immediately, and every write raises
//! its child/value events synchronously (local echo) before the write's
//! completion callback runs.

use crate::config::compare_priority;
use crate::error::{BindError, Result};
use crate::push_id::PushIdGenerator;
use crate::remote::{
    Attributes, ChildCallback, ChildEvent, Connector, ErrorCallback, ListenerId, OnComplete,
    RemoteError, RemoteRef, Snapshot, ValueCallback,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// A write as issued by a client, recorded whether or not it succeeded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WriteOp {
    Set {
        path: String,
        value: Value,
    },
    Update {
        path: String,
        patch: Attributes,
    },
    SetWithPriority {
        path: String,
        value: Value,
        priority: Value,
    },
}

impl WriteOp {
    pub fn path(&self) -> &str {
        match self {
            WriteOp::Set { path, .. }
            | WriteOp::Update { path, .. }
            | WriteOp::SetWithPriority { path, .. } => path,
        }
    }
}

/// Shared in-memory store. Clones share the same tree.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Rc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    root: RefCell<Value>,
    /// Node priorities keyed by absolute path.
    priorities: RefCell<HashMap<String, Value>>,
    listeners: RefCell<Vec<Listener>>,
    next_listener: Cell<u64>,
    push_ids: RefCell<PushIdGenerator>,
    write_failure: RefCell<Option<RemoteError>>,
    read_failure: RefCell<Option<RemoteError>>,
    writes: RefCell<Vec<WriteOp>>,
}

#[derive(Clone)]
struct Listener {
    id: ListenerId,
    path: Vec<String>,
    kind: ListenerKind,
}

#[derive(Clone)]
enum ListenerKind {
    Value {
        on_value: ValueCallback,
        on_error: ErrorCallback,
    },
    Child {
        event: ChildEvent,
        callback: ChildCallback,
    },
}

/// A child as seen by a listener: key, value, priority.
type ChildEntry = (String, Value, Option<Value>);

/// State captured for one listener before a write.
enum Observed {
    Value(Value),
    Children(Vec<ChildEntry>),
}

enum Delivery {
    Value(ValueCallback, Snapshot),
    Child(ChildCallback, Snapshot, Option<String>),
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference to the node at a slash-separated path.
    pub fn at(&self, path: &str) -> Rc<dyn RemoteRef> {
        Rc::new(MemoryRef {
            store: Rc::clone(&self.inner),
            path: split_path(path),
        })
    }

    pub fn root(&self) -> Rc<dyn RemoteRef> {
        self.at("/")
    }

    /// Current value at a path, `Value::Null` when absent.
    pub fn value_at(&self, path: &str) -> Value {
        self.inner.value_at(&split_path(path))
    }

    pub fn priority_at(&self, path: &str) -> Option<Value> {
        self.inner
            .priorities
            .borrow()
            .get(&join_path(&split_path(path)))
            .cloned()
    }

    /// Every write issued so far, failed ones included.
    pub fn writes(&self) -> Vec<WriteOp> {
        self.inner.writes.borrow().clone()
    }

    pub fn clear_writes(&self) {
        self.inner.writes.borrow_mut().clear();
    }

    /// Make every following write fail with `err` (or succeed again with `None`).
    pub fn fail_writes(&self, err: Option<RemoteError>) {
        *self.inner.write_failure.borrow_mut() = err;
    }

    /// Make every following read and value subscription fail with `err`.
    ///
    /// Live value subscriptions are cancelled through their error callback,
    /// as a hosted store does when read access is revoked.
    pub fn fail_reads(&self, err: Option<RemoteError>) {
        *self.inner.read_failure.borrow_mut() = err.clone();
        let Some(err) = err else {
            return;
        };
        let cancelled: Vec<ErrorCallback> = {
            let mut listeners = self.inner.listeners.borrow_mut();
            let mut cancelled = Vec::new();
            listeners.retain(|listener| match &listener.kind {
                ListenerKind::Value { on_error, .. } => {
                    cancelled.push(Rc::clone(on_error));
                    false
                }
                ListenerKind::Child { .. } => true,
            });
            cancelled
        };
        debug!(count = cancelled.len(), "cancelling value listeners");
        for on_error in cancelled {
            on_error(err.clone());
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// Deliver a child event without touching the tree, as a hosted store
    /// would when events for a container arrive out of order.
    pub fn emit_child(&self, path: &str, event: ChildEvent, snapshot: Snapshot) {
        let path = split_path(path);
        let targets: Vec<_> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .filter_map(|l| match &l.kind {
                ListenerKind::Child { event: e, callback } if *e == event && l.path == path => {
                    Some(Rc::clone(callback))
                }
                _ => None,
            })
            .collect();
        for callback in targets {
            callback(snapshot.clone(), None);
        }
    }
}

impl Connector for InMemoryStore {
    fn connect(&self, url: &str) -> Result<Rc<dyn RemoteRef>> {
        Ok(self.at(&path_from_url(url)?))
    }
}

impl StoreInner {
    fn value_at(&self, path: &[String]) -> Value {
        let root = self.root.borrow();
        let mut node = &*root;
        for segment in path {
            match node.get(segment.as_str()) {
                Some(child) => node = child,
                None => return Value::Null,
            }
        }
        node.clone()
    }

    fn snapshot_at(&self, path: &[String]) -> Snapshot {
        let key = path.last().cloned().unwrap_or_default();
        let priority = self.priorities.borrow().get(&join_path(path)).cloned();
        Snapshot::new(key, self.value_at(path)).with_priority(priority)
    }

    /// Children of a node in (priority, key) order.
    fn children_at(&self, path: &[String]) -> Vec<ChildEntry> {
        let Value::Object(map) = self.value_at(path) else {
            return Vec::new();
        };
        let priorities = self.priorities.borrow();
        let mut children: Vec<ChildEntry> = map
            .into_iter()
            .map(|(key, value)| {
                let mut child_path = path.to_vec();
                child_path.push(key.clone());
                let priority = priorities.get(&join_path(&child_path)).cloned();
                (key, value, priority)
            })
            .collect();
        children.sort_by(|a, b| {
            compare_priority(a.2.as_ref(), b.2.as_ref()).then_with(|| a.0.cmp(&b.0))
        });
        children
    }

    fn register(&self, path: Vec<String>, kind: ListenerKind) -> ListenerId {
        let id = ListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        self.listeners.borrow_mut().push(Listener { id, path, kind });
        id
    }

    fn is_registered(&self, id: ListenerId) -> bool {
        self.listeners.borrow().iter().any(|l| l.id == id)
    }

    fn observe(&self, listeners: &[Listener]) -> Vec<Observed> {
        listeners
            .iter()
            .map(|l| match l.kind {
                ListenerKind::Value { .. } => Observed::Value(self.value_at(&l.path)),
                ListenerKind::Child { .. } => Observed::Children(self.children_at(&l.path)),
            })
            .collect()
    }

    /// Run a mutation, then raise the events it caused.
    fn write(&self, op: WriteOp, on_complete: Option<OnComplete>, mutate: impl FnOnce(&Self)) {
        debug!(path = op.path(), "memory store write");
        self.writes.borrow_mut().push(op);

        let failure = self.write_failure.borrow().clone();
        if let Some(err) = failure {
            if let Some(cb) = on_complete {
                cb(Err(err));
            }
            return;
        }

        let listeners = self.listeners.borrow().clone();
        let before = self.observe(&listeners);
        mutate(self);
        self.drop_orphaned_priorities();
        let after = self.observe(&listeners);

        let mut deliveries: Vec<(u8, ListenerId, Delivery)> = Vec::new();
        for ((listener, old), new) in listeners.iter().zip(before).zip(after) {
            match (&listener.kind, old, new) {
                (ListenerKind::Value { on_value, .. }, Observed::Value(old), Observed::Value(new)) => {
                    if old != new {
                        deliveries.push((
                            4,
                            listener.id,
                            Delivery::Value(Rc::clone(on_value), self.snapshot_at(&listener.path)),
                        ));
                    }
                }
                (
                    ListenerKind::Child { event, callback },
                    Observed::Children(old),
                    Observed::Children(new),
                ) => {
                    for (snapshot, prev) in child_changes(*event, &old, &new) {
                        deliveries.push((
                            rank(*event),
                            listener.id,
                            Delivery::Child(Rc::clone(callback), snapshot, prev),
                        ));
                    }
                }
                _ => {}
            }
        }

        // Removed, added, moved, changed, then value.
        deliveries.sort_by_key(|(rank, _, _)| *rank);
        for (_, id, delivery) in deliveries {
            if !self.is_registered(id) {
                continue;
            }
            match delivery {
                Delivery::Value(cb, snap) => cb(snap),
                Delivery::Child(cb, snap, prev) => cb(snap, prev),
            }
        }

        if let Some(cb) = on_complete {
            cb(Ok(()));
        }
    }

    fn put(&self, path: &[String], value: Value) {
        let prefix = join_path(path);
        self.priorities
            .borrow_mut()
            .retain(|p, _| !is_same_or_descendant(p, &prefix));
        write_at(&mut self.root.borrow_mut(), path, normalize(value));
    }

    fn drop_orphaned_priorities(&self) {
        let paths: Vec<String> = self.priorities.borrow().keys().cloned().collect();
        for path in paths {
            if self.value_at(&split_path(&path)).is_null() {
                self.priorities.borrow_mut().remove(&path);
            }
        }
    }
}

/// Events of one kind raised by the transition `old` -> `new`.
fn child_changes(
    event: ChildEvent,
    old: &[ChildEntry],
    new: &[ChildEntry],
) -> Vec<(Snapshot, Option<String>)> {
    let old_by_key: HashMap<&str, &ChildEntry> = old.iter().map(|c| (c.0.as_str(), c)).collect();
    let new_keys: HashMap<&str, usize> = new.iter().enumerate().map(|(i, c)| (c.0.as_str(), i)).collect();
    let prev_of = |index: usize| index.checked_sub(1).map(|i| new[i].0.clone());
    let snap = |c: &ChildEntry| Snapshot::new(c.0.clone(), c.1.clone()).with_priority(c.2.clone());

    match event {
        ChildEvent::Removed => old
            .iter()
            .filter(|c| !new_keys.contains_key(c.0.as_str()))
            .map(|c| (snap(c), None))
            .collect(),
        ChildEvent::Added => new
            .iter()
            .enumerate()
            .filter(|(_, c)| !old_by_key.contains_key(c.0.as_str()))
            .map(|(i, c)| (snap(c), prev_of(i)))
            .collect(),
        ChildEvent::Moved => new
            .iter()
            .enumerate()
            .filter(|(_, c)| old_by_key.get(c.0.as_str()).is_some_and(|o| o.2 != c.2))
            .map(|(i, c)| (snap(c), prev_of(i)))
            .collect(),
        ChildEvent::Changed => new
            .iter()
            .enumerate()
            .filter(|(_, c)| old_by_key.get(c.0.as_str()).is_some_and(|o| o.1 != c.1))
            .map(|(i, c)| (snap(c), prev_of(i)))
            .collect(),
    }
}

fn rank(event: ChildEvent) -> u8 {
    match event {
        ChildEvent::Removed => 0,
        ChildEvent::Added => 1,
        ChildEvent::Moved => 2,
        ChildEvent::Changed => 3,
    }
}

/// Strip nulls and collapse empty objects, as the hosted store does.
fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if cleaned.is_empty() {
                Value::Null
            } else {
                Value::Object(cleaned)
            }
        }
        other => other,
    }
}

fn write_at(node: &mut Value, path: &[String], value: Value) {
    let Some((head, rest)) = path.split_first() else {
        *node = value;
        return;
    };

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let mut now_empty = false;
    if let Value::Object(map) = node {
        let mut child = map.remove(head).unwrap_or(Value::Null);
        write_at(&mut child, rest, value);
        if !child.is_null() {
            map.insert(head.clone(), child);
        }
        now_empty = map.is_empty();
    }
    if now_empty {
        *node = Value::Null;
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_path(path: &[String]) -> String {
    format!("/{}", path.join("/"))
}

fn is_same_or_descendant(candidate: &str, prefix: &str) -> bool {
    candidate == prefix
        || prefix == "/"
        || candidate
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// `mem://todos/list` and `https://host.example.com/todos/list` both map to
/// `/todos/list`; a bare path is taken as is.
fn path_from_url(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(BindError::InvalidUrl("empty url".into()));
    }
    match url.split_once("://") {
        Some(("mem", rest)) => Ok(rest.trim_matches('/').to_string()),
        Some((_, rest)) => Ok(rest.split_once('/').map(|(_, p)| p).unwrap_or("").to_string()),
        None => Ok(url.to_string()),
    }
}

/// `RemoteRef` into an `InMemoryStore`.
pub struct MemoryRef {
    store: Rc<StoreInner>,
    path: Vec<String>,
}

impl MemoryRef {
    fn child_path(&self, key: &str) -> Vec<String> {
        let mut path = self.path.clone();
        path.extend(split_path(key));
        path
    }

    fn read_failure(&self) -> Option<RemoteError> {
        self.store.read_failure.borrow().clone()
    }
}

impl RemoteRef for MemoryRef {
    fn key(&self) -> Option<String> {
        self.path.last().cloned()
    }

    fn path(&self) -> String {
        join_path(&self.path)
    }

    fn child(&self, key: &str) -> Rc<dyn RemoteRef> {
        Rc::new(MemoryRef {
            store: Rc::clone(&self.store),
            path: self.child_path(key),
        })
    }

    fn push(&self) -> Rc<dyn RemoteRef> {
        let id = self.store.push_ids.borrow_mut().next_id();
        self.child(id.as_str())
    }

    fn once_value(&self, on_value: Box<dyn FnOnce(Snapshot)>, on_error: Box<dyn FnOnce(RemoteError)>) {
        match self.read_failure() {
            Some(err) => on_error(err),
            None => on_value(self.store.snapshot_at(&self.path)),
        }
    }

    fn on_value(&self, on_value: ValueCallback, on_error: ErrorCallback) -> ListenerId {
        if let Some(err) = self.read_failure() {
            // Cancelled subscriptions are never registered.
            let id = ListenerId(self.store.next_listener.get());
            self.store.next_listener.set(id.0 + 1);
            on_error(err);
            return id;
        }
        let id = self.store.register(
            self.path.clone(),
            ListenerKind::Value {
                on_value: Rc::clone(&on_value),
                on_error,
            },
        );
        on_value(self.store.snapshot_at(&self.path));
        id
    }

    fn on_child(&self, kind: ChildEvent, callback: ChildCallback) -> ListenerId {
        let id = self.store.register(
            self.path.clone(),
            ListenerKind::Child {
                event: kind,
                callback: Rc::clone(&callback),
            },
        );
        if kind == ChildEvent::Added && self.read_failure().is_none() {
            let mut prev: Option<String> = None;
            for (key, value, priority) in self.store.children_at(&self.path) {
                if !self.store.is_registered(id) {
                    break;
                }
                callback(Snapshot::new(key.clone(), value).with_priority(priority), prev.clone());
                prev = Some(key);
            }
        }
        id
    }

    fn off(&self, id: ListenerId) {
        self.store.listeners.borrow_mut().retain(|l| l.id != id);
    }

    fn set(&self, value: Value, on_complete: Option<OnComplete>) {
        let path = self.path.clone();
        let op = WriteOp::Set {
            path: self.path(),
            value: value.clone(),
        };
        self.store.write(op, on_complete, move |store| store.put(&path, value));
    }

    fn update(&self, patch: Attributes, on_complete: Option<OnComplete>) {
        let base = self.path.clone();
        let op = WriteOp::Update {
            path: self.path(),
            patch: patch.clone(),
        };
        self.store.write(op, on_complete, move |store| {
            for (key, value) in patch {
                let mut path = base.clone();
                path.extend(split_path(&key));
                store.put(&path, value);
            }
        });
    }

    fn set_with_priority(&self, value: Value, priority: Value, on_complete: Option<OnComplete>) {
        let path = self.path.clone();
        let op = WriteOp::SetWithPriority {
            path: self.path(),
            value: value.clone(),
            priority: priority.clone(),
        };
        self.store.write(op, on_complete, move |store| {
            store.put(&path, value);
            if !priority.is_null() && !store.value_at(&path).is_null() {
                store.priorities.borrow_mut().insert(join_path(&path), priority);
            }
        });
    }
}
