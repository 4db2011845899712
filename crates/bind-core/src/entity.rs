//! Entity: an observable key-value bag with an identity attribute.
//!
//! This is the substrate the mirrors drive. It knows nothing about the remote
//! store: it stores attributes, reports exactly what each `set` changed, and
//! carries the two pieces of per-entity sync state (the remote baseline used
//! for diffing and the current `SyncPhase`).

use crate::completion::Options;
use crate::error::{BindError, Result};
use crate::events::{EntityEvent, EventBus, Subscription};
use crate::identity::{self, ID_KEY};
use crate::remote::Attributes;
use crate::suppression::{PhaseGuard, SyncPhase};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Options for a single attribute mutation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Apply without emitting `Change`.
    pub silent: bool,
}

impl SetOptions {
    pub fn silent() -> Self {
        Self { silent: true }
    }
}

/// Shared handle to one entity. Clones point at the same entity.
#[derive(Clone)]
pub struct Entity {
    inner: Rc<EntityInner>,
}

struct EntityInner {
    attributes: RefCell<Attributes>,
    /// Last-known remote state, the diff baseline for outbound writes.
    remote_attributes: RefCell<Option<Attributes>>,
    phase: Cell<SyncPhase>,
    events: Rc<EventBus<EntityEvent>>,
}

impl Entity {
    pub fn new(attributes: Attributes) -> Self {
        Self {
            inner: Rc::new(EntityInner {
                attributes: RefCell::new(attributes),
                remote_attributes: RefCell::new(None),
                phase: Cell::new(SyncPhase::Idle),
                events: Rc::new(EventBus::new()),
            }),
        }
    }

    /// Build an entity from any serializable struct or map.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(attributes(value)?))
    }

    pub fn id(&self) -> Option<String> {
        identity::id_of(&self.inner.attributes.borrow())
    }

    /// True until an id has been assigned.
    pub fn is_new(&self) -> bool {
        self.id().is_none()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.attributes.borrow().get(key).cloned()
    }

    /// Present and not null.
    pub fn has(&self, key: &str) -> bool {
        self.inner
            .attributes
            .borrow()
            .get(key)
            .is_some_and(|v| !v.is_null())
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.attributes.borrow().keys().cloned().collect()
    }

    /// Copy of the current attributes.
    pub fn to_json(&self) -> Attributes {
        self.inner.attributes.borrow().clone()
    }

    /// Deserialize the current attributes into a typed value.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.to_json()))?)
    }

    pub fn set(&self, attrs: Attributes) -> Attributes {
        self.set_with(attrs, SetOptions::default())
    }

    pub fn set_value(&self, key: &str, value: impl Into<Value>) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert(key.to_string(), value.into());
        self.set(attrs)
    }

    /// Merge `attrs` in. Returns the keys whose value actually changed.
    pub fn set_with(&self, attrs: Attributes, options: SetOptions) -> Attributes {
        let mut changed = Attributes::new();
        {
            let mut current = self.inner.attributes.borrow_mut();
            for (key, value) in attrs {
                if current.get(&key) != Some(&value) {
                    changed.insert(key.clone(), value.clone());
                    current.insert(key, value);
                }
            }
        }
        self.notify(&changed, options);
        changed
    }

    pub fn unset(&self, key: &str) -> Attributes {
        self.unset_with([key], SetOptions::default())
    }

    /// Remove keys. Removed keys are reported as `null` in the change set.
    pub fn unset_with<I, K>(&self, keys: I, options: SetOptions) -> Attributes
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut changed = Attributes::new();
        {
            let mut current = self.inner.attributes.borrow_mut();
            for key in keys {
                if current.remove(key.as_ref()).is_some() {
                    changed.insert(key.as_ref().to_string(), Value::Null);
                }
            }
        }
        self.notify(&changed, options);
        changed
    }

    pub fn clear(&self) -> Attributes {
        let keys = self.keys();
        self.unset_with(keys, SetOptions::default())
    }

    /// Make the attributes equal to `attrs`: keys missing from `attrs` are
    /// removed, the rest assigned. Emits a single `Change`.
    pub fn reconcile(&self, attrs: Attributes, options: SetOptions) -> Attributes {
        let mut changed = Attributes::new();
        {
            let mut current = self.inner.attributes.borrow_mut();
            let stale: Vec<String> = current
                .keys()
                .filter(|key| !attrs.contains_key(*key))
                .cloned()
                .collect();
            for key in stale {
                current.remove(&key);
                changed.insert(key, Value::Null);
            }
            for (key, value) in attrs {
                if current.get(&key) != Some(&value) {
                    changed.insert(key.clone(), value.clone());
                    current.insert(key, value);
                }
            }
        }
        self.notify(&changed, options);
        changed
    }

    /// Ask the owner to delete this entity remotely.
    pub fn destroy(&self, options: Options) {
        self.inner.events.emit(EntityEvent::Destroy { options });
    }

    pub fn subscribe(&self, callback: impl Fn(EntityEvent) + 'static) -> Subscription {
        self.inner.events.subscribe(callback)
    }

    pub fn remote_attributes(&self) -> Option<Attributes> {
        self.inner.remote_attributes.borrow().clone()
    }

    pub(crate) fn set_remote_attributes(&self, attrs: Attributes) {
        *self.inner.remote_attributes.borrow_mut() = Some(attrs);
    }

    pub fn phase(&self) -> SyncPhase {
        self.inner.phase.get()
    }

    pub(crate) fn enter_phase(&self, phase: SyncPhase) -> PhaseGuard<'_> {
        PhaseGuard::enter(&self.inner.phase, phase)
    }

    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn notify(&self, changed: &Attributes, options: SetOptions) {
        if !changed.is_empty() && !options.silent {
            self.inner.events.emit(EntityEvent::Change {
                changed: changed.clone(),
            });
        }
    }
}

impl From<Attributes> for Entity {
    fn from(attributes: Attributes) -> Self {
        Entity::new(attributes)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("attributes", &self.inner.attributes.borrow())
            .field("phase", &self.inner.phase.get())
            .finish()
    }
}

/// Serialize a value into an attribute bag. Only objects qualify.
pub fn attributes<T: Serialize>(value: &T) -> Result<Attributes> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(BindError::Serialization(format!(
            "expected an object, got {other}"
        ))),
    }
}

/// Set the id attribute on a bag.
pub(crate) fn assign_id(attrs: &mut Attributes, id: &str) {
    attrs.insert(ID_KEY.to_string(), Value::String(id.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn bag(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    fn record_changes(entity: &Entity) -> (Rc<RefCell<Vec<Attributes>>>, Subscription) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = Rc::clone(&log);
        let sub = entity.subscribe(move |event| {
            if let EntityEvent::Change { changed } = event {
                log_clone.borrow_mut().push(changed);
            }
        });
        (log, sub)
    }

    #[test]
    fn test_set_reports_only_changed_keys() {
        let entity = Entity::new(bag(json!({"id": "1", "name": "David"})));
        let (log, _sub) = record_changes(&entity);

        let changed = entity.set(bag(json!({"name": "David", "age": 26})));
        assert_eq!(changed, bag(json!({"age": 26})));
        assert_eq!(log.borrow().len(), 1);

        entity.set(bag(json!({"age": 26})));
        assert_eq!(log.borrow().len(), 1, "no-op set must not emit");
    }

    #[test]
    fn test_unset_reports_null() {
        let entity = Entity::new(bag(json!({"id": "1", "age": 26})));
        let changed = entity.unset("age");
        assert_eq!(changed, bag(json!({"age": null})));
        assert_eq!(entity.get("age"), None);
        assert!(entity.unset("missing").is_empty());
    }

    #[test]
    fn test_reconcile_removes_missing_keys() {
        let entity = Entity::new(bag(json!({"id": "1", "name": "David", "age": 26})));
        let (log, _sub) = record_changes(&entity);

        entity.reconcile(bag(json!({"id": "1", "name": "David"})), SetOptions::default());

        assert_eq!(entity.get("age"), None);
        assert_eq!(entity.get("name"), Some(json!("David")));
        assert_eq!(log.borrow().as_slice(), &[bag(json!({"age": null}))]);
    }

    #[test]
    fn test_silent_set_does_not_emit() {
        let entity = Entity::new(Attributes::new());
        let (log, _sub) = record_changes(&entity);
        entity.set_with(bag(json!({"a": 1})), SetOptions::silent());
        assert!(log.borrow().is_empty());
        assert_eq!(entity.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_identity() {
        let entity = Entity::new(Attributes::new());
        assert!(entity.is_new());
        entity.set_value("id", "abc");
        assert_eq!(entity.id().as_deref(), Some("abc"));
        assert!(entity.has("id"));
    }

    #[test]
    fn test_typed_roundtrip() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Todo {
            title: String,
            completed: bool,
        }

        let todo = Todo {
            title: "blah".into(),
            completed: false,
        };
        let entity = Entity::from_value(&todo).unwrap();
        assert_eq!(entity.parse::<Todo>().unwrap(), todo);

        assert!(attributes(&"not an object").is_err());
    }
}
