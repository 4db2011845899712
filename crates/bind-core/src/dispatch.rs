//! CRUD dispatch for on-demand bindings.
//!
//! Single translation point from a verb to the remote primitive:
//! read → one-shot read, create → destructive set, update → merge update,
//! delete → set(null). Every completion runs through `complete_check`.

use crate::completion::{self, Completion, Options};
use crate::diff::split_priority;
use crate::entity::Entity;
use crate::error::{BindError, Result};
use crate::remote::{Attributes, OnComplete, RemoteRef, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Read,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Read => "read",
            Method::Create => "create",
            Method::Update => "update",
            Method::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Which node an entity is bound to.
#[derive(Clone)]
pub enum Binding {
    /// A standalone model bound directly to a node.
    Node(Rc<dyn RemoteRef>),
    /// A collection member, stored at `container/<id>`.
    Member { container: Rc<dyn RemoteRef> },
}

impl Binding {
    pub fn resolve(&self, entity: &Entity) -> Result<Rc<dyn RemoteRef>> {
        match self {
            Binding::Node(remote) => Ok(Rc::clone(remote)),
            Binding::Member { container } => entity
                .id()
                .map(|id| container.child(&id))
                .ok_or(BindError::InvalidModelId),
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Node(remote) => f.debug_tuple("Node").field(&remote.path()).finish(),
            Binding::Member { container } => f
                .debug_struct("Member")
                .field("container", &container.path())
                .finish(),
        }
    }
}

/// Run `method` for `entity` against its binding.
///
/// Binding failures (a member without an id) are returned immediately and
/// also reported to the error callback. Remote outcomes arrive through the
/// returned completion and the `options` callbacks. The completion resolves
/// with the value read, or with the payload written.
pub fn sync(
    method: Method,
    binding: &Binding,
    entity: &Entity,
    options: Options,
) -> Result<Completion<Value>> {
    sync_with(method, binding, entity, entity.to_json(), options)
}

/// Like `sync`, with an explicit payload for writes.
pub fn sync_with(
    method: Method,
    binding: &Binding,
    entity: &Entity,
    payload: Attributes,
    options: Options,
) -> Result<Completion<Value>> {
    let remote = match binding.resolve(entity) {
        Ok(remote) => remote,
        Err(err) => {
            options.notify_error(&Value::Object(entity.to_json()), &err);
            return Err(err);
        }
    };

    let failed_item = Value::Object(entity.to_json());
    let (resolver, completion) = completion::channel();
    issue(method, remote.as_ref(), payload, move |outcome| {
        let outcome = outcome.map(Snapshot::into_val);
        let item = match &outcome {
            Ok(value) => value.clone(),
            Err(_) => failed_item,
        };
        let checked = complete_check(outcome.clone().map(|_| ()), &item, &options);
        resolver.resolve(checked.and(outcome));
    });
    Ok(completion)
}

/// Issue the primitive for `method` and report the outcome once.
///
/// Writes report a snapshot of the payload as written.
pub(crate) fn issue(
    method: Method,
    remote: &dyn RemoteRef,
    mut payload: Attributes,
    done: impl FnOnce(Result<Snapshot>) + 'static,
) {
    let key = remote.key().unwrap_or_default();
    debug!(%method, path = %remote.path(), "dispatch");

    if method == Method::Read {
        let done: Rc<RefCell<Option<Box<dyn FnOnce(Result<Snapshot>)>>>> =
            Rc::new(RefCell::new(Some(Box::new(done))));
        let on_error = Rc::clone(&done);
        remote.once_value(
            Box::new(move |snap| {
                if let Some(done) = done.borrow_mut().take() {
                    done(Ok(snap));
                }
            }),
            Box::new(move |err| {
                if let Some(done) = on_error.borrow_mut().take() {
                    done(Err(err.into()));
                }
            }),
        );
        return;
    }

    let priority = split_priority(&mut payload);
    let written = match method {
        Method::Delete => Value::Null,
        _ => Value::Object(payload.clone()),
    };
    let snapshot = Snapshot::new(key, written.clone()).with_priority(priority.clone());
    let on_complete: OnComplete = Box::new(move |result| {
        done(result.map(|()| snapshot).map_err(BindError::from));
    });

    match (method, priority) {
        (Method::Delete, _) => remote.set(Value::Null, Some(on_complete)),
        // A merge write cannot change priority, so any payload carrying one
        // is written whole.
        (_, Some(priority)) => remote.set_with_priority(written, priority, Some(on_complete)),
        (Method::Create, None) => remote.set(written, Some(on_complete)),
        (_, None) => remote.update(payload, Some(on_complete)),
    }
}

/// Route a write or read outcome to the caller's callbacks.
///
/// Failures go to the error callback; with none attached the failure is
/// logged and otherwise dropped. Returns the outcome unchanged.
pub fn complete_check(result: Result<()>, item: &Value, options: &Options) -> Result<()> {
    match &result {
        Ok(()) => options.notify_success(item),
        Err(err) => {
            if !options.notify_error(item, err) {
                warn!(error = %err, "remote operation failed with no error callback attached");
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryStore, WriteOp};
    use crate::remote::RemoteError;
    use serde_json::json;

    fn entity(value: Value) -> Entity {
        Entity::new(value.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let store = InMemoryStore::new();
        let binding = Binding::Node(store.at("models/one"));
        let model = entity(json!({"title": "blah"}));

        let written = sync(Method::Create, &binding, &model, Options::new())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(written, json!({"title": "blah"}));

        let read = sync(Method::Read, &binding, &model, Options::new())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(read, json!({"title": "blah"}));
    }

    #[tokio::test]
    async fn test_update_merges_and_delete_removes() {
        let store = InMemoryStore::new();
        store.at("m").set(json!({"a": 1, "b": 2}), None);
        let binding = Binding::Node(store.at("m"));

        let model = entity(json!({"b": 3}));
        sync(Method::Update, &binding, &model, Options::new())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(store.value_at("m"), json!({"a": 1, "b": 3}));

        sync(Method::Delete, &binding, &model, Options::new())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(store.value_at("m"), Value::Null);
    }

    #[test]
    fn test_member_binding_requires_an_id() {
        let store = InMemoryStore::new();
        let binding = Binding::Member {
            container: store.at("list"),
        };

        let failures = Rc::new(RefCell::new(Vec::new()));
        let failures_clone = Rc::clone(&failures);
        let options = Options::new().on_error(move |_, err| failures_clone.borrow_mut().push(err.clone()));

        let result = sync(Method::Read, &binding, &entity(json!({})), options);
        assert!(matches!(result, Err(BindError::InvalidModelId)));
        assert_eq!(*failures.borrow(), vec![BindError::InvalidModelId]);

        let member = entity(json!({"id": "a"}));
        assert_eq!(binding.resolve(&member).unwrap().path(), "/list/a");
    }

    #[test]
    fn test_priority_payload_uses_set_with_priority() {
        let store = InMemoryStore::new();
        let binding = Binding::Member {
            container: store.at("list"),
        };
        let member = entity(json!({"id": "a", "title": "x", ".priority": 3}));

        let _ = sync(Method::Update, &binding, &member, Options::new()).unwrap();

        assert_eq!(
            store.writes(),
            vec![WriteOp::SetWithPriority {
                path: "/list/a".into(),
                value: json!({"id": "a", "title": "x"}),
                priority: json!(3),
            }]
        );
        assert_eq!(store.priority_at("list/a"), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_failure_reaches_error_callback() {
        let store = InMemoryStore::new();
        store.fail_writes(Some(RemoteError::PermissionDenied("rules".into())));
        let binding = Binding::Node(store.at("m"));

        let seen = Rc::new(RefCell::new(None));
        let seen_clone = Rc::clone(&seen);
        let options = Options::new()
            .on_success(|_| panic!("success must not run on failure"))
            .on_error(move |item, err| *seen_clone.borrow_mut() = Some((item.clone(), err.clone())));

        let result = sync(Method::Create, &binding, &entity(json!({"title": "blah"})), options)
            .unwrap()
            .await;

        assert!(matches!(result, Err(BindError::Remote(RemoteError::PermissionDenied(_)))));
        let (item, err) = seen.borrow().clone().unwrap();
        assert_eq!(item, json!({"title": "blah"}));
        assert!(matches!(err, BindError::Remote(RemoteError::PermissionDenied(_))));
    }

    #[test]
    fn test_complete_check_without_error_callback() {
        let err = BindError::Remote(RemoteError::Other("boom".into()));
        let result = complete_check(Err(err.clone()), &Value::Null, &Options::new());
        assert_eq!(result, Err(err));
    }
}
