//! Continuous mirror of one node.

use super::{EntityMirror, ModelCore};
use crate::completion::{self, Completion, Options};
use crate::diff::changed_patch;
use crate::dispatch::{self, Method};
use crate::error::{BindError, Result};
use crate::remote::{Attributes, ListenerId, RemoteRef, Snapshot};
use crate::suppression::SyncPhase;
use serde_json::Value;
use std::cell::Cell;
use std::rc::Rc;
use tracing::{debug, warn};

#[derive(Default)]
pub(crate) struct LiveModel {
    listener: Cell<Option<ListenerId>>,
}

impl EntityMirror for LiveModel {
    fn attach(&self, core: &Rc<ModelCore>) {
        let on_value = Rc::downgrade(core);
        let on_error = Rc::downgrade(core);
        let id = core.remote.on_value(
            Rc::new(move |snap| {
                let Some(core) = on_value.upgrade() else {
                    return;
                };
                if let Some(mirror) = core.mirror() {
                    // Failures are reported on the model's bus.
                    let _ = mirror.apply_remote_snapshot(&core, snap);
                }
            }),
            Rc::new(move |err| {
                if let Some(core) = on_error.upgrade() {
                    let err = BindError::from(err);
                    core.initial.open(Err(err.clone()));
                    core.report(err);
                }
            }),
        );
        self.listener.set(Some(id));
    }

    fn apply_remote_snapshot(&self, core: &Rc<ModelCore>, snap: Snapshot) -> Result<()> {
        debug!(path = %core.remote.path(), exists = snap.exists(), "remote value");
        match core.apply_snapshot(&snap) {
            Ok(()) => {
                core.initial.open(Ok(()));
                core.settle();
                Ok(())
            }
            Err(err) => {
                core.initial.open(Err(err.clone()));
                core.report(err.clone());
                Err(err)
            }
        }
    }

    fn handle_local_change(&self, core: &Rc<ModelCore>, changed: &Attributes) {
        let patch = changed_patch(changed);
        if patch.is_empty() {
            return;
        }

        let _phase = core.entity.enter_phase(SyncPhase::EmittingLocal);
        debug!(path = %core.remote.path(), keys = patch.len(), "pushing local change");
        core.remote.update(
            patch,
            Some(Box::new(|result| {
                if let Err(err) = result {
                    warn!(error = %err, "remote rejected model update");
                }
            })),
        );
    }

    fn save(&self, core: &Rc<ModelCore>, _options: Options) -> Result<()> {
        warn!(path = %core.remote.path(), "save called on a live model, ignoring");
        Ok(())
    }

    fn fetch(&self, core: &Rc<ModelCore>, options: Options) -> Completion<()> {
        debug!(path = %core.remote.path(), "fetch on a live model waits for the initial sync");
        let (resolver, completion) = completion::channel();
        let entity = core.entity.clone();
        core.initial.on_open(move |outcome| {
            let item = Value::Object(entity.to_json());
            let checked = dispatch::complete_check(outcome, &item, &options);
            resolver.resolve(checked);
        });
        completion
    }

    fn sync(&self, core: &Rc<ModelCore>, method: Method, _options: Options) -> Result<Completion<Value>> {
        warn!(path = %core.remote.path(), %method, "sync called on a live model, ignoring");
        Ok(Completion::ready(Ok(Value::Object(core.entity.to_json()))))
    }

    fn teardown(&self, remote: &dyn RemoteRef) {
        if let Some(id) = self.listener.take() {
            remote.off(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::completion::Options;
    use crate::config::BindConfig;
    use crate::events::ModelEvent;
    use crate::memory::{InMemoryStore, WriteOp};
    use crate::model::Model;
    use crate::remote::{Attributes, RemoteError};
    use serde_json::{Value, json};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn bag(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    fn record(model: &Model) -> (Rc<RefCell<Vec<&'static str>>>, crate::events::Subscription) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = Rc::clone(&log);
        let sub = model.on(move |event| log_clone.borrow_mut().push(event.name()));
        (log, sub)
    }

    #[test]
    fn test_remote_value_is_applied_and_synced() {
        let store = InMemoryStore::new();
        store.at("people/1").set(json!({"name": "David", "age": 26}), None);

        let model = Model::new(Attributes::new(), BindConfig::new(store.at("people/1"))).unwrap();

        assert!(model.synced());
        assert_eq!(model.id().as_deref(), Some("1"));
        assert_eq!(model.get("age"), Some(json!(26)));
    }

    #[test]
    fn test_remote_removal_unsets_local_key() {
        let store = InMemoryStore::new();
        store.at("people/1").set(json!({"name": "David", "age": 26}), None);
        let model = Model::new(Attributes::new(), BindConfig::new(store.at("people/1"))).unwrap();
        store.clear_writes();

        store.at("people/1/age").set(Value::Null, None);

        assert_eq!(model.get("age"), None);
        assert_eq!(model.get("name"), Some(json!("David")));
        // applying the remote change must not write back
        assert_eq!(store.writes().len(), 1);
    }

    #[test]
    fn test_local_change_pushes_patch() {
        let store = InMemoryStore::new();
        store.at("people/1").set(json!({"name": "David", "age": 26}), None);
        let model = Model::new(Attributes::new(), BindConfig::new(store.at("people/1"))).unwrap();
        store.clear_writes();

        model.set(bag(json!({"name": "Kato"})));
        model.unset("age");

        assert_eq!(
            store.writes(),
            vec![
                WriteOp::Update {
                    path: "/people/1".into(),
                    patch: bag(json!({"name": "Kato"})),
                },
                WriteOp::Update {
                    path: "/people/1".into(),
                    patch: bag(json!({"age": null})),
                },
            ]
        );
        assert_eq!(store.value_at("people/1"), json!({"name": "Kato"}));
    }

    #[test]
    fn test_save_is_ignored() {
        let store = InMemoryStore::new();
        let model = Model::new(Attributes::new(), BindConfig::new(store.at("m"))).unwrap();
        store.clear_writes();

        model.save(Options::new()).unwrap();
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_resolves_with_initial_sync() {
        let store = InMemoryStore::new();
        store.at("m").set(json!({"a": 1}), None);
        let model = Model::new(Attributes::new(), BindConfig::new(store.at("m"))).unwrap();

        model.fetch(Options::new()).await.unwrap();
        assert_eq!(model.get("a"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_read_failure_is_reported() {
        let store = InMemoryStore::new();
        store.fail_reads(Some(RemoteError::PermissionDenied("rules".into())));

        let model = Model::new(Attributes::new(), BindConfig::new(store.at("m"))).unwrap();
        assert!(!model.synced());
        assert!(model.fetch(Options::new()).await.is_err());
    }

    #[test]
    fn test_revoked_read_access_cancels_stream() {
        let store = InMemoryStore::new();
        store.at("m").set(json!({"a": 1}), None);
        let model = Model::new(Attributes::new(), BindConfig::new(store.at("m"))).unwrap();
        let (log, _sub) = record(&model);

        store.fail_reads(Some(RemoteError::PermissionDenied("revoked".into())));
        store.at("m/a").set(json!(2), None);

        assert_eq!(*log.borrow(), vec!["error"]);
        assert_eq!(model.get("a"), Some(json!(1)));
        assert!(model.synced());
    }

    #[test]
    fn test_primitive_node_emits_error() {
        let store = InMemoryStore::new();
        let model = Model::new(Attributes::new(), BindConfig::new(store.at("count"))).unwrap();
        let (log, _sub) = record(&model);

        store.at("count").set(json!(5), None);

        assert_eq!(*log.borrow(), vec!["error"]);
    }

    #[test]
    fn test_defaults_fill_absent_keys_after_first_sync() {
        let store = InMemoryStore::new();
        store.at("m").set(json!({"title": "remote"}), None);

        let config = BindConfig::new(store.at("m"))
            .with_defaults(bag(json!({"title": "default", "done": false})));
        let model = Model::new(Attributes::new(), config).unwrap();

        assert_eq!(model.get("title"), Some(json!("remote")));
        assert_eq!(model.get("done"), Some(json!(false)));
        assert_eq!(store.value_at("m/done"), json!(false));
    }

    #[test]
    fn test_destroy_emits_even_when_the_write_fails() {
        let store = InMemoryStore::new();
        store.at("m").set(json!({"a": 1}), None);
        let model = Model::new(Attributes::new(), BindConfig::new(store.at("m"))).unwrap();
        let (log, _sub) = record(&model);
        store.fail_writes(Some(RemoteError::Unavailable("offline".into())));

        model.destroy(Options::new());

        assert_eq!(*log.borrow(), vec!["destroy"]);
        assert_eq!(store.value_at("m"), json!({"a": 1}));
    }

    #[test]
    fn test_drop_removes_listener() {
        let store = InMemoryStore::new();
        let model = Model::new(Attributes::new(), BindConfig::new(store.at("m"))).unwrap();
        assert_eq!(store.listener_count(), 1);
        drop(model);
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_change_events_reach_model_listeners() {
        let store = InMemoryStore::new();
        let model = Model::new(Attributes::new(), BindConfig::new(store.at("m"))).unwrap();
        let changes = Rc::new(RefCell::new(Vec::new()));
        let changes_clone = Rc::clone(&changes);
        let _sub = model.on(move |event| {
            if let ModelEvent::Change { changed } = event {
                changes_clone.borrow_mut().push(changed);
            }
        });

        model.set_value("title", "x");
        assert_eq!(changes.borrow().first(), Some(&bag(json!({"title": "x"}))));
    }
}
