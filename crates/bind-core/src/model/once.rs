//! On-demand binding of one node: read and written only when asked.

use super::{EntityMirror, ModelCore};
use crate::completion::{self, Completion, Options};
use crate::diff::changed_patch;
use crate::dispatch::{self, Binding, Method};
use crate::entity::{SetOptions, assign_id};
use crate::error::{BindError, Result};
use crate::identity::ID_KEY;
use crate::remote::{Attributes, RemoteRef, Snapshot};
use crate::suppression::SyncPhase;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::{debug, warn};

pub(crate) struct OnceModel {
    write_through: bool,
    /// Keys removed locally since the last write, sent as nulls on save.
    pending_deletes: Rc<RefCell<BTreeSet<String>>>,
}

impl OnceModel {
    pub(crate) fn new(write_through: bool) -> Self {
        Self {
            write_through,
            pending_deletes: Rc::new(RefCell::new(BTreeSet::new())),
        }
    }

    fn binding(core: &ModelCore) -> Binding {
        Binding::Node(Rc::clone(&core.remote))
    }
}

impl EntityMirror for OnceModel {
    fn attach(&self, core: &Rc<ModelCore>) {
        debug!(path = %core.remote.path(), "on-demand model, not listening");
    }

    fn apply_remote_snapshot(&self, core: &Rc<ModelCore>, snap: Snapshot) -> Result<()> {
        match core.apply_snapshot(&snap) {
            Ok(()) => {
                self.pending_deletes.borrow_mut().clear();
                core.settle();
                Ok(())
            }
            Err(err) => {
                core.report(err.clone());
                Err(err)
            }
        }
    }

    fn handle_local_change(&self, core: &Rc<ModelCore>, changed: &Attributes) {
        {
            let mut pending = self.pending_deletes.borrow_mut();
            for (key, value) in changed {
                if key == ID_KEY {
                    continue;
                }
                if value.is_null() {
                    pending.insert(key.clone());
                } else {
                    pending.remove(key);
                }
            }
        }

        if !self.write_through {
            return;
        }
        let patch = changed_patch(changed);
        if patch.is_empty() {
            return;
        }
        {
            let mut pending = self.pending_deletes.borrow_mut();
            for key in patch.keys() {
                pending.remove(key);
            }
        }

        let _phase = core.entity.enter_phase(SyncPhase::EmittingLocal);
        debug!(path = %core.remote.path(), keys = patch.len(), "writing through local change");
        core.remote.update(
            patch,
            Some(Box::new(|result| {
                if let Err(err) = result {
                    warn!(error = %err, "remote rejected write-through update");
                }
            })),
        );
    }

    fn save(&self, core: &Rc<ModelCore>, options: Options) -> Result<()> {
        let method = if core.entity.is_new() {
            if let Some(key) = core.remote.key() {
                let mut id = Attributes::new();
                assign_id(&mut id, &key);
                core.entity.set_with(id, SetOptions::silent());
            }
            Method::Create
        } else {
            Method::Update
        };

        let deletes = std::mem::take(&mut *self.pending_deletes.borrow_mut());
        let mut payload = core.entity.to_json();
        for key in &deletes {
            payload.entry(key.clone()).or_insert(Value::Null);
        }
        // A rejected write must not lose the deletes it carried.
        let pending = Rc::clone(&self.pending_deletes);
        let options = options.after_error(move |_| pending.borrow_mut().extend(deletes.iter().cloned()));

        let _pending = dispatch::sync_with(method, &Self::binding(core), &core.entity, payload, options)?;
        Ok(())
    }

    fn fetch(&self, core: &Rc<ModelCore>, options: Options) -> Completion<()> {
        let (resolver, completion) = completion::channel();
        let weak = Rc::downgrade(core);
        dispatch::issue(
            Method::Read,
            core.remote.as_ref(),
            Attributes::new(),
            move |outcome| {
                let Some(core) = weak.upgrade() else {
                    resolver.resolve(Err(BindError::Cancelled));
                    return;
                };
                let (item, applied) = match outcome {
                    Ok(snap) => {
                        let item = snap.val().clone();
                        let applied = match core.mirror() {
                            Some(mirror) => mirror.apply_remote_snapshot(&core, snap),
                            None => Err(BindError::Cancelled),
                        };
                        (item, applied)
                    }
                    Err(err) => {
                        core.report(err.clone());
                        (Value::Object(core.entity.to_json()), Err(err))
                    }
                };
                resolver.resolve(dispatch::complete_check(applied, &item, &options));
            },
        );
        completion
    }

    fn sync(&self, core: &Rc<ModelCore>, method: Method, options: Options) -> Result<Completion<Value>> {
        dispatch::sync(method, &Self::binding(core), &core.entity, options)
    }

    fn teardown(&self, _remote: &dyn RemoteRef) {}
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

    fn once(store: &InMemoryStore, path: &str) -> BindConfig {
        BindConfig::new(store.at(path)).with_auto_sync(false)
    }

    #[test]
    fn test_never_listens() {
        let store = InMemoryStore::new();
        let model = Model::new(bag(json!({"a": 1})), once(&store, "m")).unwrap();

        model.set_value("a", 2);

        assert_eq!(store.listener_count(), 0);
        assert!(store.writes().is_empty());
        assert!(!model.synced());
    }

    #[test]
    fn test_save_creates_then_updates_with_deletes() {
        let store = InMemoryStore::new();
        let model = Model::new(bag(json!({"name": "David", "age": 26})), once(&store, "people/1")).unwrap();

        model.save(Options::new()).unwrap();
        assert_eq!(model.id().as_deref(), Some("1"));
        assert_eq!(store.value_at("people/1"), json!({"id": "1", "name": "David", "age": 26}));

        model.unset("age");
        model.save(Options::new()).unwrap();

        assert_eq!(store.value_at("people/1"), json!({"id": "1", "name": "David"}));
        assert!(matches!(store.writes().as_slice(), [WriteOp::Set { .. }, WriteOp::Update { .. }]));
    }

    #[test]
    fn test_failed_save_keeps_pending_deletes() {
        let store = InMemoryStore::new();
        let model = Model::new(bag(json!({"name": "David", "age": 26})), once(&store, "people/1")).unwrap();
        model.save(Options::new()).unwrap();

        model.unset("age");
        store.fail_writes(Some(RemoteError::Unavailable("offline".into())));
        let failed = Rc::new(RefCell::new(0));
        let failed_clone = Rc::clone(&failed);
        model
            .save(Options::new().on_error(move |_, _| *failed_clone.borrow_mut() += 1))
            .unwrap();
        assert_eq!(*failed.borrow(), 1);
        assert_eq!(store.value_at("people/1/age"), json!(26));

        store.fail_writes(None);
        model.save(Options::new()).unwrap();

        assert_eq!(store.value_at("people/1"), json!({"id": "1", "name": "David"}));
    }

    #[tokio::test]
    async fn test_fetch_reconciles_and_syncs() {
        let store = InMemoryStore::new();
        store.at("people/1").set(json!({"name": "David"}), None);

        let model = Model::new(bag(json!({"id": "1", "name": "David", "age": 26})), once(&store, "people/1")).unwrap();
        let events = Rc::new(RefCell::new(Vec::new()));
        let events_clone = Rc::clone(&events);
        let _sub = model.on(move |event| events_clone.borrow_mut().push(event.name()));

        model.fetch(Options::new()).await.unwrap();

        assert_eq!(model.get("age"), None);
        assert_eq!(model.get("name"), Some(json!("David")));
        assert!(events.borrow().contains(&"sync"));
        assert!(model.synced());
    }

    #[tokio::test]
    async fn test_fetch_failure() {
        let store = InMemoryStore::new();
        store.fail_reads(Some(RemoteError::Unavailable("offline".into())));
        let model = Model::new(Attributes::new(), once(&store, "m")).unwrap();

        let errors = Rc::new(RefCell::new(0));
        let errors_clone = Rc::clone(&errors);
        let _sub = model.on(move |event| {
            if let ModelEvent::Error(_) = event {
                *errors_clone.borrow_mut() += 1;
            }
        });

        assert!(model.fetch(Options::new()).await.is_err());
        assert_eq!(*errors.borrow(), 1);
    }

    #[test]
    fn test_write_through_pushes_each_change() {
        let store = InMemoryStore::new();
        let config = once(&store, "m").with_write_through(true);
        let model = Model::new(bag(json!({"a": 1})), config).unwrap();

        model.set_value("b", 2);
        model.unset("a");

        assert_eq!(
            store.writes(),
            vec![
                WriteOp::Update {
                    path: "/m".into(),
                    patch: bag(json!({"b": 2})),
                },
                WriteOp::Update {
                    path: "/m".into(),
                    patch: bag(json!({"a": null})),
                },
            ]
        );
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_sync_dispatches() {
        let store = InMemoryStore::new();
        store.at("m").set(json!({"a": 1}), None);
        let model = Model::new(Attributes::new(), once(&store, "m")).unwrap();

        let value = model
            .sync(crate::dispatch::Method::Read, Options::new())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(value, json!({"a": 1}));
    }
}
