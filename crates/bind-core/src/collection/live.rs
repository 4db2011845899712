//! Continuous mirror of a container node.

use super::{CollectionCore, CollectionMirror, CollectionState, ensure_id};
use crate::completion::{self, Completion, Options};
use crate::diff::{diff_attributes, split_priority, touches_priority};
use crate::dispatch::{self, Method};
use crate::entity::{Entity, SetOptions, assign_id};
use crate::error::{BindError, Result};
use crate::events::CollectionEvent;
use crate::identity::{id_of, resolve_identity};
use crate::remote::{Attributes, ChildEvent, ListenerId, OnComplete, RemoteRef, Snapshot};
use crate::suppression::{EchoKind, SyncPhase};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Entities handed to `add` whose remote echo has not arrived yet.
type PendingAdds = Rc<RefCell<HashMap<String, Entity>>>;

#[derive(Default)]
pub(crate) struct LiveCollection {
    listeners: RefCell<Vec<ListenerId>>,
    pending_adds: PendingAdds,
}

impl LiveCollection {
    fn child_added(&self, core: &Rc<CollectionCore>, snap: Snapshot) {
        let attrs = match resolve_identity(&snap) {
            Ok(attrs) => attrs,
            Err(err) => return core.report(err),
        };
        let id = snap.key().to_string();
        if core.get(&id).is_some() {
            debug!(%id, "child already present, merging");
            return self.child_changed(core, snap);
        }

        let silent = core.echoes.consume(EchoKind::Added, &id);
        let pending = self.pending_adds.borrow_mut().remove(&id);
        let entity = pending.unwrap_or_else(|| Entity::new(Attributes::new()));
        {
            let _phase = entity.enter_phase(SyncPhase::ApplyingRemote);
            entity.set_remote_attributes(attrs.clone());
            entity.reconcile(attrs, SetOptions::silent());
        }
        core.add_member(entity, silent);
    }

    fn child_changed(&self, core: &Rc<CollectionCore>, snap: Snapshot) {
        let attrs = match resolve_identity(&snap) {
            Ok(attrs) => attrs,
            Err(err) => return core.report(err),
        };
        let Some(entity) = core.get(snap.key()) else {
            debug!(id = snap.key(), "change for an unknown child, adding it");
            return self.child_added(core, snap);
        };

        let _phase = entity.enter_phase(SyncPhase::ApplyingRemote);
        entity.set_remote_attributes(attrs.clone());
        entity.reconcile(attrs, SetOptions::default());
        core.emit(CollectionEvent::Sync);
    }

    fn child_moved(&self, core: &Rc<CollectionCore>, snap: Snapshot) {
        let attrs = match resolve_identity(&snap) {
            Ok(attrs) => attrs,
            Err(err) => return core.report(err),
        };
        let Some(entity) = core.get(snap.key()) else {
            debug!(id = snap.key(), "move for an unknown child, adding it");
            return self.child_added(core, snap);
        };

        core.apply_remote(&entity, attrs);
        if core.reposition(snap.key()) {
            debug!(id = snap.key(), "child reordered");
        }
        core.emit(CollectionEvent::Sort);
    }

    fn child_removed(&self, core: &Rc<CollectionCore>, snap: Snapshot) {
        if let Err(err) = resolve_identity(&snap) {
            return core.report(err);
        }
        let id = snap.key();
        let silent = core.echoes.consume(EchoKind::Removed, id);
        if !silent {
            core.emit(CollectionEvent::Sync);
        }
        core.remove_member(id, silent);
    }

    /// Acknowledgement for a member delete. Drops a token no echo consumed
    /// and removes the member if the echo never came.
    fn delete_member(core: &Rc<CollectionCore>, id: &str, silent: bool, options: Options) {
        let item = core
            .get(id)
            .map(|e| Value::Object(e.to_json()))
            .unwrap_or(Value::Null);
        if silent {
            core.echoes.arm(EchoKind::Removed, id);
        }

        let weak = Rc::downgrade(core);
        let key = id.to_string();
        dispatch::issue(
            Method::Delete,
            core.remote.child(id).as_ref(),
            Attributes::new(),
            move |outcome| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let result = outcome.map(|_| ());
                core.echoes.disarm(EchoKind::Removed, &key);
                if result.is_ok() {
                    core.remove_member(&key, silent);
                }
                let _ = dispatch::complete_check(result, &item, &options);
            },
        );
    }
}

impl CollectionMirror for LiveCollection {
    fn attach(&self, core: &Rc<CollectionCore>) {
        core.set_state(CollectionState::AwaitingInitialSync);

        let mut listeners = Vec::new();
        for kind in [
            ChildEvent::Added,
            ChildEvent::Moved,
            ChildEvent::Changed,
            ChildEvent::Removed,
        ] {
            let weak = Rc::downgrade(core);
            listeners.push(core.remote.on_child(
                kind,
                Rc::new(move |snap, _prev| {
                    let Some(core) = weak.upgrade() else {
                        return;
                    };
                    if let Some(mirror) = core.mirror() {
                        mirror.apply_child_event(&core, kind, snap);
                    }
                }),
            ));
        }
        *self.listeners.borrow_mut() = listeners;

        let on_value = Rc::downgrade(core);
        let on_error = Rc::downgrade(core);
        core.remote.once_value(
            Box::new(move |_snap| {
                if let Some(core) = on_value.upgrade() {
                    core.set_state(CollectionState::Synced);
                    core.initial.open(Ok(()));
                    core.emit(CollectionEvent::Sync);
                }
            }),
            Box::new(move |err| {
                if let Some(core) = on_error.upgrade() {
                    let err = BindError::from(err);
                    core.initial.open(Err(err.clone()));
                    core.report(err);
                }
            }),
        );
    }

    fn apply_child_event(&self, core: &Rc<CollectionCore>, kind: ChildEvent, snap: Snapshot) {
        debug!(?kind, id = snap.key(), "remote child event");
        match kind {
            ChildEvent::Added => self.child_added(core, snap),
            ChildEvent::Changed => self.child_changed(core, snap),
            ChildEvent::Moved => self.child_moved(core, snap),
            ChildEvent::Removed => self.child_removed(core, snap),
        }
    }

    fn add(&self, core: &Rc<CollectionCore>, entities: Vec<Entity>, options: Options) -> Vec<Entity> {
        let mut added = Vec::with_capacity(entities.len());
        for entity in entities {
            let id = ensure_id(core.remote.as_ref(), &entity);
            if options.silent {
                core.echoes.arm(EchoKind::Added, &id);
            }
            self.pending_adds
                .borrow_mut()
                .insert(id.clone(), entity.clone());

            let payload = entity.to_json();
            let item = Value::Object(payload.clone());
            let weak = Rc::downgrade(core);
            let pending = Rc::clone(&self.pending_adds);
            let options = options.clone();
            let key = id.clone();
            dispatch::issue(
                Method::Create,
                core.remote.child(&id).as_ref(),
                payload,
                move |outcome| {
                    let Some(core) = weak.upgrade() else {
                        return;
                    };
                    let result = outcome.map(|_| ());
                    core.echoes.disarm(EchoKind::Added, &key);
                    let unechoed = pending.borrow_mut().remove(&key);
                    if result.is_ok() {
                        // The store already held this exact value: no echo.
                        if let Some(entity) = unechoed {
                            core.add_member(entity, options.silent);
                        }
                    }
                    let succeeded = result.is_ok();
                    let _ = dispatch::complete_check(result, &item, &options);
                    if succeeded {
                        core.emit(CollectionEvent::Sync);
                    }
                },
            );
            added.push(core.get(&id).unwrap_or(entity));
        }
        added
    }

    fn create(&self, core: &Rc<CollectionCore>, entity: Entity, options: Options) -> Result<Entity> {
        if options.wait {
            info!("wait option provided to create, ignoring");
        }
        self.add(core, vec![entity], options)
            .into_iter()
            .next()
            .ok_or(BindError::InvalidModelId)
    }

    fn remove(&self, core: &Rc<CollectionCore>, ids: Vec<String>, options: Options) -> Vec<Entity> {
        let mut removed = Vec::new();
        for id in ids {
            let Some(entity) = core.get(&id) else {
                debug!(%id, "remove for an unknown member, ignoring");
                continue;
            };
            Self::delete_member(core, &id, options.silent, options.clone());
            removed.push(entity);
        }
        removed
    }

    fn reset(&self, core: &Rc<CollectionCore>, entities: Vec<Entity>, options: Options) -> Vec<Entity> {
        self.remove(core, core.ids(), Options::new().silent());
        let added = self.add(core, entities, Options::new().silent());
        if !options.silent {
            core.emit(CollectionEvent::Reset);
        }
        added
    }

    fn fetch(&self, core: &Rc<CollectionCore>, options: Options) -> Completion<()> {
        debug!(path = %core.remote.path(), "fetch on a live collection waits for the initial sync");
        let (resolver, completion) = completion::channel();
        let weak = Rc::downgrade(core);
        core.initial.on_open(move |outcome| {
            let item = weak.upgrade().map(|c| c.to_value()).unwrap_or(Value::Null);
            resolver.resolve(dispatch::complete_check(outcome, &item, &options));
        });
        completion
    }

    fn save(&self, core: &Rc<CollectionCore>, id: &str, _options: Options) -> Result<()> {
        warn!(path = %core.remote.path(), %id, "save called on a live collection, ignoring");
        Ok(())
    }

    fn handle_local_change(&self, core: &Rc<CollectionCore>, entity: &Entity, _changed: &Attributes) {
        let baseline = entity.remote_attributes().unwrap_or_default();
        // A member lives at `container/<id>`; its id cannot move once stored.
        if let Some(stored) = id_of(&baseline) {
            let current = entity.id();
            if current.as_deref() != Some(stored.as_str()) {
                let mut restore = Attributes::new();
                assign_id(&mut restore, &stored);
                entity.set_with(restore, SetOptions::silent());
                core.report(BindError::IdChanged {
                    from: stored,
                    to: current,
                });
            }
        }

        let Some(id) = entity.id() else {
            return;
        };
        let mut local = entity.to_json();
        let patch = diff_attributes(&baseline, &local);
        if patch.is_empty() {
            return;
        }

        let child = core.remote.child(&id);
        let on_complete: OnComplete = Box::new(move |result| {
            if let Err(err) = result {
                warn!(error = %err, "remote rejected member update");
            }
        });
        let _phase = entity.enter_phase(SyncPhase::EmittingLocal);
        if touches_priority(&patch) {
            let priority = split_priority(&mut local).unwrap_or(Value::Null);
            debug!(%id, "priority changed, rewriting member");
            child.set_with_priority(Value::Object(local), priority, Some(on_complete));
        } else {
            debug!(%id, keys = patch.len(), "pushing member change");
            child.update(patch, Some(on_complete));
        }
    }

    fn handle_local_destroy(&self, core: &Rc<CollectionCore>, entity: &Entity, options: Options) {
        let Some(id) = entity.id() else {
            return;
        };
        core.remove_member(&id, false);
        Self::delete_member(core, &id, false, options);
    }

    fn teardown(&self, remote: &dyn RemoteRef) {
        for id in self.listeners.borrow_mut().drain(..) {
            remote.off(id);
        }
    }
}
