//! On-demand collection: structural edits stay local until written.

use super::{CollectionCore, CollectionMirror, CollectionState, ensure_id};
use crate::completion::{self, Completion, Options};
use crate::dispatch::{self, Binding, Method};
use crate::entity::Entity;
use crate::error::{BindError, Result};
use crate::events::CollectionEvent;
use crate::identity::resolve_identity;
use crate::remote::{Attributes, RemoteRef, Snapshot};
use serde_json::Value;
use std::collections::HashSet;
use std::rc::Rc;
use tracing::{debug, info};

pub(crate) struct OnceCollection;

impl OnceCollection {
    fn binding(core: &CollectionCore) -> Binding {
        Binding::Member {
            container: Rc::clone(&core.remote),
        }
    }

    /// Record what a successful write stored as the member's baseline.
    fn track_baseline(entity: &Entity, options: Options) -> Options {
        let entity = entity.clone();
        options.after_success(move |written| {
            if let Value::Object(attrs) = written {
                entity.set_remote_attributes(attrs.clone());
            }
        })
    }

    /// Flatten a container read into member attribute bags, in key order.
    fn members_of(snap: &Snapshot) -> Result<Vec<Attributes>> {
        match snap.val() {
            Value::Null => Ok(Vec::new()),
            Value::Object(children) => children
                .iter()
                .map(|(key, value)| resolve_identity(&Snapshot::new(key.clone(), value.clone())))
                .collect(),
            _ => Err(BindError::InvalidId {
                key: snap.key().to_string(),
            }),
        }
    }

    /// Merge fetched members: add new, update existing, drop missing.
    fn merge(core: &Rc<CollectionCore>, fetched: Vec<Attributes>, silent: bool) {
        let mut seen = HashSet::new();
        for attrs in fetched {
            let Some(id) = crate::identity::id_of(&attrs) else {
                continue;
            };
            seen.insert(id.clone());
            match core.get(&id) {
                Some(existing) => core.apply_remote(&existing, attrs),
                None => {
                    let entity = Entity::new(Attributes::new());
                    core.apply_remote(&entity, attrs);
                    core.add_member(entity, silent);
                }
            }
        }
        for id in core.ids() {
            if !seen.contains(&id) {
                core.remove_member(&id, silent);
            }
        }
    }

    fn replace(core: &Rc<CollectionCore>, fetched: Vec<Attributes>, silent: bool) {
        let entities = fetched
            .into_iter()
            .map(|attrs| {
                let entity = Entity::new(Attributes::new());
                core.apply_remote(&entity, attrs);
                entity
            })
            .collect();
        core.reset_members(entities, silent);
    }
}

impl CollectionMirror for OnceCollection {
    fn attach(&self, core: &Rc<CollectionCore>) {
        debug!(path = %core.remote.path(), "on-demand collection, not listening");
    }

    fn add(&self, core: &Rc<CollectionCore>, entities: Vec<Entity>, options: Options) -> Vec<Entity> {
        entities
            .into_iter()
            .map(|entity| {
                ensure_id(core.remote.as_ref(), &entity);
                core.add_member(entity, options.silent)
            })
            .collect()
    }

    fn create(&self, core: &Rc<CollectionCore>, entity: Entity, options: Options) -> Result<Entity> {
        if options.wait {
            info!("wait option provided to create, ignoring");
        }
        ensure_id(core.remote.as_ref(), &entity);
        let member = core.add_member(entity, options.silent);
        let options = Self::track_baseline(&member, options);
        let _pending = dispatch::sync(Method::Create, &Self::binding(core), &member, options)?;
        Ok(member)
    }

    fn remove(&self, core: &Rc<CollectionCore>, ids: Vec<String>, options: Options) -> Vec<Entity> {
        ids.iter()
            .filter_map(|id| core.remove_member(id, options.silent))
            .collect()
    }

    fn reset(&self, core: &Rc<CollectionCore>, entities: Vec<Entity>, options: Options) -> Vec<Entity> {
        for entity in &entities {
            ensure_id(core.remote.as_ref(), entity);
        }
        core.reset_members(entities, options.silent)
    }

    fn fetch(&self, core: &Rc<CollectionCore>, options: Options) -> Completion<()> {
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
                let fetched = outcome.and_then(|snap| Self::members_of(&snap));
                let result = match fetched {
                    Ok(members) => {
                        if options.reset {
                            Self::replace(&core, members, options.silent);
                        } else {
                            Self::merge(&core, members, options.silent);
                        }
                        core.set_state(CollectionState::Synced);
                        Ok(())
                    }
                    Err(err) => {
                        core.report(err.clone());
                        Err(err)
                    }
                };
                let item = core.to_value();
                let checked = dispatch::complete_check(result, &item, &options);
                if checked.is_ok() {
                    core.emit(CollectionEvent::Sync);
                }
                resolver.resolve(checked);
            },
        );
        completion
    }

    fn save(&self, core: &Rc<CollectionCore>, id: &str, options: Options) -> Result<()> {
        let entity = core.get(id).ok_or(BindError::InvalidModelId)?;
        let method = if entity.remote_attributes().is_some() {
            Method::Update
        } else {
            Method::Create
        };
        let options = Self::track_baseline(&entity, options);
        let _pending = dispatch::sync(method, &Self::binding(core), &entity, options)?;
        Ok(())
    }

    fn handle_local_change(&self, _core: &Rc<CollectionCore>, entity: &Entity, changed: &Attributes) {
        debug!(id = ?entity.id(), keys = changed.len(), "member changed locally, held until save");
    }

    fn handle_local_destroy(&self, core: &Rc<CollectionCore>, entity: &Entity, options: Options) {
        if let Some(id) = entity.id() {
            core.remove_member(&id, false);
        }
        if let Err(err) = dispatch::sync(Method::Delete, &Self::binding(core), entity, options) {
            debug!(error = %err, "destroyed member was never stored");
        }
    }

    fn teardown(&self, _remote: &dyn RemoteRef) {}
}
