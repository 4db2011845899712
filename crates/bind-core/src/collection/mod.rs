//! Collection: an ordered, id-unique set of entities bound to a remote
//! container node.
//!
//! Like `Model`, the strategy is fixed at construction:
//! - `LiveCollection` listens to the container's child events and writes
//!   every structural or attribute change through.
//! - `OnceCollection` edits locally and reads or writes only on request.
//!
//! The collection subscribes to every member and re-emits its `Change` and
//! `Destroy` signals on the collection bus before handing them to the
//! strategy.

mod list;
mod live;
mod once;

use crate::completion::{Completion, Options, SyncGate};
use crate::config::{BindConfig, SyncMode};
use crate::entity::{Entity, SetOptions};
use crate::error::{BindError, Result};
use crate::events::{CollectionEvent, EntityEvent, EventBus, Subscription};
use crate::remote::{Attributes, ChildEvent, RemoteRef, Snapshot};
use crate::suppression::{SilentEchoes, SyncPhase};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

use list::{EntityList, Member};
pub(crate) use live::LiveCollection;
pub(crate) use once::OnceCollection;

/// Lifecycle of a collection's initial load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionState {
    #[default]
    Uninitialized,
    AwaitingInitialSync,
    Synced,
}

/// Strategy driving one collection's synchronization.
pub(crate) trait CollectionMirror {
    fn attach(&self, core: &Rc<CollectionCore>);

    /// A structural event arrived for the container.
    fn apply_child_event(&self, _core: &Rc<CollectionCore>, _kind: ChildEvent, _snap: Snapshot) {}

    fn add(&self, core: &Rc<CollectionCore>, entities: Vec<Entity>, options: Options) -> Vec<Entity>;

    fn create(&self, core: &Rc<CollectionCore>, entity: Entity, options: Options) -> Result<Entity>;

    fn remove(&self, core: &Rc<CollectionCore>, ids: Vec<String>, options: Options) -> Vec<Entity>;

    fn reset(&self, core: &Rc<CollectionCore>, entities: Vec<Entity>, options: Options) -> Vec<Entity>;

    fn fetch(&self, core: &Rc<CollectionCore>, options: Options) -> Completion<()>;

    fn save(&self, core: &Rc<CollectionCore>, id: &str, options: Options) -> Result<()>;

    /// A member changed locally. Never called while a remote apply is running.
    fn handle_local_change(&self, core: &Rc<CollectionCore>, entity: &Entity, changed: &Attributes);

    /// A member asked to be destroyed.
    fn handle_local_destroy(&self, core: &Rc<CollectionCore>, entity: &Entity, options: Options);

    fn teardown(&self, remote: &dyn RemoteRef);
}

pub(crate) struct CollectionCore {
    pub(crate) remote: Rc<dyn RemoteRef>,
    pub(crate) echoes: SilentEchoes,
    pub(crate) initial: SyncGate,
    state: Cell<CollectionState>,
    mode: SyncMode,
    list: RefCell<EntityList>,
    events: Rc<EventBus<CollectionEvent>>,
    mirror: RefCell<Option<Rc<dyn CollectionMirror>>>,
}

impl CollectionCore {
    pub(crate) fn emit(&self, event: CollectionEvent) {
        self.events.emit(event);
    }

    fn mirror(&self) -> Option<Rc<dyn CollectionMirror>> {
        self.mirror.borrow().clone()
    }

    pub(crate) fn report(&self, err: BindError) {
        warn!(path = %self.remote.path(), error = %err, "collection sync error");
        self.emit(CollectionEvent::Error(err));
    }

    pub(crate) fn set_state(&self, state: CollectionState) {
        self.state.set(state);
    }

    pub(crate) fn get(&self, id: &str) -> Option<Entity> {
        self.list.borrow().get(id)
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.list.borrow().ids()
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Array(
            self.list
                .borrow()
                .entities()
                .iter()
                .map(|e| Value::Object(e.to_json()))
                .collect(),
        )
    }

    /// Insert an entity, or merge it into the member with the same id.
    /// Returns the member.
    pub(crate) fn add_member(self: &Rc<Self>, entity: Entity, silent: bool) -> Entity {
        let Some(id) = entity.id() else {
            warn!("refusing to add an entity without an id");
            return entity;
        };
        if let Some(existing) = self.get(&id) {
            if !existing.ptr_eq(&entity) {
                existing.set(entity.to_json());
            }
            return existing;
        }

        let weak = Rc::downgrade(self);
        let member = entity.clone();
        let subscription = entity.subscribe(move |event| {
            if let Some(core) = weak.upgrade() {
                core.on_member_event(&member, event);
            }
        });
        self.list
            .borrow_mut()
            .insert(Member::new(entity.clone(), subscription));

        if !silent {
            self.emit(CollectionEvent::Add {
                entity: entity.clone(),
            });
        }
        entity
    }

    pub(crate) fn remove_member(&self, id: &str, silent: bool) -> Option<Entity> {
        let removed = self.list.borrow_mut().remove(id)?;
        let entity = removed.entity.clone();
        drop(removed);
        if !silent {
            self.emit(CollectionEvent::Remove {
                entity: entity.clone(),
            });
        }
        Some(entity)
    }

    /// Replace every member. Emits `Reset` unless silent.
    pub(crate) fn reset_members(self: &Rc<Self>, entities: Vec<Entity>, silent: bool) -> Vec<Entity> {
        let old = self.list.borrow_mut().drain();
        drop(old);
        let members = entities
            .into_iter()
            .map(|entity| self.add_member(entity, true))
            .collect();
        if !silent {
            self.emit(CollectionEvent::Reset);
        }
        members
    }

    /// Apply remote attributes to an existing member without echoing them.
    pub(crate) fn apply_remote(&self, entity: &Entity, attrs: Attributes) {
        let _phase = entity.enter_phase(SyncPhase::ApplyingRemote);
        entity.set_remote_attributes(attrs.clone());
        entity.reconcile(attrs, SetOptions::default());
    }

    /// Re-sort a member after its ordering key changed.
    pub(crate) fn reposition(&self, id: &str) -> bool {
        self.list.borrow_mut().reposition(id)
    }

    fn on_member_event(self: &Rc<Self>, entity: &Entity, event: EntityEvent) {
        match event {
            EntityEvent::Change { changed } => {
                self.emit(CollectionEvent::Change {
                    entity: entity.clone(),
                    changed: changed.clone(),
                });
                if entity.phase().suppresses_outbound() {
                    return;
                }
                if let Some(mirror) = self.mirror() {
                    mirror.handle_local_change(self, entity, &changed);
                }
            }
            EntityEvent::Destroy { options } => {
                self.emit(CollectionEvent::Destroy {
                    entity: entity.clone(),
                });
                if let Some(mirror) = self.mirror() {
                    mirror.handle_local_destroy(self, entity, options);
                }
            }
        }
    }
}

impl Drop for CollectionCore {
    fn drop(&mut self) {
        if let Some(mirror) = self.mirror.get_mut().take() {
            mirror.teardown(self.remote.as_ref());
        }
    }
}

/// Ensure an entity has an id, drawing one from the container's push-id
/// generator when it has none.
pub(crate) fn ensure_id(container: &dyn RemoteRef, entity: &Entity) -> String {
    if let Some(id) = entity.id() {
        return id;
    }
    let id = container.push().key().unwrap_or_default();
    let mut attrs = Attributes::new();
    crate::entity::assign_id(&mut attrs, &id);
    entity.set_with(attrs, SetOptions::silent());
    id
}

/// An ordered set of entities kept in sync with a remote container.
#[derive(Clone)]
pub struct Collection {
    core: Rc<CollectionCore>,
}

impl Collection {
    pub fn new(config: BindConfig) -> Result<Self> {
        let remote = config.resolve_ref()?;
        let mode = config.mode();
        let core = Rc::new(CollectionCore {
            remote,
            echoes: SilentEchoes::new(),
            initial: SyncGate::default(),
            state: Cell::new(CollectionState::Uninitialized),
            mode,
            list: RefCell::new(EntityList::new(config.comparator)),
            events: Rc::new(EventBus::new()),
            mirror: RefCell::new(None),
        });

        let mirror: Rc<dyn CollectionMirror> = match mode {
            SyncMode::Live => Rc::new(LiveCollection::default()),
            SyncMode::Once => Rc::new(OnceCollection),
        };
        *core.mirror.borrow_mut() = Some(Rc::clone(&mirror));

        debug!(path = %core.remote.path(), ?mode, "collection bound");
        mirror.attach(&core);
        Ok(Self { core })
    }

    pub fn remote(&self) -> Rc<dyn RemoteRef> {
        Rc::clone(&self.core.remote)
    }

    pub fn mode(&self) -> SyncMode {
        self.core.mode
    }

    pub fn state(&self) -> CollectionState {
        self.core.state.get()
    }

    pub fn len(&self) -> usize {
        self.core.list.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.core.get(id)
    }

    pub fn at(&self, index: usize) -> Option<Entity> {
        self.core.list.borrow().at(index)
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.core.list.borrow().entities()
    }

    pub fn ids(&self) -> Vec<String> {
        self.core.ids()
    }

    pub fn to_json(&self) -> Vec<Attributes> {
        self.entities().iter().map(Entity::to_json).collect()
    }

    pub fn on(&self, callback: impl Fn(CollectionEvent) + 'static) -> Subscription {
        self.core.events.subscribe(callback)
    }

    /// Add entities. Those without an id get a push-id.
    pub fn add<I, E>(&self, items: I, options: Options) -> Vec<Entity>
    where
        I: IntoIterator<Item = E>,
        E: Into<Entity>,
    {
        let entities = items.into_iter().map(Into::into).collect();
        match self.core.mirror() {
            Some(mirror) => mirror.add(&self.core, entities, options),
            None => Vec::new(),
        }
    }

    /// Add a single entity. `wait` is accepted and ignored.
    pub fn create(&self, item: impl Into<Entity>, options: Options) -> Result<Entity> {
        self.mirror()?.create(&self.core, item.into(), options)
    }

    pub fn remove<I, S>(&self, ids: I, options: Options) -> Vec<Entity>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids = ids.into_iter().map(|id| id.as_ref().to_string()).collect();
        match self.core.mirror() {
            Some(mirror) => mirror.remove(&self.core, ids, options),
            None => Vec::new(),
        }
    }

    /// Replace the whole collection.
    pub fn reset<I, E>(&self, items: I, options: Options) -> Vec<Entity>
    where
        I: IntoIterator<Item = E>,
        E: Into<Entity>,
    {
        let entities = items.into_iter().map(Into::into).collect();
        match self.core.mirror() {
            Some(mirror) => mirror.reset(&self.core, entities, options),
            None => Vec::new(),
        }
    }

    pub fn fetch(&self, options: Options) -> Completion<()> {
        match self.mirror() {
            Ok(mirror) => mirror.fetch(&self.core, options),
            Err(err) => Completion::ready(Err(err)),
        }
    }

    /// Write one member. Ignored on live collections.
    pub fn save(&self, id: &str, options: Options) -> Result<()> {
        self.mirror()?.save(&self.core, id, options)
    }

    fn mirror(&self) -> Result<Rc<dyn CollectionMirror>> {
        self.core.mirror().ok_or(BindError::Cancelled)
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("path", &self.core.remote.path())
            .field("mode", &self.core.mode)
            .field("state", &self.core.state.get())
            .field("ids", &self.ids())
            .finish()
    }
}
