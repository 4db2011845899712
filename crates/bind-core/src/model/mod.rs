//! Model: one entity bound to one remote node.
//!
//! The binding strategy is picked once at construction from the resolved
//! `auto_sync` setting and never changes:
//! - `LiveModel` streams the node and pushes every local change.
//! - `OnceModel` reads and writes only when asked to.
//!
//! Remote listeners and the entity subscription only hold weak references to
//! the shared core, so dropping the last `Model` handle tears the binding down.

mod live;
mod once;

use crate::completion::{Completion, Options, SyncGate};
use crate::config::{BindConfig, SyncMode};
use crate::dispatch::{self, Method};
use crate::entity::{Entity, SetOptions};
use crate::error::{BindError, Result};
use crate::events::{EntityEvent, EventBus, ModelEvent, Subscription};
use crate::identity::resolve_identity;
use crate::remote::{Attributes, RemoteRef, Snapshot};
use crate::suppression::SyncPhase;
use serde::Serialize;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

pub(crate) use live::LiveModel;
pub(crate) use once::OnceModel;

/// Strategy driving one model's synchronization.
pub(crate) trait EntityMirror {
    /// Start listening, if the strategy listens at all.
    fn attach(&self, core: &Rc<ModelCore>);

    /// A snapshot of the node arrived from the remote store.
    fn apply_remote_snapshot(&self, core: &Rc<ModelCore>, snap: Snapshot) -> Result<()>;

    /// The entity changed locally. Never called while a remote apply is running.
    fn handle_local_change(&self, core: &Rc<ModelCore>, changed: &Attributes);

    fn save(&self, core: &Rc<ModelCore>, options: Options) -> Result<()>;

    fn fetch(&self, core: &Rc<ModelCore>, options: Options) -> Completion<()>;

    fn sync(&self, core: &Rc<ModelCore>, method: Method, options: Options)
    -> Result<Completion<Value>>;

    /// Remove every remote listener.
    fn teardown(&self, remote: &dyn RemoteRef);
}

pub(crate) struct ModelCore {
    pub(crate) entity: Entity,
    pub(crate) remote: Rc<dyn RemoteRef>,
    pub(crate) initial: SyncGate,
    events: Rc<EventBus<ModelEvent>>,
    mode: SyncMode,
    defaults: Attributes,
    synced: Cell<bool>,
    mirror: RefCell<Option<Rc<dyn EntityMirror>>>,
    entity_events: RefCell<Option<Subscription>>,
}

impl ModelCore {
    pub(crate) fn emit(&self, event: ModelEvent) {
        self.events.emit(event);
    }

    fn mirror(&self) -> Option<Rc<dyn EntityMirror>> {
        self.mirror.borrow().clone()
    }

    /// Make the entity match a remote snapshot without echoing it back.
    ///
    /// An absent node leaves local attributes alone and only adopts the node
    /// key as id.
    pub(crate) fn apply_snapshot(&self, snap: &Snapshot) -> Result<()> {
        let attrs = resolve_identity(snap)?;
        let _phase = self.entity.enter_phase(SyncPhase::ApplyingRemote);
        self.entity.set_remote_attributes(attrs.clone());

        if snap.exists() {
            self.entity.reconcile(attrs, SetOptions::default());
        } else if self.entity.is_new() && !snap.key().is_empty() {
            self.entity.set_with(attrs, SetOptions::silent());
        }
        Ok(())
    }

    /// A remote-originated settle finished. Defaults land after the first one.
    pub(crate) fn settle(&self) {
        self.emit(ModelEvent::Sync);
        if !self.synced.replace(true) {
            self.apply_defaults();
        }
    }

    pub(crate) fn report(&self, err: BindError) {
        warn!(path = %self.remote.path(), error = %err, "model sync error");
        self.emit(ModelEvent::Error(err));
    }

    fn apply_defaults(&self) {
        let current = self.entity.to_json();
        let missing: Attributes = self
            .defaults
            .iter()
            .filter(|(key, _)| !current.contains_key(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !missing.is_empty() {
            debug!(keys = missing.len(), "applying model defaults");
            self.entity.set(missing);
        }
    }

    fn destroy(&self, options: Options) {
        let item = Value::Object(self.entity.to_json());
        dispatch::issue(
            Method::Delete,
            self.remote.as_ref(),
            Attributes::new(),
            move |outcome| {
                let _ = dispatch::complete_check(outcome.map(|_| ()), &item, &options);
            },
        );
        self.emit(ModelEvent::Destroy);
    }

    fn on_entity_event(self: &Rc<Self>, event: EntityEvent) {
        match event {
            EntityEvent::Change { changed } => {
                self.emit(ModelEvent::Change {
                    changed: changed.clone(),
                });
                if self.entity.phase().suppresses_outbound() {
                    return;
                }
                if let Some(mirror) = self.mirror() {
                    mirror.handle_local_change(self, &changed);
                }
            }
            EntityEvent::Destroy { options } => self.destroy(options),
        }
    }
}

impl Drop for ModelCore {
    fn drop(&mut self) {
        if let Some(mirror) = self.mirror.get_mut().take() {
            mirror.teardown(self.remote.as_ref());
        }
    }
}

/// A single entity kept in sync with one remote node.
#[derive(Clone)]
pub struct Model {
    core: Rc<ModelCore>,
}

impl Model {
    pub fn new(attributes: Attributes, config: BindConfig) -> Result<Self> {
        let remote = config.resolve_ref()?;
        let mode = config.mode();
        let core = Rc::new(ModelCore {
            entity: Entity::new(attributes),
            remote,
            initial: SyncGate::default(),
            events: Rc::new(EventBus::new()),
            mode,
            defaults: config.defaults,
            synced: Cell::new(false),
            mirror: RefCell::new(None),
            entity_events: RefCell::new(None),
        });

        let mirror: Rc<dyn EntityMirror> = match mode {
            SyncMode::Live => Rc::new(LiveModel::default()),
            SyncMode::Once => Rc::new(OnceModel::new(config.write_through)),
        };
        *core.mirror.borrow_mut() = Some(Rc::clone(&mirror));

        let weak = Rc::downgrade(&core);
        let subscription = core.entity.subscribe(move |event| {
            if let Some(core) = weak.upgrade() {
                core.on_entity_event(event);
            }
        });
        *core.entity_events.borrow_mut() = Some(subscription);

        debug!(path = %core.remote.path(), ?mode, "model bound");
        mirror.attach(&core);
        Ok(Self { core })
    }

    /// Build a model from any serializable struct or map.
    pub fn from_value<T: Serialize>(value: &T, config: BindConfig) -> Result<Self> {
        Self::new(crate::entity::attributes(value)?, config)
    }

    pub fn entity(&self) -> &Entity {
        &self.core.entity
    }

    pub fn remote(&self) -> Rc<dyn RemoteRef> {
        Rc::clone(&self.core.remote)
    }

    pub fn mode(&self) -> SyncMode {
        self.core.mode
    }

    pub fn id(&self) -> Option<String> {
        self.core.entity.id()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.core.entity.get(key)
    }

    pub fn set(&self, attrs: Attributes) -> Attributes {
        self.core.entity.set(attrs)
    }

    pub fn set_value(&self, key: &str, value: impl Into<Value>) -> Attributes {
        self.core.entity.set_value(key, value)
    }

    pub fn unset(&self, key: &str) -> Attributes {
        self.core.entity.unset(key)
    }

    pub fn to_json(&self) -> Attributes {
        self.core.entity.to_json()
    }

    pub fn on(&self, callback: impl Fn(ModelEvent) + 'static) -> Subscription {
        self.core.events.subscribe(callback)
    }

    /// True once the first remote state has been applied.
    pub fn synced(&self) -> bool {
        self.core.synced.get()
    }

    /// Write the entity. A no-op on live models.
    pub fn save(&self, options: Options) -> Result<()> {
        self.mirror()?.save(&self.core, options)
    }

    /// Read the node. On live models this waits for the initial sync.
    pub fn fetch(&self, options: Options) -> Completion<()> {
        match self.mirror() {
            Ok(mirror) => mirror.fetch(&self.core, options),
            Err(err) => Completion::ready(Err(err)),
        }
    }

    /// Run a CRUD verb against the node. Ignored on live models.
    pub fn sync(&self, method: Method, options: Options) -> Result<Completion<Value>> {
        self.mirror()?.sync(&self.core, method, options)
    }

    /// Delete the node and emit `Destroy`. The delete is fire-and-forget:
    /// `Destroy` is emitted whether or not the write succeeds.
    pub fn destroy(&self, options: Options) {
        self.core.entity.destroy(options);
    }

    fn mirror(&self) -> Result<Rc<dyn EntityMirror>> {
        self.core.mirror().ok_or(BindError::Cancelled)
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("path", &self.core.remote.path())
            .field("mode", &self.core.mode)
            .field("entity", &self.core.entity)
            .finish()
    }
}
