//! Event infrastructure for models and collections.
//!
//! `EventBus<E>` is single-threaded (`Rc` + `RefCell`): the whole binding layer
//! runs on one thread and remote callbacks are delivered on it. Handlers are
//! registered per instance and removed when their `Subscription` drops.

use crate::completion::Options;
use crate::entity::Entity;
use crate::error::BindError;
use crate::remote::Attributes;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// Signals emitted by a bare entity to its owner.
#[derive(Debug, Clone)]
pub enum EntityEvent {
    /// Attributes changed; `changed` holds new values, `null` for removed keys.
    Change { changed: Attributes },
    /// `Entity::destroy` was called; the owner performs the remote delete.
    Destroy { options: Options },
}

/// Signals emitted by a `Model` to application code.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    Change { changed: Attributes },
    /// A remote-originated state settle completed.
    Sync,
    Error(BindError),
    Destroy,
}

impl ModelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ModelEvent::Change { .. } => "change",
            ModelEvent::Sync => "sync",
            ModelEvent::Error(_) => "error",
            ModelEvent::Destroy => "destroy",
        }
    }
}

/// Signals emitted by a `Collection` to application code.
#[derive(Debug, Clone)]
pub enum CollectionEvent {
    Add { entity: Entity },
    Remove { entity: Entity },
    Change { entity: Entity, changed: Attributes },
    Destroy { entity: Entity },
    Reset,
    Sort,
    Sync,
    Error(BindError),
}

impl CollectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CollectionEvent::Add { .. } => "add",
            CollectionEvent::Remove { .. } => "remove",
            CollectionEvent::Change { .. } => "change",
            CollectionEvent::Destroy { .. } => "destroy",
            CollectionEvent::Reset => "reset",
            CollectionEvent::Sort => "sort",
            CollectionEvent::Sync => "sync",
            CollectionEvent::Error(_) => "error",
        }
    }
}

trait Unsubscribe {
    fn unsubscribe(&self, id: usize);
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Weak<dyn Unsubscribe>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

type Callback<E> = Rc<dyn Fn(E)>;

/// Event bus for publishing events to subscribers.
///
/// Wrap in `Rc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RefCell<Vec<(usize, Callback<E>)>>,
    next_id: Cell<usize>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }
}

impl<E: Clone + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Rc`.
    pub fn subscribe(self: &Rc<Self>, callback: impl Fn(E) + 'static) -> Subscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.callbacks.borrow_mut().push((id, Rc::new(callback)));
        let bus: Weak<Self> = Rc::downgrade(self);
        Subscription { bus, id }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the callback list so a callback may subscribe or emit.
        let callbacks: Vec<_> = self
            .callbacks
            .borrow()
            .iter()
            .map(|(_, cb)| Rc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn listener_count(&self) -> usize {
        self.callbacks.borrow().len()
    }
}

impl<E> Unsubscribe for EventBus<E> {
    fn unsubscribe(&self, id: usize) {
        // try_borrow_mut: a Subscription may drop while we are mid-emit.
        if let Ok(mut guard) = self.callbacks.try_borrow_mut() {
            guard.retain(|(i, _)| *i != id);
        }
    }
}
