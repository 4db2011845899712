//! bind-core: two-way binding between observable models/collections and a
//! hierarchical real-time store.
//!
//! This crate provides:
//! - `Model`, one entity bound to one remote node
//! - `Collection`, an ordered id-unique set of entities bound to a container
//! - Continuous (`auto_sync`) and on-demand binding strategies for both
//! - The `RemoteRef` contract the store must honour, plus an in-memory store
//!
//! Everything runs on one thread. Remote callbacks, local mutations and the
//! outbound writes they trigger all happen on the caller's thread.

pub mod collection;
pub mod completion;
pub mod config;
pub mod diff;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod events;
pub mod identity;
pub mod memory;
pub mod model;
pub mod push_id;
pub mod remote;
pub mod suppression;

pub use collection::{Collection, CollectionState};
pub use completion::{Completion, Options};
pub use config::{BindConfig, Comparator, RefSource, SyncMode};
pub use diff::diff_attributes;
pub use dispatch::{Binding, Method};
pub use entity::{Entity, SetOptions};
pub use error::{BindError, Result};
pub use events::{CollectionEvent, EntityEvent, EventBus, ModelEvent, Subscription};
pub use identity::{ID_KEY, PRIORITY_KEY, resolve_identity};
pub use memory::{InMemoryStore, MemoryRef, WriteOp};
pub use model::Model;
pub use push_id::{PushId, PushIdError, PushIdGenerator};
pub use remote::{Attributes, ChildEvent, Connector, RemoteError, RemoteRef, Snapshot};
pub use suppression::SyncPhase;
