//! Binding configuration.
//!
//! Every `Model` and `Collection` is built from a `BindConfig`. The only
//! required piece is the remote location; everything else has a default.

use crate::entity::Entity;
use crate::error::{BindError, Result};
use crate::identity::PRIORITY_KEY;
use crate::remote::{Attributes, Connector, RemoteRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

/// Where a binding's remote node comes from.
#[derive(Clone)]
pub enum RefSource {
    /// Resolved through the configured `Connector`.
    Url(String),
    /// An already-built reference.
    Ref(Rc<dyn RemoteRef>),
    /// Evaluated once at construction. Must not return another thunk.
    Thunk(Rc<dyn Fn() -> RefSource>),
}

impl RefSource {
    pub fn thunk(f: impl Fn() -> RefSource + 'static) -> Self {
        RefSource::Thunk(Rc::new(f))
    }
}

impl From<&str> for RefSource {
    fn from(url: &str) -> Self {
        RefSource::Url(url.to_string())
    }
}

impl From<String> for RefSource {
    fn from(url: String) -> Self {
        RefSource::Url(url)
    }
}

impl From<Rc<dyn RemoteRef>> for RefSource {
    fn from(remote: Rc<dyn RemoteRef>) -> Self {
        RefSource::Ref(remote)
    }
}

impl fmt::Debug for RefSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            RefSource::Ref(remote) => f.debug_tuple("Ref").field(&remote.path()).finish(),
            RefSource::Thunk(_) => f.write_str("Thunk"),
        }
    }
}

/// Continuous mirroring or on-demand reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Live,
    Once,
}

impl SyncMode {
    /// Instance setting wins over the class default, which wins over `true`.
    pub fn resolve(instance: Option<bool>, class: Option<bool>) -> Self {
        if instance.or(class).unwrap_or(true) {
            SyncMode::Live
        } else {
            SyncMode::Once
        }
    }

    pub fn is_live(self) -> bool {
        self == SyncMode::Live
    }
}

pub type CompareFn = Rc<dyn Fn(&Entity, &Entity) -> Ordering>;

/// Ordering of collection members.
#[derive(Clone, Default)]
pub enum Comparator {
    /// By id; members without an id sort last.
    #[default]
    Id,
    /// By `.priority` (absent first, then numbers, then strings), then id.
    Priority,
    /// Keep insertion order.
    Insertion,
    Custom(CompareFn),
}

impl Comparator {
    pub fn custom(f: impl Fn(&Entity, &Entity) -> Ordering + 'static) -> Self {
        Comparator::Custom(Rc::new(f))
    }

    /// `None` when the comparator keeps insertion order.
    pub(crate) fn compare(&self, a: &Entity, b: &Entity) -> Option<Ordering> {
        match self {
            Comparator::Id => Some(compare_ids(a, b)),
            Comparator::Priority => Some(
                compare_priority(a.get(PRIORITY_KEY).as_ref(), b.get(PRIORITY_KEY).as_ref())
                    .then_with(|| compare_ids(a, b)),
            ),
            Comparator::Insertion => None,
            Comparator::Custom(f) => Some(f(a, b)),
        }
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparator::Id => f.write_str("Id"),
            Comparator::Priority => f.write_str("Priority"),
            Comparator::Insertion => f.write_str("Insertion"),
            Comparator::Custom(_) => f.write_str("Custom"),
        }
    }
}

fn compare_ids(a: &Entity, b: &Entity) -> Ordering {
    match (a.id(), b.id()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Priority order of the hierarchical store: absent, numbers, strings.
pub(crate) fn compare_priority(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn class(p: Option<&Value>) -> u8 {
        match p {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(_) => 2,
        }
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or_default(), y.as_f64().unwrap_or_default());
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => class(a).cmp(&class(b)),
    }
}

/// Configuration for a `Model` or `Collection`.
#[derive(Clone, Default)]
pub struct BindConfig {
    /// Remote location. Required.
    pub url: Option<RefSource>,
    /// Per-instance mode override.
    pub auto_sync: Option<bool>,
    /// Default mode for the type being built.
    pub default_auto_sync: Option<bool>,
    /// Applied to a model after its first sync, for absent keys only.
    pub defaults: Attributes,
    /// Member order for collections.
    pub comparator: Comparator,
    /// On-demand models push each change immediately instead of on `save`.
    pub write_through: bool,
    connector: Option<Rc<dyn Connector>>,
}

impl BindConfig {
    pub fn new(url: impl Into<RefSource>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<RefSource>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Rc::new(connector));
        self
    }

    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = Some(auto_sync);
        self
    }

    pub fn with_default_auto_sync(mut self, auto_sync: bool) -> Self {
        self.default_auto_sync = Some(auto_sync);
        self
    }

    pub fn with_defaults(mut self, defaults: Attributes) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn with_write_through(mut self, write_through: bool) -> Self {
        self.write_through = write_through;
        self
    }

    pub fn mode(&self) -> SyncMode {
        SyncMode::resolve(self.auto_sync, self.default_auto_sync)
    }

    /// Resolve the configured location into a reference.
    pub fn resolve_ref(&self) -> Result<Rc<dyn RemoteRef>> {
        match &self.url {
            None => Err(BindError::MissingUrl),
            Some(RefSource::Thunk(thunk)) => match thunk() {
                RefSource::Thunk(_) => Err(BindError::InvalidUrl(
                    "url thunk returned another thunk".into(),
                )),
                source => self.resolve_source(&source),
            },
            Some(source) => self.resolve_source(source),
        }
    }

    fn resolve_source(&self, source: &RefSource) -> Result<Rc<dyn RemoteRef>> {
        match source {
            RefSource::Ref(remote) => Ok(Rc::clone(remote)),
            RefSource::Url(url) if url.trim().is_empty() => {
                Err(BindError::InvalidUrl("empty url".into()))
            }
            RefSource::Url(url) => match &self.connector {
                Some(connector) => connector.connect(url),
                None => Err(BindError::MissingConnector(url.clone())),
            },
            RefSource::Thunk(_) => Err(BindError::InvalidUrl("nested url thunk".into())),
        }
    }
}

impl fmt::Debug for BindConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindConfig")
            .field("url", &self.url)
            .field("auto_sync", &self.auto_sync)
            .field("default_auto_sync", &self.default_auto_sync)
            .field("defaults", &self.defaults)
            .field("comparator", &self.comparator)
            .field("write_through", &self.write_through)
            .field("connector", &self.connector.is_some())
            .finish()
    }
}
