//! Identity resolution from remote snapshots.

use crate::error::{BindError, Result};
use crate::remote::{Attributes, Snapshot};
use serde_json::Value;

/// Attribute that carries an entity's identity.
pub const ID_KEY: &str = "id";

/// Attribute that carries a node's ordering priority.
pub const PRIORITY_KEY: &str = ".priority";

/// Build an entity bag from a snapshot, with `id` set to the snapshot key.
///
/// - object: copied, id assigned
/// - null: empty bag with only the id ("exists but empty")
/// - primitive: `BindError::InvalidId`, primitives cannot be synced as entities
///
/// A priority carried by the snapshot is exposed under [`PRIORITY_KEY`].
pub fn resolve_identity(snap: &Snapshot) -> Result<Attributes> {
    let mut attrs = match snap.val() {
        Value::Object(map) => map.clone(),
        Value::Null => Attributes::new(),
        _ => {
            return Err(BindError::InvalidId {
                key: snap.key().to_string(),
            });
        }
    };

    attrs.insert(ID_KEY.to_string(), Value::String(snap.key().to_string()));
    if let Some(priority) = snap.priority() {
        attrs.insert(PRIORITY_KEY.to_string(), priority.clone());
    }

    Ok(attrs)
}

/// Read an id attribute as a key. Numbers are accepted and rendered.
pub fn id_of(attrs: &Attributes) -> Option<String> {
    id_from_value(attrs.get(ID_KEY)?)
}

pub(crate) fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
