//! Attribute diffing between the last-known remote state and local state.
//!
//! Patches produced here are meant for a merge-write: a key mapped to `null`
//! deletes that key remotely, every other key is overwritten.

use crate::identity::{ID_KEY, PRIORITY_KEY};
use crate::remote::Attributes;
use serde_json::Value;

/// Minimal merge patch turning `remote` into `local`.
///
/// - key only in `remote`: `null`
/// - key in both with different values: local value
/// - key only in `local`: local value
/// - identical: omitted
pub fn diff_attributes(remote: &Attributes, local: &Attributes) -> Attributes {
    let mut patch = Attributes::new();

    for key in remote.keys() {
        if !local.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    for (key, value) in local {
        if remote.get(key) != Some(value) {
            patch.insert(key.clone(), value.clone());
        }
    }

    patch
}

/// Patch for a set of changed attributes on a continuously mirrored model.
///
/// Removed or nulled keys become explicit `null` deletes, except the id
/// attribute which is never deleted remotely, only omitted.
pub fn changed_patch(changed: &Attributes) -> Attributes {
    changed
        .iter()
        .filter(|(key, value)| !(value.is_null() && key.as_str() == ID_KEY))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Whether a patch touches the ordering priority.
pub fn touches_priority(patch: &Attributes) -> bool {
    patch.contains_key(PRIORITY_KEY)
}

/// Strip the priority attribute from a payload, returning it.
pub fn split_priority(attrs: &mut Attributes) -> Option<Value> {
    attrs.remove(PRIORITY_KEY)
}
