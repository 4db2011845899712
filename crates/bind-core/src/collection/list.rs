//! Ordered, id-unique member list.

use crate::config::Comparator;
use crate::entity::Entity;
use crate::events::Subscription;
use std::cmp::Ordering;

/// A member and the subscription forwarding its events to the collection.
pub(crate) struct Member {
    pub(crate) entity: Entity,
    _subscription: Subscription,
}

impl Member {
    pub(crate) fn new(entity: Entity, subscription: Subscription) -> Self {
        Self {
            entity,
            _subscription: subscription,
        }
    }
}

pub(crate) struct EntityList {
    members: Vec<Member>,
    comparator: Comparator,
}

impl EntityList {
    pub(crate) fn new(comparator: Comparator) -> Self {
        Self {
            members: Vec::new(),
            comparator,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn position(&self, id: &str) -> Option<usize> {
        self.members
            .iter()
            .position(|m| m.entity.id().as_deref() == Some(id))
    }

    pub(crate) fn get(&self, id: &str) -> Option<Entity> {
        self.position(id).map(|i| self.members[i].entity.clone())
    }

    pub(crate) fn at(&self, index: usize) -> Option<Entity> {
        self.members.get(index).map(|m| m.entity.clone())
    }

    pub(crate) fn entities(&self) -> Vec<Entity> {
        self.members.iter().map(|m| m.entity.clone()).collect()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.members.iter().filter_map(|m| m.entity.id()).collect()
    }

    /// Insert at the comparator position, after any equal members.
    /// The caller guarantees the id is not present yet.
    pub(crate) fn insert(&mut self, member: Member) -> usize {
        let index = self.slot_for(&member.entity);
        self.members.insert(index, member);
        index
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Member> {
        self.position(id).map(|i| self.members.remove(i))
    }

    pub(crate) fn drain(&mut self) -> Vec<Member> {
        std::mem::take(&mut self.members)
    }

    /// Move a member to where the comparator now puts it.
    /// Returns true if its position changed.
    pub(crate) fn reposition(&mut self, id: &str) -> bool {
        if matches!(self.comparator, Comparator::Insertion) {
            return false;
        }
        let Some(old) = self.position(id) else {
            return false;
        };
        let member = self.members.remove(old);
        let new = self.slot_for(&member.entity);
        self.members.insert(new, member);
        old != new
    }

    fn slot_for(&self, entity: &Entity) -> usize {
        match self.comparator {
            Comparator::Insertion => self.members.len(),
            _ => self.members.partition_point(|m| {
                self.comparator.compare(&m.entity, entity) != Some(Ordering::Greater)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn member(value: Value) -> Member {
        let entity = Entity::new(value.as_object().cloned().unwrap());
        let subscription = entity.subscribe(|_| {});
        Member::new(entity, subscription)
    }

    #[test]
    fn test_sorted_by_id() {
        let mut list = EntityList::new(Comparator::Id);
        list.insert(member(json!({"id": "b"})));
        list.insert(member(json!({"id": "c"})));
        list.insert(member(json!({"id": "a"})));

        assert_eq!(list.ids(), vec!["a", "b", "c"]);
        assert_eq!(list.position("c"), Some(2));
        assert_eq!(list.at(0).and_then(|e| e.id()).as_deref(), Some("a"));
    }

    #[test]
    fn test_insertion_order() {
        let mut list = EntityList::new(Comparator::Insertion);
        list.insert(member(json!({"id": "b"})));
        list.insert(member(json!({"id": "a"})));
        assert_eq!(list.ids(), vec!["b", "a"]);
    }

    #[test]
    fn test_remove_and_lookup() {
        let mut list = EntityList::new(Comparator::Id);
        list.insert(member(json!({"id": "a", "n": 1})));
        list.insert(member(json!({"id": "b", "n": 2})));

        assert_eq!(list.get("b").and_then(|e| e.get("n")), Some(json!(2)));
        let removed = list.remove("a").unwrap();
        assert_eq!(removed.entity.id().as_deref(), Some("a"));
        assert!(list.get("a").is_none());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_reposition_after_priority_change() {
        let mut list = EntityList::new(Comparator::Priority);
        list.insert(member(json!({"id": "a", ".priority": 1})));
        list.insert(member(json!({"id": "b", ".priority": 2})));

        let b = list.get("b").unwrap();
        b.set_value(".priority", 0);

        assert!(list.reposition("b"));
        assert_eq!(list.ids(), vec!["b", "a"]);
        assert!(!list.reposition("b"));
    }
}
