//! Scene Object Store
//!
//! Authoritative in-process map from object ID to the single current
//! version of that object. Writes always replace the whole object.

use std::collections::HashMap;

use crate::object::{ObjectId, SyncedObject, UserId};

/// Map of live synchronized objects
#[derive(Debug, Default)]
pub struct SceneStore {
    objects: HashMap<ObjectId, SyncedObject>,
}

impl SceneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object, returning the previous version
    pub fn put(&mut self, obj: SyncedObject) -> Option<SyncedObject> {
        self.objects.insert(obj.id.clone(), obj)
    }

    pub fn get(&self, id: &ObjectId) -> Option<&SyncedObject> {
        self.objects.get(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Remove an object; removing an absent ID is a no-op
    pub fn remove(&mut self, id: &ObjectId) -> Option<SyncedObject> {
        self.objects.remove(id)
    }

    /// Snapshot of every object
    pub fn all(&self) -> Vec<SyncedObject> {
        self.objects.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncedObject> {
        self.objects.values()
    }

    /// IDs of every object owned by a member
    pub fn owned_by(&self, owner: &UserId) -> Vec<ObjectId> {
        self.objects
            .values()
            .filter(|obj| obj.is_owned_by(owner))
            .map(|obj| obj.id.clone())
            .collect()
    }

    /// Swap the whole contents, returning what was there before
    pub fn replace_all(
        &mut self,
        objects: impl IntoIterator<Item = SyncedObject>,
    ) -> HashMap<ObjectId, SyncedObject> {
        let fresh = objects
            .into_iter()
            .map(|obj| (obj.id.clone(), obj))
            .collect();
        std::mem::replace(&mut self.objects, fresh)
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;
    use glam::DVec3;

    fn object(id: &str, owner: &str, timestamp: u64) -> SyncedObject {
        SyncedObject::new(
            ObjectId::new(id),
            ObjectKind::Box,
            DVec3::ZERO,
            UserId::new(owner),
            timestamp,
        )
    }

    #[test]
    fn test_put_replaces_whole_object() {
        let mut store = SceneStore::new();
        store.put(object("a", "alice", 1).with_material("oak"));

        let previous = store.put(object("a", "alice", 2));
        assert_eq!(previous.unwrap().timestamp, 1);

        let current = store.get(&ObjectId::new("a")).unwrap();
        assert_eq!(current.timestamp, 2);
        assert!(current.material_ref.is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut store = SceneStore::new();
        store.put(object("a", "alice", 1));

        assert!(store.remove(&ObjectId::new("a")).is_some());
        assert!(store.remove(&ObjectId::new("a")).is_none());
        assert!(store.remove(&ObjectId::new("never")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_owned_by() {
        let mut store = SceneStore::new();
        store.put(object("a", "alice", 1));
        store.put(object("b", "bob", 1));
        store.put(object("c", "alice", 1));

        let mut owned = store.owned_by(&UserId::new("alice"));
        owned.sort();
        assert_eq!(owned, vec![ObjectId::new("a"), ObjectId::new("c")]);
    }

    #[test]
    fn test_replace_all() {
        let mut store = SceneStore::new();
        store.put(object("a", "alice", 1));

        let old = store.replace_all(vec![object("b", "bob", 2), object("c", "bob", 3)]);
        assert!(old.contains_key(&ObjectId::new("a")));
        assert!(!store.contains(&ObjectId::new("a")));
        assert_eq!(store.len(), 2);
        assert_eq!(store.all().len(), 2);
    }
}
