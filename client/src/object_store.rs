//! Identity registry.
//!
//! Guarantees one [`LiveObject`] per identity key. The registry holds weak
//! references, so an object is reclaimed once no application code, outbox
//! entry or include holds it. Entries of reclaimed objects are swept every
//! [`PRUNE_INTERVAL`] registrations and on compaction.

use crate::error::Result;
use crate::object::{LiveObject, ObjectRef, Snapshot};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use stash_engine::{validate_class_name, ClassName, IdentityKey, ObjectId, ObjectState, Pointer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Registrations between sweeps of reclaimed entries.
pub const PRUNE_INTERVAL: usize = 256;

/// Registry of live objects by identity.
#[derive(Debug, Default)]
pub struct ObjectStore {
    /// Saved objects by (class, server id)
    by_server_id: DashMap<(ClassName, String), Weak<LiveObject>>,
    /// Every object by its local token
    by_local_id: DashMap<String, Weak<LiveObject>>,
    /// Local token to server id, for objects promoted in this or an earlier session
    promoted: DashMap<String, String>,
    registrations: AtomicUsize,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new registry wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Return the live instance for `(class_name, object_id)`, creating an
    /// empty one if none exists.
    pub fn get_or_create(&self, class_name: &str, object_id: &str) -> Result<ObjectRef> {
        validate_class_name(class_name)?;
        let key = (class_name.to_string(), object_id.to_string());
        let object = match self.by_server_id.entry(key) {
            Entry::Occupied(mut entry) => match entry.get().upgrade() {
                Some(existing) => return Ok(existing),
                None => {
                    let fresh = Arc::new(LiveObject::new(
                        class_name.to_string(),
                        Some(object_id.to_string()),
                    ));
                    entry.insert(Arc::downgrade(&fresh));
                    fresh
                }
            },
            Entry::Vacant(entry) => {
                let fresh = Arc::new(LiveObject::new(
                    class_name.to_string(),
                    Some(object_id.to_string()),
                ));
                entry.insert(Arc::downgrade(&fresh));
                fresh
            }
        };
        self.by_local_id
            .insert(object.local_id().to_string(), Arc::downgrade(&object));
        self.registered();
        Ok(object)
    }

    /// The canonical instance with no data loaded; never fetches.
    pub fn create_without_data(&self, class_name: &str, object_id: &str) -> Result<ObjectRef> {
        self.get_or_create(class_name, object_id)
    }

    /// A new unsaved object with a fresh local id.
    pub fn create(&self, class_name: &str) -> Result<ObjectRef> {
        validate_class_name(class_name)?;
        let object = Arc::new(LiveObject::new(class_name.to_string(), None));
        self.by_local_id
            .insert(object.local_id().to_string(), Arc::downgrade(&object));
        tracing::debug!(class = %class_name, local_id = %object.local_id(), "Created unsaved object");
        self.registered();
        Ok(object)
    }

    /// Return the unsaved object issued `local_id`, rebuilding it if it was
    /// reclaimed or belongs to an earlier session.
    pub fn restore_local(&self, class_name: &str, local_id: &str) -> Result<ObjectRef> {
        validate_class_name(class_name)?;
        if let Some(server_id) = self.resolve_local_id(local_id) {
            return self.get_or_create(class_name, &server_id);
        }
        let object = match self.by_local_id.entry(local_id.to_string()) {
            Entry::Occupied(mut entry) => match entry.get().upgrade() {
                Some(existing) => existing,
                None => {
                    let fresh = Arc::new(LiveObject::with_local_id(
                        class_name.to_string(),
                        None,
                        local_id.to_string(),
                    ));
                    entry.insert(Arc::downgrade(&fresh));
                    fresh
                }
            },
            Entry::Vacant(entry) => {
                let fresh = Arc::new(LiveObject::with_local_id(
                    class_name.to_string(),
                    None,
                    local_id.to_string(),
                ));
                entry.insert(Arc::downgrade(&fresh));
                fresh
            }
        };
        self.registered();
        Ok(object)
    }

    /// Registered instance for `key`, if one is alive.
    pub fn find(&self, key: &IdentityKey) -> Option<ObjectRef> {
        match &key.id {
            ObjectId::Server(id) => self
                .by_server_id
                .get(&(key.class_name.clone(), id.clone()))
                .and_then(|weak| weak.upgrade()),
            ObjectId::Local(token) => match self.resolve_local_id(token) {
                Some(id) => self.find(&IdentityKey {
                    class_name: key.class_name.clone(),
                    id: ObjectId::Server(id),
                }),
                None => self.by_local_id.get(token).and_then(|weak| weak.upgrade()),
            },
        }
    }

    /// Live unsaved object issued `local_id`, if any.
    pub(crate) fn find_unsaved(&self, local_id: &str) -> Option<ObjectRef> {
        self.by_local_id
            .get(local_id)
            .and_then(|weak| weak.upgrade())
            .filter(|object| !object.is_saved())
    }

    /// Live instance for a pointer, creating or rebuilding it as needed.
    pub fn from_pointer(&self, pointer: &Pointer) -> Result<ObjectRef> {
        match &pointer.object_id {
            ObjectId::Server(id) => self.get_or_create(&pointer.class_name, id),
            ObjectId::Local(token) => self.restore_local(&pointer.class_name, token),
        }
    }

    /// Route a server record through the registry, merging it into the
    /// canonical instance.
    pub fn materialize(&self, state: &ObjectState) -> Result<ObjectRef> {
        let object_id = state.object_id().ok_or_else(|| {
            crate::Error::Type(format!(
                "{} record from the server has no objectId",
                state.class_name()
            ))
        })?;
        let object = self.get_or_create(state.class_name(), object_id)?;
        object.merge_server_state(state);
        Ok(object)
    }

    /// Like [`Self::materialize`] for records read back from the query cache.
    /// A cached record older than the committed state is not merged.
    pub fn materialize_cached(&self, state: &ObjectState) -> Result<ObjectRef> {
        let object_id = state.object_id().ok_or_else(|| {
            crate::Error::Type(format!(
                "cached {} record has no objectId",
                state.class_name()
            ))
        })?;
        let object = self.get_or_create(state.class_name(), object_id)?;
        if !object.merge_if_newer(state) {
            tracing::debug!(class = %state.class_name(), object_id, "Skipped stale cached record");
        }
        Ok(object)
    }

    /// Live instance for a stored record.
    ///
    /// A registered instance is returned as is. Otherwise the committed base
    /// is merged in and the stored edits are replayed onto the overlay.
    pub fn rehydrate(&self, key: &IdentityKey, snapshot: &Snapshot) -> Result<ObjectRef> {
        if let Some(existing) = self.find(key) {
            return Ok(existing);
        }
        let object = match &key.id {
            ObjectId::Server(id) => self.get_or_create(&key.class_name, id)?,
            ObjectId::Local(token) => self.restore_local(&key.class_name, token)?,
        };
        apply_snapshot(&object, snapshot)?;
        Ok(object)
    }

    /// Rebind an unsaved object to its server id. Every holder of the
    /// instance observes the id; lookups by either identity return it.
    pub fn promote(&self, object: &ObjectRef, server_id: &str) {
        object.assign_object_id(server_id);
        self.promoted
            .insert(object.local_id().to_string(), server_id.to_string());

        let key = (object.class_name().to_string(), server_id.to_string());
        if let Some(previous) = self
            .by_server_id
            .insert(key, Arc::downgrade(object))
            .and_then(|weak| weak.upgrade())
        {
            if !Arc::ptr_eq(&previous, object) {
                tracing::warn!(
                    class = %object.class_name(),
                    object_id = %server_id,
                    "Promoted object replaced an instance materialized before the save completed"
                );
            }
        }
        tracing::debug!(
            class = %object.class_name(),
            local_id = %object.local_id(),
            object_id = %server_id,
            "Promoted object"
        );
    }

    /// Record a local to server id mapping loaded from durable storage.
    pub fn register_promotion(&self, local_id: &str, server_id: &str) {
        self.promoted
            .insert(local_id.to_string(), server_id.to_string());
    }

    pub fn resolve_local_id(&self, local_id: &str) -> Option<String> {
        self.promoted.get(local_id).map(|id| id.value().clone())
    }

    /// Drop registry entries whose objects were reclaimed.
    ///
    /// Promotion mappings are kept: queued entries and stored pointers may
    /// still name an object by its local token.
    pub fn prune(&self) {
        self.by_server_id.retain(|_, weak| weak.strong_count() > 0);
        self.by_local_id.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Count a registration; sweep once every [`PRUNE_INTERVAL`].
    /// Must not be called while holding a map entry.
    fn registered(&self) {
        let count = self.registrations.fetch_add(1, Ordering::Relaxed) + 1;
        if count % PRUNE_INTERVAL == 0 {
            self.prune();
        }
    }

    /// Registry entries, live or not yet swept.
    pub fn entry_count(&self) -> usize {
        self.by_local_id.len()
    }

    /// Number of objects currently alive.
    pub fn live_count(&self) -> usize {
        self.by_local_id
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }
}

/// Load a stored snapshot into `object`. Stored edits are replayed onto
/// the overlay unless the object already has edits of its own.
pub(crate) fn apply_snapshot(object: &ObjectRef, snapshot: &Snapshot) -> Result<()> {
    let base = snapshot.base();
    object.merge_server_state(base);
    if snapshot.committed.is_none() || object.is_dirty() {
        return Ok(());
    }
    for (field, value) in snapshot.state.fields() {
        if base.get(field) != Some(value) {
            object.set(field.clone(), value.clone())?;
        }
    }
    for field in base.fields().keys() {
        if !snapshot.state.contains_key(field) {
            object.unset(field.clone())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_instance() {
        let store = ObjectStore::new();
        let a = store.get_or_create("GameScore", "xyz").unwrap();
        let b = store.get_or_create("GameScore", "xyz").unwrap();
        let c = store.create_without_data("GameScore", "xyz").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));

        let other = store.get_or_create("Player", "xyz").unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn reclaimed_when_unreferenced() {
        let store = ObjectStore::new();
        let first = store.get_or_create("GameScore", "xyz").unwrap();
        let first_local = first.local_id().to_string();
        drop(first);
        assert_eq!(store.live_count(), 0);

        let second = store.get_or_create("GameScore", "xyz").unwrap();
        assert_ne!(second.local_id(), first_local);
        store.prune();
        assert_eq!(store.live_count(), 1);
    }

    #[test]
    fn churn_does_not_grow_the_registry() {
        let store = ObjectStore::new();
        let kept = store.create("GameScore").unwrap();
        for i in 0..PRUNE_INTERVAL * 4 {
            drop(store.create("GameScore").unwrap());
            drop(store.get_or_create("GameScore", &format!("s{i}")).unwrap());
        }
        assert!(store.entry_count() <= PRUNE_INTERVAL + 1);
        assert_eq!(store.live_count(), 1);
        assert!(store.find(&kept.identity()).is_some());
    }

    #[test]
    fn promotion_rebinds_identity() {
        let store = ObjectStore::new();
        let obj = store.create("GameScore").unwrap();
        let local_key = obj.identity();

        store.promote(&obj, "abc123");

        let by_server = store.get_or_create("GameScore", "abc123").unwrap();
        assert!(Arc::ptr_eq(&obj, &by_server));
        assert!(Arc::ptr_eq(&obj, &store.find(&local_key).unwrap()));
        assert_eq!(store.resolve_local_id(obj.local_id()).as_deref(), Some("abc123"));
    }

    #[test]
    fn materialize_merges_into_existing() {
        let store = ObjectStore::new();
        let obj = store.get_or_create("GameScore", "s1").unwrap();
        obj.set("player", "local edit").unwrap();

        let server = ObjectState::from_fields("GameScore", [("score", 7)])
            .unwrap()
            .with_object_id("s1");
        let materialized = store.materialize(&server).unwrap();

        assert!(Arc::ptr_eq(&obj, &materialized));
        assert_eq!(obj.get_f64("score"), Some(7.0));
        assert_eq!(obj.get_str("player").as_deref(), Some("local edit"));
    }

    #[test]
    fn materialize_requires_object_id() {
        let store = ObjectStore::new();
        assert!(store.materialize(&ObjectState::new("GameScore")).is_err());
    }

    #[test]
    fn rehydrate_replays_stored_edits() {
        let store = ObjectStore::new();
        let key = IdentityKey::server("GameScore", "s1").unwrap();
        let committed = ObjectState::from_fields("GameScore", [("score", 1)])
            .unwrap()
            .with_object_id("s1");
        let snapshot = Snapshot {
            state: committed.with_field("score", 2).unwrap(),
            committed: Some(committed),
        };

        let obj = store.rehydrate(&key, &snapshot).unwrap();
        assert_eq!(obj.committed_state().get("score").and_then(|v| v.as_f64()), Some(1.0));
        assert_eq!(obj.get_f64("score"), Some(2.0));
        assert!(obj.is_key_dirty("score"));
    }

    #[test]
    fn restore_local_reuses_token() {
        let store = ObjectStore::new();
        let restored = store.restore_local("GameScore", "token-1").unwrap();
        assert_eq!(restored.local_id(), "token-1");
        let again = store.restore_local("GameScore", "token-1").unwrap();
        assert!(Arc::ptr_eq(&restored, &again));
    }
}
