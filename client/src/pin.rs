//! Label-based retention of records in the local datastore.
//!
//! Pinning is recursive: every object reachable through pointer fields is
//! stored under the same label. Unpinning touches only the named object.

use crate::datastore::LocalDatastore;
use crate::error::{Error, Result};
use crate::object::ObjectRef;
use crate::object_store::ObjectStore;
use stash_engine::{IdentityKey, Pointer};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Label used when none is given.
pub const DEFAULT_PIN: &str = "_default";

/// Label held by records with queued outbox entries.
pub const OUTBOX_PIN: &str = "__outbox";

/// Label prefix reserved for internal retention.
const RESERVED_PREFIX: &str = "__";

pub struct PinManager {
    datastore: Arc<LocalDatastore>,
    objects: Arc<ObjectStore>,
}

impl PinManager {
    pub fn new(datastore: Arc<LocalDatastore>, objects: Arc<ObjectStore>) -> Self {
        Self { datastore, objects }
    }

    /// Pin `object` and everything it points to under `label`.
    ///
    /// Returns the number of records stored.
    pub async fn pin(&self, object: &ObjectRef, label: &str) -> Result<usize> {
        self.pin_all(std::slice::from_ref(object), label).await
    }

    /// Pin every object in `objects`, recursively, under `label`.
    pub async fn pin_all(&self, objects: &[ObjectRef], label: &str) -> Result<usize> {
        check_label(label)?;
        let reachable = self.reachable(objects)?;
        for object in &reachable {
            self.store(object, label).await?;
        }
        tracing::debug!(label = %label, records = reachable.len(), "Pinned objects");
        Ok(reachable.len())
    }

    /// Pin one object, without its children, under an internal label.
    pub(crate) async fn pin_shallow(&self, object: &ObjectRef, label: &str) -> Result<()> {
        self.store(object, label).await
    }

    /// Remove `label` from one object. Children are left as they are.
    pub async fn unpin(&self, object: &ObjectRef, label: &str) -> Result<()> {
        check_label(label)?;
        self.unpin_key(&object.identity(), label).await
    }

    pub async fn unpin_all(&self, objects: &[ObjectRef], label: &str) -> Result<()> {
        check_label(label)?;
        for object in objects {
            self.unpin_key(&object.identity(), label).await?;
        }
        Ok(())
    }

    /// Remove `label` from every record carrying it.
    ///
    /// Returns the number of records the label was removed from.
    pub async fn unpin_label(&self, label: &str) -> Result<usize> {
        check_label(label)?;
        self.release_label(label).await
    }

    pub(crate) async fn release_label(&self, label: &str) -> Result<usize> {
        let keys = self.datastore.keys_with_label(label).await?;
        for key in &keys {
            self.unpin_key(key, label).await?;
        }
        tracing::debug!(label = %label, records = keys.len(), "Unpinned label");
        Ok(keys.len())
    }

    pub(crate) async fn unpin_key(&self, key: &IdentityKey, label: &str) -> Result<()> {
        // Edits made since pinning are written first so they outlive the object
        if let Some(object) = self.objects.find(key).filter(|o| o.is_dirty()) {
            self.datastore.update_snapshot(key, object.snapshot()).await?;
        }
        self.datastore
            .remove_label(key, label, |key| !self.is_protected(key))
            .await?;
        Ok(())
    }

    /// Labels currently held by `object`.
    pub async fn labels(&self, object: &ObjectRef) -> Result<BTreeSet<String>> {
        self.datastore.labels(&object.identity()).await
    }

    /// Reclaim every unlabelled record that is no longer protected.
    pub async fn compact(&self) -> Result<usize> {
        self.datastore.compact(|key| self.is_protected(key)).await
    }

    /// A live object with unsaved edits keeps its record. Records whose
    /// stored snapshot is dirty are kept by the datastore itself.
    fn is_protected(&self, key: &IdentityKey) -> bool {
        self.objects
            .find(key)
            .is_some_and(|object| object.is_dirty())
    }

    async fn store(&self, object: &ObjectRef, label: &str) -> Result<()> {
        let snapshot = object.is_data_available().then(|| object.snapshot());
        self.datastore
            .add_label(&object.identity(), snapshot, label)
            .await
    }

    /// Objects reachable from `roots` through pointer fields, each once.
    fn reachable(&self, roots: &[ObjectRef]) -> Result<Vec<ObjectRef>> {
        let mut visited: HashSet<IdentityKey> = HashSet::new();
        let mut out = Vec::new();
        let mut stack: Vec<ObjectRef> = roots.iter().rev().cloned().collect();

        while let Some(object) = stack.pop() {
            if !visited.insert(object.identity()) {
                continue;
            }
            let state = object.state();
            let mut pointers: Vec<Pointer> = Vec::new();
            for value in state.fields().values() {
                value.for_each_pointer(&mut |p| pointers.push(p.clone()));
            }
            for pointer in pointers.iter().rev() {
                let child = self.objects.from_pointer(pointer)?;
                if !visited.contains(&child.identity()) {
                    stack.push(child);
                }
            }
            out.push(object);
        }
        Ok(out)
    }
}

fn check_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(Error::state("pin label must not be empty"));
    }
    if label.starts_with(RESERVED_PREFIX) {
        return Err(Error::state(format!("pin label {label:?} is reserved")));
    }
    Ok(())
}
