//! Durable persistence of pinned records and their labels.
//!
//! Each record is stored under its identity key (`obj:<class>:<id>`) as a
//! versioned JSON document holding the record's snapshot and label set.
//! Label read-modify-write is serialized per key.

use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::object::Snapshot;
use crate::storage::DurableStorage;
use serde::{Deserialize, Serialize};
use stash_engine::{IdentityKey, ObjectState, OBJECT_KEY_PREFIX};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

/// Version of the stored record layout.
pub const FORMAT_VERSION: u32 = 1;

/// One persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub format_version: u32,
    #[serde(flatten)]
    pub snapshot: Snapshot,
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

impl StoredObject {
    fn new(snapshot: Snapshot, labels: BTreeSet<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            snapshot,
            labels,
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let stored: StoredObject = serde_json::from_slice(bytes)?;
        if stored.format_version > FORMAT_VERSION {
            return Err(Error::Io(format!(
                "record format version {} is newer than supported version {FORMAT_VERSION}",
                stored.format_version
            )));
        }
        Ok(stored)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn state(&self) -> &ObjectState {
        &self.snapshot.state
    }

    /// Unlabelled and fully synced.
    fn is_reclaimable(&self) -> bool {
        self.labels.is_empty() && !self.snapshot.is_dirty()
    }
}

/// Pinned record store over [`DurableStorage`].
pub struct LocalDatastore {
    storage: Arc<dyn DurableStorage>,
    locks: Arc<KeyedLocks>,
}

impl LocalDatastore {
    pub fn new(storage: Arc<dyn DurableStorage>, locks: Arc<KeyedLocks>) -> Self {
        Self { storage, locks }
    }

    /// Insert or replace a record with exactly `labels`.
    pub async fn put(
        &self,
        key: &IdentityKey,
        state: &ObjectState,
        labels: BTreeSet<String>,
    ) -> Result<()> {
        let storage_key = key.storage_key();
        let _guard = self.locks.lock(&storage_key).await;
        self.write(
            &storage_key,
            &StoredObject::new(Snapshot::clean(state.clone()), labels),
        )
        .await
    }

    pub async fn get(&self, key: &IdentityKey) -> Result<Option<ObjectState>> {
        Ok(self.get_record(key).await?.map(|r| r.snapshot.state))
    }

    /// The full stored record, including labels and committed base.
    pub async fn get_record(&self, key: &IdentityKey) -> Result<Option<StoredObject>> {
        self.read(&key.storage_key()).await
    }

    /// Remove a record regardless of its labels.
    pub async fn delete(&self, key: &IdentityKey) -> Result<()> {
        let storage_key = key.storage_key();
        let _guard = self.locks.lock(&storage_key).await;
        self.storage.delete(&storage_key).await?;
        tracing::debug!(key = %key, "Deleted local record");
        Ok(())
    }

    /// Lazy scan over every record of `class_name` accepted by `predicate`.
    pub fn scan<P>(&self, class_name: &str, predicate: P) -> Scan<'_, P>
    where
        P: FnMut(&IdentityKey, &StoredObject) -> bool,
    {
        Scan {
            datastore: self,
            prefix: IdentityKey::class_prefix(class_name),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            predicate,
        }
    }

    /// Add `label` to a record, storing `snapshot` as its data.
    ///
    /// With no snapshot, existing data is kept, or an empty state is stored
    /// when the record is new.
    pub async fn add_label(
        &self,
        key: &IdentityKey,
        snapshot: Option<Snapshot>,
        label: &str,
    ) -> Result<()> {
        let storage_key = key.storage_key();
        let _guard = self.locks.lock(&storage_key).await;

        let existing = self.read(&storage_key).await?;
        let record = match (existing, snapshot) {
            (Some(mut record), snapshot) => {
                if let Some(snapshot) = snapshot {
                    record.snapshot = snapshot;
                }
                record.labels.insert(label.to_string());
                record
            }
            (None, snapshot) => {
                let snapshot = snapshot.unwrap_or_else(|| Snapshot::clean(empty_state(key)));
                StoredObject::new(snapshot, BTreeSet::from([label.to_string()]))
            }
        };
        self.write(&storage_key, &record).await
    }

    /// Remove `label` from a record.
    ///
    /// When the label set becomes empty and `reclaim` accepts the key, the
    /// record is deleted in the same critical section. A record holding
    /// unsynced edits is never deleted. Returns the remaining labels, or
    /// `None` when no record exists.
    pub async fn remove_label(
        &self,
        key: &IdentityKey,
        label: &str,
        reclaim: impl FnOnce(&IdentityKey) -> bool,
    ) -> Result<Option<BTreeSet<String>>> {
        let storage_key = key.storage_key();
        let _guard = self.locks.lock(&storage_key).await;

        let Some(mut record) = self.read(&storage_key).await? else {
            return Ok(None);
        };
        if !record.labels.remove(label) {
            return Ok(Some(record.labels));
        }
        if record.labels.is_empty() && !record.snapshot.is_dirty() && reclaim(key) {
            self.storage.delete(&storage_key).await?;
            tracing::debug!(key = %key, "Reclaimed unpinned record");
        } else {
            self.write(&storage_key, &record).await?;
        }
        Ok(Some(record.labels))
    }

    pub async fn labels(&self, key: &IdentityKey) -> Result<BTreeSet<String>> {
        Ok(self
            .get_record(key)
            .await?
            .map(|record| record.labels)
            .unwrap_or_default())
    }

    /// Replace the stored data of an existing record, keeping its labels.
    /// Returns false when the record is not stored.
    pub async fn update_snapshot(&self, key: &IdentityKey, snapshot: Snapshot) -> Result<bool> {
        let storage_key = key.storage_key();
        let _guard = self.locks.lock(&storage_key).await;

        let Some(mut record) = self.read(&storage_key).await? else {
            return Ok(false);
        };
        record.snapshot = snapshot;
        self.write(&storage_key, &record).await?;
        Ok(true)
    }

    /// Move a record to a new key, merging labels with any record already
    /// stored there. Used when an unsaved object is promoted.
    pub async fn rekey(&self, from: &IdentityKey, to: &IdentityKey) -> Result<()> {
        let from_key = from.storage_key();
        let to_key = to.storage_key();
        if from_key == to_key {
            return Ok(());
        }
        // Lock in a fixed order
        let (first, second) = if from_key < to_key {
            (&from_key, &to_key)
        } else {
            (&to_key, &from_key)
        };
        let _first = self.locks.lock(first).await;
        let _second = self.locks.lock(second).await;

        let Some(moved) = self.read(&from_key).await? else {
            return Ok(());
        };
        let record = match self.read(&to_key).await? {
            Some(mut existing) => {
                existing.labels.extend(moved.labels);
                existing.snapshot = moved.snapshot;
                existing
            }
            None => moved,
        };
        self.write(&to_key, &record).await?;
        self.storage.delete(&from_key).await?;
        tracing::debug!(from = %from, to = %to, "Moved local record to server identity");
        Ok(())
    }

    /// Keys of every record carrying `label`.
    pub async fn keys_with_label(&self, label: &str) -> Result<Vec<IdentityKey>> {
        let mut keys = Vec::new();
        for (storage_key, bytes) in crate::storage::scan_all(&*self.storage, OBJECT_KEY_PREFIX).await? {
            let record = StoredObject::decode(&bytes)?;
            if record.labels.contains(label) {
                keys.push(IdentityKey::from_storage_key(&storage_key)?);
            }
        }
        Ok(keys)
    }

    /// Delete every record with an empty label set and no unsynced edits
    /// that `protected` does not claim. Returns the number of records deleted.
    pub async fn compact(&self, protected: impl Fn(&IdentityKey) -> bool) -> Result<usize> {
        let mut candidates = Vec::new();
        for (storage_key, bytes) in crate::storage::scan_all(&*self.storage, OBJECT_KEY_PREFIX).await? {
            if StoredObject::decode(&bytes)?.is_reclaimable() {
                candidates.push(IdentityKey::from_storage_key(&storage_key)?);
            }
        }

        let mut reclaimed = 0;
        for key in candidates {
            if protected(&key) {
                continue;
            }
            let storage_key = key.storage_key();
            let _guard = self.locks.lock(&storage_key).await;
            // Re-check under the lock; a pin may have raced the scan
            match self.read(&storage_key).await? {
                Some(record) if record.is_reclaimable() => {
                    self.storage.delete(&storage_key).await?;
                    reclaimed += 1;
                }
                _ => {}
            }
        }
        if reclaimed > 0 {
            tracing::info!(reclaimed, "Compacted local datastore");
        }
        Ok(reclaimed)
    }

    async fn read(&self, storage_key: &str) -> Result<Option<StoredObject>> {
        match self.storage.get(storage_key).await? {
            Some(bytes) => Ok(Some(StoredObject::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, storage_key: &str, record: &StoredObject) -> Result<()> {
        self.storage.put(storage_key, record.encode()?).await
    }
}

fn empty_state(key: &IdentityKey) -> ObjectState {
    let state = ObjectState::new(key.class_name.clone());
    match key.id.server_id() {
        Some(id) => state.with_object_id(id),
        None => state,
    }
}

/// Lazy, finite, restartable iteration over one class.
///
/// Records are read from storage a page at a time in key order; abandoning
/// the scan early leaves nothing behind.
pub struct Scan<'a, P> {
    datastore: &'a LocalDatastore,
    prefix: String,
    cursor: Option<String>,
    buffer: VecDeque<(IdentityKey, StoredObject)>,
    exhausted: bool,
    predicate: P,
}

const SCAN_PAGE: usize = 64;

impl<P> Scan<'_, P>
where
    P: FnMut(&IdentityKey, &StoredObject) -> bool,
{
    /// Next accepted record, or `None` at the end.
    pub async fn next(&mut self) -> Result<Option<(IdentityKey, StoredObject)>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fill().await?;
        }
    }

    /// Collect every remaining accepted record.
    pub async fn collect(mut self) -> Result<Vec<(IdentityKey, StoredObject)>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await? {
            out.push(item);
        }
        Ok(out)
    }

    /// Start again from the first record.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    async fn fill(&mut self) -> Result<()> {
        let page = self
            .datastore
            .storage
            .scan_prefix(&self.prefix, self.cursor.as_deref(), SCAN_PAGE)
            .await?;
        self.exhausted = page.len() < SCAN_PAGE;
        if let Some((last, _)) = page.last() {
            self.cursor = Some(last.clone());
        }
        for (storage_key, bytes) in page {
            let key = IdentityKey::from_storage_key(&storage_key)?;
            let record = StoredObject::decode(&bytes)?;
            if (self.predicate)(&key, &record) {
                self.buffer.push_back((key, record));
            }
        }
        Ok(())
    }
}
