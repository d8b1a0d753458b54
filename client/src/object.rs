//! Live, identity-bearing records.
//!
//! A [`LiveObject`] is the single in-process instance for one identity key.
//! It holds the last committed [`ObjectState`], the batches submitted for
//! saving but not yet confirmed, and the overlay of edits not yet submitted.
//! Edits only ever touch the overlay; the committed state changes when a
//! save is confirmed or server data is merged in.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stash_engine::{
    ClassName, FieldOperation, GeoPoint, IdentityKey, ObjectId, ObjectState, OperationSet,
    Pointer, Value,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Shared handle to a live object.
pub type ObjectRef = Arc<LiveObject>;

/// What the local datastore keeps for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Estimated state: committed data with every pending edit applied
    pub state: ObjectState,
    /// Committed state, present only when pending edits exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed: Option<ObjectState>,
}

impl Snapshot {
    pub fn clean(state: ObjectState) -> Self {
        Self {
            state,
            committed: None,
        }
    }

    /// True when the record carries edits the server has not confirmed.
    pub fn is_dirty(&self) -> bool {
        self.committed.is_some()
    }

    /// The state server data should be merged onto.
    pub fn base(&self) -> &ObjectState {
        self.committed.as_ref().unwrap_or(&self.state)
    }
}

#[derive(Debug)]
struct Inner {
    server_id: Option<String>,
    committed: ObjectState,
    /// Submitted batches awaiting confirmation, oldest first
    pending: VecDeque<OperationSet>,
    /// Edits not yet submitted
    current: OperationSet,
    deleted: bool,
    save_in_progress: bool,
    /// Pointer targets resolved by query includes, by field
    included: BTreeMap<String, Vec<ObjectRef>>,
}

/// The canonical in-memory instance of one record.
#[derive(Debug)]
pub struct LiveObject {
    class_name: ClassName,
    local_id: String,
    inner: Mutex<Inner>,
}

fn new_batch() -> OperationSet {
    OperationSet::new(uuid::Uuid::new_v4().to_string())
}

impl LiveObject {
    pub(crate) fn new(class_name: ClassName, server_id: Option<String>) -> Self {
        Self::with_local_id(class_name, server_id, uuid::Uuid::new_v4().to_string())
    }

    /// Rebuild an unsaved object under a local id issued by an earlier session.
    pub(crate) fn with_local_id(
        class_name: ClassName,
        server_id: Option<String>,
        local_id: String,
    ) -> Self {
        let mut committed = ObjectState::new(class_name.clone());
        if let Some(id) = &server_id {
            committed = committed.with_object_id(id.clone());
        }
        Self {
            class_name,
            local_id,
            inner: Mutex::new(Inner {
                server_id,
                committed,
                pending: VecDeque::new(),
                current: new_batch(),
                deleted: false,
                save_in_progress: false,
                included: BTreeMap::new(),
            }),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Server-assigned id, once the first save has completed.
    pub fn object_id(&self) -> Option<String> {
        self.inner.lock().server_id.clone()
    }

    /// Process-local token naming this object until it is saved.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Key serializing remote writes of this object; stable across promotion.
    pub(crate) fn lock_key(&self) -> String {
        format!("live:{}", self.local_id)
    }

    pub fn is_saved(&self) -> bool {
        self.inner.lock().server_id.is_some()
    }

    /// Current identity: the server id once assigned, the local token before.
    pub fn identity(&self) -> IdentityKey {
        IdentityKey {
            class_name: self.class_name.clone(),
            id: self.object_id_or_local(),
        }
    }

    fn object_id_or_local(&self) -> ObjectId {
        match self.object_id() {
            Some(id) => ObjectId::Server(id),
            None => ObjectId::Local(self.local_id.clone()),
        }
    }

    /// Pointer to this object, suitable as a field value.
    pub fn pointer(&self) -> Pointer {
        Pointer::new(self.class_name.clone(), self.object_id_or_local())
    }

    /// Estimated state: committed data with every pending edit applied.
    pub fn state(&self) -> ObjectState {
        estimate(&self.inner.lock())
    }

    /// Last state confirmed by the server.
    pub fn committed_state(&self) -> ObjectState {
        self.inner.lock().committed.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        let state = estimate(&inner);
        let committed = is_dirty(&inner).then(|| inner.committed.clone());
        Snapshot { state, committed }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().committed.created_at()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().committed.updated_at()
    }

    /// True when the object carries committed data or local edits.
    pub fn is_data_available(&self) -> bool {
        let inner = self.inner.lock();
        !inner.committed.fields().is_empty() || inner.committed.updated_at().is_some()
            || is_dirty(&inner)
    }

    /// True while edits exist that the server has not confirmed.
    pub fn is_dirty(&self) -> bool {
        is_dirty(&self.inner.lock())
    }

    /// True while `key` has an unconfirmed edit.
    pub fn is_key_dirty(&self, key: &str) -> bool {
        let inner = self.inner.lock();
        inner.current.contains_key(key) || inner.pending.iter().any(|b| b.contains_key(key))
    }

    /// True while a synchronous save of this object is running.
    pub(crate) fn is_saving(&self) -> bool {
        self.inner.lock().save_in_progress
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.lock().deleted
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state().lookup(key).map(|v| v.into_owned())
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_date(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get(key).and_then(|v| v.as_date())
    }

    pub fn get_pointer(&self, key: &str) -> Option<Pointer> {
        self.get(key).and_then(|v| v.as_pointer().cloned())
    }

    pub fn get_geo_point(&self, key: &str) -> Option<GeoPoint> {
        self.get(key).and_then(|v| v.as_geo_point())
    }

    pub fn get_array(&self, key: &str) -> Option<Vec<Value>> {
        self.get(key).and_then(|v| v.as_array().map(<[Value]>::to_vec))
    }

    /// Objects resolved for `key` by a query include, in field order.
    pub fn included(&self, key: &str) -> Vec<ObjectRef> {
        self.inner
            .lock()
            .included
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.record(key.into(), FieldOperation::Set {
            value: value.into(),
        })
    }

    pub fn increment(&self, key: impl Into<String>, amount: f64) -> Result<()> {
        self.record(key.into(), FieldOperation::Increment { amount })
    }

    pub fn add(&self, key: impl Into<String>, objects: Vec<Value>) -> Result<()> {
        self.record(key.into(), FieldOperation::Add { objects })
    }

    pub fn add_unique(&self, key: impl Into<String>, objects: Vec<Value>) -> Result<()> {
        self.record(key.into(), FieldOperation::AddUnique { objects })
    }

    pub fn remove(&self, key: impl Into<String>, objects: Vec<Value>) -> Result<()> {
        self.record(key.into(), FieldOperation::Remove { objects })
    }

    pub fn unset(&self, key: impl Into<String>) -> Result<()> {
        self.record(key.into(), FieldOperation::Delete)
    }

    fn record(&self, key: String, op: FieldOperation) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.deleted {
            return Err(Error::state(format!("{} has been deleted", self.class_name)));
        }
        // Reject edits that cannot apply to the current estimate
        let estimated = estimate(&inner);
        op.apply(estimated.get(&key))?;
        inner.current.record(key.clone(), op)?;
        inner.included.remove(&key);
        Ok(())
    }

    /// Mark the start of a synchronous save.
    ///
    /// An unsaved object allows one save at a time; its id is not known until
    /// that save completes.
    pub(crate) fn begin_save(self: &Arc<Self>) -> Result<SaveAttempt> {
        let mut inner = self.inner.lock();
        if inner.deleted {
            return Err(Error::state(format!("{} has been deleted", self.class_name)));
        }
        if inner.server_id.is_none() && inner.save_in_progress {
            return Err(Error::state("save in progress"));
        }
        inner.save_in_progress = true;
        let batch = take_batch(&mut inner);
        Ok(SaveAttempt {
            object: Arc::clone(self),
            batch,
            finished: false,
        })
    }

    /// Move the overlay into the pending queue and return it.
    pub(crate) fn take_batch(&self) -> OperationSet {
        take_batch(&mut self.inner.lock())
    }

    /// Put a batch recovered from durable storage back into the pending queue.
    pub(crate) fn restore_pending(&self, batch: OperationSet) {
        let mut inner = self.inner.lock();
        if !inner.pending.iter().any(|b| b.id == batch.id) {
            inner.pending.push_back(batch);
        }
    }

    /// Apply a confirmed batch and the server's response to the committed state.
    pub(crate) fn confirm_batch(&self, batch_id: &str, response: &ObjectState) {
        let mut inner = self.inner.lock();
        let batch = remove_pending(&mut inner, batch_id);
        let base = match batch {
            Some(batch) => match batch.apply_to(&inner.committed) {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(class = %self.class_name, error = %e, "Confirmed batch no longer applies");
                    inner.committed.clone()
                }
            },
            None => inner.committed.clone(),
        };
        inner.committed = base.merge(response);
        if let Some(id) = response.object_id() {
            inner.server_id.get_or_insert_with(|| id.to_string());
        }
    }

    /// Return a failed batch to the overlay, beneath edits made since.
    pub(crate) fn fail_batch(&self, batch_id: &str) {
        let mut inner = self.inner.lock();
        let Some(failed) = remove_pending(&mut inner, batch_id) else {
            return;
        };
        if let Err(e) = inner.current.merge_from(&failed) {
            tracing::warn!(class = %self.class_name, error = %e, "Dropped failed edits that conflict with newer ones");
        }
    }

    /// Drop a batch the server refused for good.
    ///
    /// Later batches and the overlay stay as they are, so the estimate falls
    /// back to committed data with only the surviving edits applied.
    pub(crate) fn reject_batch(&self, batch_id: &str) {
        let mut inner = self.inner.lock();
        if remove_pending(&mut inner, batch_id).is_some() {
            tracing::debug!(class = %self.class_name, batch = batch_id, "Dropped rejected edits");
        }
    }

    /// Drop pending batches; their effects are superseded by a delete.
    pub(crate) fn discard_pending(&self, batch_ids: &[String]) {
        let mut inner = self.inner.lock();
        inner.pending.retain(|b| !batch_ids.contains(&b.id));
    }

    /// Merge server data into the committed state.
    pub(crate) fn merge_server_state(&self, state: &ObjectState) {
        let mut inner = self.inner.lock();
        inner.committed = inner.committed.merge(state);
        if let (None, Some(id)) = (&inner.server_id, state.object_id()) {
            inner.server_id = Some(id.to_string());
        }
    }

    /// Merge cached server data unless the committed state is already newer.
    ///
    /// Returns false when the cached state was skipped.
    pub(crate) fn merge_if_newer(&self, state: &ObjectState) -> bool {
        let mut inner = self.inner.lock();
        if let (Some(cached), Some(known)) = (state.updated_at(), inner.committed.updated_at()) {
            if cached < known {
                return false;
            }
        }
        inner.committed = inner.committed.merge(state);
        if let (None, Some(id)) = (&inner.server_id, state.object_id()) {
            inner.server_id = Some(id.to_string());
        }
        true
    }

    /// Bind the server id after the first save.
    pub(crate) fn assign_object_id(&self, object_id: &str) {
        let mut inner = self.inner.lock();
        inner.server_id = Some(object_id.to_string());
        inner.committed = inner.committed.clone().with_object_id(object_id);
    }

    pub(crate) fn mark_deleted(&self) {
        let mut inner = self.inner.lock();
        inner.deleted = true;
        inner.current = new_batch();
    }

    /// Undo a local delete the server refused.
    pub(crate) fn clear_deleted(&self) {
        self.inner.lock().deleted = false;
    }

    pub(crate) fn set_included(&self, key: &str, objects: Vec<ObjectRef>) {
        self.inner.lock().included.insert(key.to_string(), objects);
    }

    fn finish_save(&self) {
        self.inner.lock().save_in_progress = false;
    }
}

fn is_dirty(inner: &Inner) -> bool {
    !inner.current.is_empty() || !inner.pending.is_empty()
}

fn estimate(inner: &Inner) -> ObjectState {
    let mut state = inner.committed.clone();
    for batch in inner.pending.iter().chain(std::iter::once(&inner.current)) {
        if batch.is_empty() {
            continue;
        }
        state = match batch.apply_to(&state) {
            Ok(next) => next,
            Err(_) => state,
        };
    }
    state
}

fn take_batch(inner: &mut Inner) -> OperationSet {
    let batch = std::mem::replace(&mut inner.current, new_batch());
    inner.pending.push_back(batch.clone());
    batch
}

fn remove_pending(inner: &mut Inner, batch_id: &str) -> Option<OperationSet> {
    let index = inner.pending.iter().position(|b| b.id == batch_id)?;
    inner.pending.remove(index)
}

/// One synchronous save of one object.
///
/// Dropping an unfinished attempt (including by cancelling the future that
/// owns it) returns the batch to the overlay.
pub(crate) struct SaveAttempt {
    object: ObjectRef,
    batch: OperationSet,
    finished: bool,
}

impl SaveAttempt {
    pub(crate) fn batch(&self) -> &OperationSet {
        &self.batch
    }

    pub(crate) fn confirm(mut self, response: &ObjectState) {
        self.object.confirm_batch(&self.batch.id, response);
        self.finished = true;
    }

    pub(crate) fn fail(mut self) {
        self.object.fail_batch(&self.batch.id);
        self.finished = true;
    }
}

impl Drop for SaveAttempt {
    fn drop(&mut self) {
        if !self.finished {
            self.object.fail_batch(&self.batch.id);
        }
        self.object.finish_save();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn object() -> ObjectRef {
        Arc::new(LiveObject::new("GameScore".into(), None))
    }

    #[test]
    fn edits_touch_only_the_overlay() {
        let obj = object();
        obj.set("score", 10).unwrap();
        obj.increment("score", 5.0).unwrap();

        assert_eq!(obj.get_f64("score"), Some(15.0));
        assert!(obj.committed_state().get("score").is_none());
        assert!(obj.is_dirty());
        assert!(obj.is_key_dirty("score"));
        assert!(!obj.is_key_dirty("player"));
    }

    #[test]
    fn invalid_edits_are_rejected() {
        let obj = object();
        obj.set("player", "Sean").unwrap();
        assert!(matches!(obj.increment("player", 1.0), Err(Error::Type(_))));
        assert!(matches!(obj.set("objectId", "x"), Err(Error::Type(_))));
        assert_eq!(obj.get_str("player").as_deref(), Some("Sean"));
    }

    #[test]
    fn confirmed_save_commits_and_assigns_id() {
        let obj = object();
        obj.set("score", 1).unwrap();
        let attempt = obj.begin_save().unwrap();
        assert!(matches!(obj.begin_save(), Err(Error::State(_))));

        let response = ObjectState::new("GameScore").with_object_id("abc123");
        attempt.confirm(&response);

        assert_eq!(obj.object_id().as_deref(), Some("abc123"));
        assert_eq!(obj.committed_state().get("score"), Some(&Value::Number(1.0)));
        assert!(!obj.is_dirty());
        // Saving again is allowed once the first save finished
        drop(obj.begin_save().unwrap());
    }

    #[test]
    fn failed_save_replays_beneath_newer_edits() {
        let obj = object();
        obj.set("score", 1).unwrap();
        obj.set("player", "old").unwrap();
        let attempt = obj.begin_save().unwrap();

        obj.increment("score", 2.0).unwrap();
        attempt.fail();

        assert_eq!(obj.get_f64("score"), Some(3.0));
        assert_eq!(obj.get_str("player").as_deref(), Some("old"));
        assert!(obj.is_dirty());
    }

    #[test]
    fn rejected_batch_leaves_later_edits_on_top() {
        let obj = Arc::new(LiveObject::new("GameScore".into(), Some("s1".into())));
        obj.merge_server_state(
            &ObjectState::from_fields("GameScore", [("score", 0)])
                .unwrap()
                .with_object_id("s1"),
        );
        obj.set("score", 1).unwrap();
        let refused = obj.take_batch();
        obj.set("score", 2).unwrap();
        let later = obj.take_batch();

        obj.reject_batch(&refused.id);
        assert_eq!(obj.get_f64("score"), Some(2.0));

        obj.confirm_batch(&later.id, &ObjectState::new("GameScore").with_object_id("s1"));
        assert_eq!(obj.get_f64("score"), Some(2.0));
        assert!(!obj.is_dirty());
    }

    #[test]
    fn stale_cached_state_does_not_roll_back() {
        let obj = Arc::new(LiveObject::new("GameScore".into(), Some("s1".into())));
        let at = |hour| Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap();
        let older = ObjectState::from_fields("GameScore", [("score", 1)])
            .unwrap()
            .with_object_id("s1")
            .with_updated_at(at(8));
        let newer = ObjectState::from_fields("GameScore", [("score", 2)])
            .unwrap()
            .with_object_id("s1")
            .with_updated_at(at(9));

        obj.merge_server_state(&newer);
        assert!(!obj.merge_if_newer(&older));
        assert_eq!(obj.get_f64("score"), Some(2.0));
        assert!(obj.merge_if_newer(&newer));
    }

    #[test]
    fn dropped_attempt_returns_edits() {
        let obj = object();
        obj.set("score", 4).unwrap();
        drop(obj.begin_save().unwrap());
        assert!(obj.is_key_dirty("score"));
        assert_eq!(obj.get_f64("score"), Some(4.0));
    }

    #[test]
    fn snapshot_carries_committed_when_dirty() {
        let obj = Arc::new(LiveObject::new("GameScore".into(), Some("s1".into())));
        obj.merge_server_state(
            &ObjectState::from_fields("GameScore", [("score", 1)])
                .unwrap()
                .with_object_id("s1"),
        );
        assert_eq!(obj.snapshot().committed, None);

        obj.increment("score", 1.0).unwrap();
        let snapshot = obj.snapshot();
        assert_eq!(snapshot.state.get("score"), Some(&Value::Number(2.0)));
        assert_eq!(
            snapshot.committed.unwrap().get("score"),
            Some(&Value::Number(1.0))
        );
    }

    #[test]
    fn deleted_objects_reject_edits() {
        let obj = object();
        obj.mark_deleted();
        assert!(matches!(obj.set("a", 1), Err(Error::State(_))));
    }
}
