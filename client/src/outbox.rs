//! Durable queue of deferred saves and deletes.
//!
//! Entries are persisted under `outbox:<seq>` before the call that queued
//! them returns, and survive restarts. Delivery is at-least-once:
//!
//! - entries for one object are delivered strictly in queue order, one at a
//!   time;
//! - entries for different objects are delivered concurrently, bounded by
//!   the remote gate;
//! - connectivity failures back off exponentially and retry in place;
//! - rejections drop the entry together with its edits and publish
//!   [`SyncEvent::Rejected`]. Later entries still run;
//! - an entry pointing at an unsaved object waits while that object has a
//!   save queued or running, and is rejected once nothing will save it.
//!
//! Objects are grouped by their local id, which does not change when the
//! first save assigns a server id.

use crate::config::ClientConfig;
use crate::datastore::LocalDatastore;
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::object::ObjectRef;
use crate::object_store::ObjectStore;
use crate::pin::{PinManager, OUTBOX_PIN};
use crate::remote::RemoteGate;
use crate::storage::{scan_all, DurableStorage};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stash_engine::{IdentityKey, ObjectState, OperationSet, Pointer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Key prefix of queued entries.
pub const OUTBOX_PREFIX: &str = "outbox:";

/// Key prefix of local id to server id mappings.
pub const LOCAL_ID_PREFIX: &str = "localid:";

const EVENT_CAPACITY: usize = 256;

fn entry_key(seq: u64) -> String {
    format!("{OUTBOX_PREFIX}{seq:020}")
}

/// What a queued entry does to its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OutboxAction {
    Save { operations: OperationSet },
    Delete,
}

/// One persisted outbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub seq: u64,
    /// Identity at enqueue time; a local id is resolved at delivery
    pub target: IdentityKey,
    pub action: OutboxAction,
    pub enqueued_at: DateTime<Utc>,
}

/// Terminal and retry notifications for queued entries.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Confirmed {
        target: IdentityKey,
        seq: u64,
    },
    Rejected {
        target: IdentityKey,
        seq: u64,
        error: Error,
    },
    Retrying {
        target: IdentityKey,
        seq: u64,
        attempts: u32,
        error: Error,
    },
}

/// Tally of one or more dispatch rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub dispatched: usize,
    pub confirmed: usize,
    pub retried: usize,
    pub rejected: usize,
}

impl SyncReport {
    fn absorb(&mut self, other: SyncReport) {
        self.dispatched += other.dispatched;
        self.confirmed += other.confirmed;
        self.retried += other.retried;
        self.rejected += other.rejected;
    }
}

struct Queued {
    entry: OutboxEntry,
    /// Strong hold keeping the object alive while queued
    object: ObjectRef,
}

#[derive(Debug, Default)]
struct GroupState {
    in_flight: Option<u64>,
    attempts: u32,
    retry_at: Option<Instant>,
}

#[derive(Default)]
struct Queue {
    entries: BTreeMap<u64, Queued>,
    groups: HashMap<String, GroupState>,
    next_seq: u64,
}

impl Queue {
    /// Oldest entry of every group that may be dispatched now, marked in flight.
    fn take_ready(&mut self, now: Instant) -> Vec<u64> {
        let Queue {
            entries, groups, ..
        } = self;
        let mut seen = HashSet::new();
        let mut ready = Vec::new();
        for (seq, queued) in entries.iter() {
            let group = queued.object.local_id();
            if !seen.insert(group) {
                continue;
            }
            let state = groups.entry(group.to_string()).or_default();
            let backing_off = state.retry_at.is_some_and(|at| at > now);
            if state.in_flight.is_none() && !backing_off {
                state.in_flight = Some(*seq);
                ready.push(*seq);
            }
        }
        ready
    }

    fn group_entries<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a Queued> + 'a {
        self.entries
            .values()
            .filter(move |q| q.object.local_id() == group)
    }

    fn in_flight(&self, group: &str) -> Option<u64> {
        self.groups.get(group).and_then(|g| g.in_flight)
    }
}

enum Outcome {
    Confirmed,
    /// Waiting on another object's first save; no backoff
    Deferred,
    Retry(Error),
    Reject(Error),
}

/// Deferred-write synchronizer.
pub struct Outbox {
    storage: Arc<dyn DurableStorage>,
    datastore: Arc<LocalDatastore>,
    pins: Arc<PinManager>,
    objects: Arc<ObjectStore>,
    gate: RemoteGate,
    locks: Arc<KeyedLocks>,
    config: ClientConfig,
    queue: Mutex<Queue>,
    /// Serializes enqueue decisions with their persistence
    enqueue_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Outbox {
    /// Build the outbox and reload every entry persisted by earlier sessions.
    pub async fn open(
        storage: Arc<dyn DurableStorage>,
        datastore: Arc<LocalDatastore>,
        pins: Arc<PinManager>,
        objects: Arc<ObjectStore>,
        gate: RemoteGate,
        locks: Arc<KeyedLocks>,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let outbox = Arc::new(Self {
            storage,
            datastore,
            pins,
            objects,
            gate,
            locks,
            config,
            queue: Mutex::new(Queue {
                next_seq: 1,
                ..Queue::default()
            }),
            enqueue_gate: tokio::sync::Mutex::new(()),
            events,
            wake: Notify::new(),
            shutdown,
            worker: Mutex::new(None),
        });
        let restored = outbox.reload().await?;
        if restored > 0 {
            tracing::info!(entries = restored, "Restored outbox entries");
        }
        Ok(outbox)
    }

    async fn reload(&self) -> Result<usize> {
        for (key, bytes) in scan_all(&*self.storage, LOCAL_ID_PREFIX).await? {
            let token = &key[LOCAL_ID_PREFIX.len()..];
            let server_id = String::from_utf8(bytes).map_err(|e| Error::Io(e.to_string()))?;
            self.objects.register_promotion(token, &server_id);
        }

        let mut seeded = HashSet::new();
        let mut restored = Vec::new();
        for (_, bytes) in scan_all(&*self.storage, OUTBOX_PREFIX).await? {
            let entry: OutboxEntry = serde_json::from_slice(&bytes)?;
            let object = self.objects.from_pointer(&Pointer::new(
                entry.target.class_name.clone(),
                entry.target.id.clone(),
            ))?;

            if seeded.insert(object.local_id().to_string()) {
                let current = object.identity();
                let mut record = self.datastore.get_record(&current).await?;
                if record.is_none() && entry.target != current {
                    // Promoted before the stored record was moved
                    record = self.datastore.get_record(&entry.target).await?;
                    if record.is_some() {
                        self.datastore.rekey(&entry.target, &current).await?;
                    }
                }
                if let Some(record) = record {
                    object.merge_server_state(record.snapshot.base());
                }
            }

            match &entry.action {
                OutboxAction::Save { operations } => object.restore_pending(operations.clone()),
                OutboxAction::Delete => object.mark_deleted(),
            }
            restored.push(Queued { entry, object });
        }

        let count = restored.len();
        let mut queue = self.queue.lock();
        for queued in restored {
            let seq = queued.entry.seq;
            queue.next_seq = queue.next_seq.max(seq + 1);
            queue.entries.insert(seq, queued);
        }
        Ok(count)
    }

    /// Queue the object's unsaved edits for delivery.
    pub async fn enqueue_save(&self, object: &ObjectRef) -> Result<u64> {
        let _gate = self.enqueue_gate.lock().await;
        if object.is_deleted() || self.has_queued_delete(object) {
            return Err(Error::state(format!(
                "{} has a queued delete",
                object.identity()
            )));
        }

        let batch = object.take_batch();
        let entry = self.new_entry(
            object,
            OutboxAction::Save {
                operations: batch.clone(),
            },
        );
        if let Err(e) = self.persist(&entry, object).await {
            object.fail_batch(&batch.id);
            return Err(e);
        }
        self.wake.notify_one();
        Ok(entry.seq)
    }

    /// Queue a delete, cancelling saves that have not been dispatched.
    ///
    /// Returns `None` when nothing needs to reach the server: the object was
    /// never created remotely, or a delete is already queued.
    pub async fn enqueue_delete(&self, object: &ObjectRef) -> Result<Option<u64>> {
        let _gate = self.enqueue_gate.lock().await;
        if self.has_queued_delete(object) {
            return Ok(None);
        }

        let group = object.local_id().to_string();
        let cancelled: Vec<(u64, String)> = {
            let queue = self.queue.lock();
            let in_flight = queue.in_flight(&group);
            queue
                .group_entries(&group)
                .filter(|q| Some(q.entry.seq) != in_flight)
                .filter_map(|q| match &q.entry.action {
                    OutboxAction::Save { operations } => {
                        Some((q.entry.seq, operations.id.clone()))
                    }
                    OutboxAction::Delete => None,
                })
                .collect()
        };
        for (seq, _) in &cancelled {
            self.storage.delete(&entry_key(*seq)).await?;
        }
        {
            let mut queue = self.queue.lock();
            for (seq, _) in &cancelled {
                queue.entries.remove(seq);
            }
        }
        let batch_ids: Vec<String> = cancelled.into_iter().map(|(_, id)| id).collect();
        object.discard_pending(&batch_ids);
        object.mark_deleted();

        let in_flight = self.queue.lock().in_flight(&group).is_some();
        if !object.is_saved() && !in_flight {
            self.datastore.delete(&object.identity()).await?;
            tracing::debug!(target = %object.identity(), "Deleted unsaved object locally");
            return Ok(None);
        }

        let entry = self.new_entry(object, OutboxAction::Delete);
        self.persist(&entry, object).await?;
        self.wake.notify_one();
        Ok(Some(entry.seq))
    }

    fn new_entry(&self, object: &ObjectRef, action: OutboxAction) -> OutboxEntry {
        let seq = {
            let mut queue = self.queue.lock();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            seq
        };
        OutboxEntry {
            seq,
            target: object.identity(),
            action,
            enqueued_at: Utc::now(),
        }
    }

    async fn persist(&self, entry: &OutboxEntry, object: &ObjectRef) -> Result<()> {
        self.storage
            .put(&entry_key(entry.seq), serde_json::to_vec(entry)?)
            .await?;
        if let Err(e) = self.pins.pin_shallow(object, OUTBOX_PIN).await {
            if let Err(cleanup) = self.storage.delete(&entry_key(entry.seq)).await {
                tracing::error!(seq = entry.seq, error = %cleanup, "Failed to remove unpinned outbox entry");
            }
            return Err(e);
        }
        self.queue.lock().entries.insert(
            entry.seq,
            Queued {
                entry: entry.clone(),
                object: Arc::clone(object),
            },
        );
        tracing::debug!(seq = entry.seq, target = %entry.target, "Queued outbox entry");
        Ok(())
    }

    fn has_queued_delete(&self, object: &ObjectRef) -> bool {
        self.queue
            .lock()
            .group_entries(object.local_id())
            .any(|q| matches!(q.entry.action, OutboxAction::Delete))
    }

    /// Whether any entry for `object` is queued or in flight.
    pub fn has_pending(&self, object: &ObjectRef) -> bool {
        self.queue
            .lock()
            .group_entries(object.local_id())
            .next()
            .is_some()
    }

    /// Number of queued or in-flight entries.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().entries.len()
    }

    /// Queued entries in sequence order.
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.queue
            .lock()
            .entries
            .values()
            .map(|q| q.entry.clone())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Connectivity returned: retry every backing-off object now.
    pub fn notify_connectivity(&self) {
        {
            let mut queue = self.queue.lock();
            for state in queue.groups.values_mut() {
                state.retry_at = None;
            }
        }
        self.wake.notify_one();
    }

    /// Bind an unsaved object to its server id, persisting the mapping and
    /// moving its stored record.
    pub(crate) async fn promote(&self, object: &ObjectRef, server_id: &str) -> Result<()> {
        let local_key = IdentityKey::local(object.class_name(), object.local_id())?;
        self.storage
            .put(
                &format!("{LOCAL_ID_PREFIX}{}", object.local_id()),
                server_id.as_bytes().to_vec(),
            )
            .await?;
        self.objects.promote(object, server_id);
        self.datastore.rekey(&local_key, &object.identity()).await
    }

    /// Run one dispatch round: the oldest entry of every ready object.
    pub async fn sync_once(&self) -> SyncReport {
        let ready = self.queue.lock().take_ready(Instant::now());
        let mut report = SyncReport {
            dispatched: ready.len(),
            ..SyncReport::default()
        };
        if ready.is_empty() {
            return report;
        }

        let outcomes = join_all(ready.into_iter().map(|seq| self.dispatch(seq))).await;
        for outcome in outcomes {
            match outcome {
                Outcome::Confirmed => report.confirmed += 1,
                Outcome::Deferred | Outcome::Retry(_) => report.retried += 1,
                Outcome::Reject(_) => report.rejected += 1,
            }
        }
        report
    }

    /// Dispatch rounds until the queue is empty or nothing more can finish now.
    pub async fn flush(&self) -> SyncReport {
        let mut total = SyncReport::default();
        loop {
            let round = self.sync_once().await;
            total.absorb(round);
            let progressed = round.confirmed + round.rejected > 0;
            if round.dispatched == 0 || !progressed || self.pending_count() == 0 {
                return total;
            }
        }
    }

    async fn dispatch(&self, seq: u64) -> Outcome {
        let Some((entry, object)) = self
            .queue
            .lock()
            .entries
            .get(&seq)
            .map(|q| (q.entry.clone(), Arc::clone(&q.object)))
        else {
            return Outcome::Deferred;
        };
        let group = object.local_id().to_string();
        let _guard = self.locks.lock(&object.lock_key()).await;

        let outcome = match self.deliver(&entry, &object).await {
            Ok(response) => match self.confirm(&entry, &object, response).await {
                Ok(()) => Outcome::Confirmed,
                Err(e @ Error::Io(_)) => {
                    tracing::error!(seq, error = %e, "Failed to record confirmed outbox entry");
                    Outcome::Retry(e)
                }
                Err(e) => Outcome::Reject(e),
            },
            Err(Deferral::Waiting(token)) if self.awaits_save(&token) => {
                tracing::debug!(seq, waiting_for = %token, "Outbox entry waits for a pointer target's first save");
                Outcome::Deferred
            }
            Err(Deferral::Waiting(token)) => Outcome::Reject(Error::state(format!(
                "pointer to unsaved object {token} that has no save pending"
            ))),
            Err(Deferral::Failed(e)) if e.is_retryable() => Outcome::Retry(e),
            Err(Deferral::Failed(e)) => Outcome::Reject(e),
        };

        if let Outcome::Reject(error) = &outcome {
            if let Err(e) = self.reject(&entry, &object, error).await {
                tracing::error!(seq, error = %e, "Failed to drop rejected outbox entry");
            }
        }
        self.settle(&group, seq, &entry, &outcome);
        outcome
    }

    /// Whether the unsaved object issued `token` will still get a server id:
    /// an entry of its own is queued, a synchronous save is running, or it
    /// was promoted since the caller tried to resolve it.
    fn awaits_save(&self, token: &str) -> bool {
        if self.queue.lock().group_entries(token).next().is_some() {
            return true;
        }
        if self
            .objects
            .find_unsaved(token)
            .is_some_and(|object| object.is_saving())
        {
            return true;
        }
        self.objects.resolve_local_id(token).is_some()
    }

    async fn deliver(
        &self,
        entry: &OutboxEntry,
        object: &ObjectRef,
    ) -> std::result::Result<Option<ObjectState>, Deferral> {
        let target = object.identity();
        match &entry.action {
            OutboxAction::Save { operations } => {
                let operations = operations
                    .resolve_local_ids(&|token| self.objects.resolve_local_id(token))
                    .map_err(Deferral::Waiting)?;
                let response = self
                    .gate
                    .call("save", self.gate.remote().save(&target, &operations))
                    .await?;
                Ok(Some(response))
            }
            OutboxAction::Delete => {
                // Never created remotely
                if target.id.server_id().is_none() {
                    return Ok(None);
                }
                self.gate
                    .call("delete", self.gate.remote().delete(&target))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn confirm(
        &self,
        entry: &OutboxEntry,
        object: &ObjectRef,
        response: Option<ObjectState>,
    ) -> Result<()> {
        match (&entry.action, response) {
            (OutboxAction::Save { operations }, Some(response)) => {
                if !object.is_saved() {
                    let server_id = response.object_id().ok_or_else(|| {
                        Error::ServerRejected("save response carries no objectId".to_string())
                    })?;
                    self.promote(object, server_id).await?;
                }
                object.confirm_batch(&operations.id, &response);
                self.datastore
                    .update_snapshot(&object.identity(), object.snapshot())
                    .await?;
            }
            _ => self.datastore.delete(&object.identity()).await?,
        }
        self.finish(entry.seq, object).await?;
        tracing::debug!(seq = entry.seq, target = %object.identity(), "Outbox entry confirmed");
        let _ = self.events.send(SyncEvent::Confirmed {
            target: object.identity(),
            seq: entry.seq,
        });
        Ok(())
    }

    async fn reject(&self, entry: &OutboxEntry, object: &ObjectRef, error: &Error) -> Result<()> {
        match &entry.action {
            OutboxAction::Save { operations } => object.reject_batch(&operations.id),
            OutboxAction::Delete => object.clear_deleted(),
        }
        self.datastore
            .update_snapshot(&object.identity(), object.snapshot())
            .await?;
        self.finish(entry.seq, object).await?;
        tracing::error!(seq = entry.seq, target = %object.identity(), error = %error, "Outbox entry rejected");
        let _ = self.events.send(SyncEvent::Rejected {
            target: object.identity(),
            seq: entry.seq,
            error: error.clone(),
        });
        Ok(())
    }

    /// Remove a delivered or dropped entry; release the outbox pin once the
    /// object has nothing left queued.
    async fn finish(&self, seq: u64, object: &ObjectRef) -> Result<()> {
        self.storage.delete(&entry_key(seq)).await?;
        let drained = {
            let mut queue = self.queue.lock();
            queue.entries.remove(&seq);
            let drained = queue.group_entries(object.local_id()).next().is_none();
            drained
        };
        if drained {
            self.pins.unpin_key(&object.identity(), OUTBOX_PIN).await?;
        }
        Ok(())
    }

    fn settle(&self, group: &str, seq: u64, entry: &OutboxEntry, outcome: &Outcome) {
        let mut queue = self.queue.lock();
        let drained = queue.group_entries(group).next().is_none();
        let state = queue.groups.entry(group.to_string()).or_default();
        state.in_flight = None;
        match outcome {
            Outcome::Retry(error) => {
                state.attempts += 1;
                let delay = self.config.backoff(state.attempts);
                state.retry_at = Some(Instant::now() + delay);
                tracing::warn!(
                    seq,
                    target = %entry.target,
                    attempts = state.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Outbox delivery failed, will retry"
                );
                let _ = self.events.send(SyncEvent::Retrying {
                    target: entry.target.clone(),
                    seq,
                    attempts: state.attempts,
                    error: error.clone(),
                });
            }
            Outcome::Deferred => {}
            Outcome::Confirmed | Outcome::Reject(_) => {
                state.attempts = 0;
                state.retry_at = None;
            }
        }
        if drained {
            queue.groups.remove(group);
        }
    }

    /// Spawn the background loop: a round per tick, on connectivity, or
    /// when an entry is queued. Does nothing if already running.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let _ = self.shutdown.send(false);
        let outbox = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.sync_interval;

        *worker = Some(tokio::spawn(async move {
            tracing::info!(interval_ms = interval.as_millis() as u64, "Outbox synchronizer started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let report = outbox.sync_once().await;
                if report.dispatched > 0 {
                    tracing::debug!(?report, "Outbox round finished");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = outbox.wake.notified() => {}
                    _ = shutdown.changed() => {}
                }
            }
            tracing::info!("Outbox synchronizer stopped");
        }));
    }

    /// Stop the background loop and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Outbox synchronizer task failed");
            }
        }
    }
}

enum Deferral {
    /// Operations point at an object whose first save has not completed
    Waiting(String),
    Failed(Error),
}

impl From<Error> for Deferral {
    fn from(err: Error) -> Self {
        Deferral::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_keys_sort_by_sequence() {
        assert!(entry_key(9) < entry_key(10));
        assert_eq!(entry_key(1), "outbox:00000000000000000001");
    }

    #[test]
    fn entries_round_trip_as_camel_case_json() {
        let entry = OutboxEntry {
            seq: 3,
            target: IdentityKey::local("GameScore", "t1").unwrap(),
            action: OutboxAction::Delete,
            enqueued_at: Utc::now(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["action"]["kind"], "delete");
        assert!(json.get("enqueuedAt").is_some());
        let back: OutboxEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
