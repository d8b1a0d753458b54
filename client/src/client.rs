//! The session context.
//!
//! A [`Client`] owns every component of one datastore session: the identity
//! registry, the local datastore, pins, the outbox, the query engine and the
//! result cache. It is created explicitly and closed explicitly; nothing is
//! process-global.

use crate::cache::{CachePolicy, CachePolicyResolver, QueryCache, ResultOrigin};
use crate::config::ClientConfig;
use crate::datastore::LocalDatastore;
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::object::ObjectRef;
use crate::object_store::{apply_snapshot, ObjectStore};
use crate::outbox::{Outbox, SyncEvent, SyncReport};
use crate::pin::{PinManager, DEFAULT_PIN};
use crate::query_engine::{QueryEngine, Source};
use crate::remote::{RemoteGate, RemoteStore};
use crate::storage::{DurableStorage, SqliteStorage};
use stash_engine::{ObjectId, Query, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct Client {
    config: ClientConfig,
    objects: Arc<ObjectStore>,
    datastore: Arc<LocalDatastore>,
    pins: Arc<PinManager>,
    outbox: Arc<Outbox>,
    queries: Arc<QueryEngine>,
    cache: CachePolicyResolver,
    gate: RemoteGate,
    locks: Arc<KeyedLocks>,
}

impl Client {
    /// Open a session over `storage`, reloading queued outbox entries.
    pub async fn open(
        config: ClientConfig,
        storage: Arc<dyn DurableStorage>,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        let locks = KeyedLocks::new_shared();
        let objects = ObjectStore::new_shared();
        let datastore = Arc::new(LocalDatastore::new(storage.clone(), locks.clone()));
        let pins = Arc::new(PinManager::new(datastore.clone(), objects.clone()));
        let gate = RemoteGate::new(remote, config.max_in_flight, config.remote_timeout);
        let outbox = Outbox::open(
            storage.clone(),
            datastore.clone(),
            pins.clone(),
            objects.clone(),
            gate.clone(),
            locks.clone(),
            config.clone(),
        )
        .await?;
        let queries = Arc::new(QueryEngine::new(
            datastore.clone(),
            objects.clone(),
            gate.clone(),
        ));
        let cache = CachePolicyResolver::new(
            queries.clone(),
            QueryCache::new(storage, config.max_cache_age),
        );

        tracing::info!(
            max_in_flight = config.max_in_flight,
            queued = outbox.pending_count(),
            "Opened client session"
        );
        Ok(Self {
            config,
            objects,
            datastore,
            pins,
            outbox,
            queries,
            cache,
            gate,
            locks,
        })
    }

    /// Open a session over the SQLite database named by the configuration.
    pub async fn connect(config: ClientConfig, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        let storage = SqliteStorage::connect(&config.database_url).await?;
        Self::open(config, Arc::new(storage), remote).await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub fn datastore(&self) -> &LocalDatastore {
        &self.datastore
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// A new unsaved object.
    pub fn create(&self, class_name: &str) -> Result<ObjectRef> {
        self.objects.create(class_name)
    }

    /// The canonical object for a server id, without fetching it.
    pub fn object(&self, class_name: &str, object_id: &str) -> Result<ObjectRef> {
        self.objects.create_without_data(class_name, object_id)
    }

    /// Save `object` now, saving unsaved objects it points to first.
    pub async fn save(&self, object: &ObjectRef) -> Result<()> {
        for child in self.unsaved_children(object)? {
            self.save_one(&child).await?;
        }
        self.save_one(object).await
    }

    async fn save_one(&self, object: &ObjectRef) -> Result<()> {
        if !object.is_saved() && self.outbox.has_pending(object) {
            return Err(Error::state("save in progress"));
        }
        // Claimed before waiting on the lock so a concurrent first save
        // fails instead of queueing behind this one
        let created = !object.is_saved();
        let attempt = object.begin_save()?;
        if !created && attempt.batch().is_empty() {
            return Ok(());
        }
        let _guard = self.locks.lock(&object.lock_key()).await;
        let operations = attempt
            .batch()
            .resolve_local_ids(&|token| self.objects.resolve_local_id(token))
            .map_err(|token| Error::state(format!("pointer to unsaved object {token}")))?;

        let target = object.identity();
        let response = match self
            .gate
            .call("save", self.gate.remote().save(&target, &operations))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                attempt.fail();
                return Err(e);
            }
        };
        attempt.confirm(&response);

        if created {
            let server_id = response.object_id().ok_or_else(|| {
                Error::ServerRejected("save response carries no objectId".to_string())
            })?;
            self.outbox.promote(object, server_id).await?;
        }
        self.datastore
            .update_snapshot(&object.identity(), object.snapshot())
            .await?;
        tracing::debug!(target = %object.identity(), created, "Saved object");
        Ok(())
    }

    /// Unsaved objects reachable from `root` through pointers, children
    /// before parents, excluding `root`. Unsaved cycles cannot be saved.
    fn unsaved_children(&self, root: &ObjectRef) -> Result<Vec<ObjectRef>> {
        enum Visit {
            Enter(ObjectRef),
            Exit(ObjectRef),
        }

        let mut order = Vec::new();
        let mut done: HashSet<String> = HashSet::new();
        let mut on_path: HashSet<String> = HashSet::new();
        let mut stack = vec![Visit::Enter(Arc::clone(root))];

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(object) => {
                    let id = object.local_id().to_string();
                    if done.contains(&id) {
                        continue;
                    }
                    if !on_path.insert(id) {
                        return Err(Error::state("unsaved objects point at each other in a cycle"));
                    }
                    stack.push(Visit::Exit(Arc::clone(&object)));
                    let state = object.state();
                    let mut children = Vec::new();
                    for value in state.fields().values() {
                        value.for_each_pointer(&mut |p| {
                            if matches!(p.object_id, ObjectId::Local(_)) {
                                children.push(p.clone());
                            }
                        });
                    }
                    for pointer in children {
                        let child = self.objects.from_pointer(&pointer)?;
                        if !child.is_saved() {
                            stack.push(Visit::Enter(child));
                        }
                    }
                }
                Visit::Exit(object) => {
                    on_path.remove(object.local_id());
                    done.insert(object.local_id().to_string());
                    order.push(object);
                }
            }
        }
        order.pop();
        Ok(order)
    }

    /// Queue `object`'s edits for delivery, queuing unsaved objects it points
    /// to first. Returns the entry's sequence number.
    pub async fn save_eventually(&self, object: &ObjectRef) -> Result<u64> {
        for child in self.unsaved_children(object)? {
            if !self.outbox.has_pending(&child) {
                self.outbox.enqueue_save(&child).await?;
            }
        }
        self.outbox.enqueue_save(object).await
    }

    /// Delete `object` on the server now.
    pub async fn delete(&self, object: &ObjectRef) -> Result<()> {
        if self.outbox.has_pending(object) && !object.is_saved() {
            return Err(Error::state("save in progress"));
        }
        let _guard = self.locks.lock(&object.lock_key()).await;
        let target = object.identity();
        if object.is_saved() {
            self.gate
                .call("delete", self.gate.remote().delete(&target))
                .await?;
        }
        object.mark_deleted();
        self.datastore.delete(&target).await?;
        tracing::debug!(target = %target, "Deleted object");
        Ok(())
    }

    /// Queue a delete. Queued saves of the object that have not been sent
    /// are cancelled.
    pub async fn delete_eventually(&self, object: &ObjectRef) -> Result<Option<u64>> {
        self.outbox.enqueue_delete(object).await
    }

    /// Refresh `object` from the server.
    pub async fn fetch(&self, object: &ObjectRef) -> Result<ObjectRef> {
        if !object.is_saved() {
            return Err(Error::NotFound(format!(
                "{} has not been saved",
                object.identity()
            )));
        }
        let key = object.identity();
        let state = self
            .gate
            .call("fetch", self.gate.remote().fetch(&key))
            .await?;
        object.merge_server_state(&state);
        self.datastore
            .update_snapshot(&key, object.snapshot())
            .await?;
        Ok(Arc::clone(object))
    }

    /// Load `object`'s data from the local datastore.
    pub async fn fetch_from_local_datastore(&self, object: &ObjectRef) -> Result<ObjectRef> {
        let key = object.identity();
        let record = self
            .datastore
            .get_record(&key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{key} is not in the local datastore")))?;
        apply_snapshot(object, &record.snapshot)?;
        Ok(Arc::clone(object))
    }

    // ========================================================================
    // Pins
    // ========================================================================

    pub async fn pin(&self, object: &ObjectRef) -> Result<usize> {
        self.pins.pin(object, DEFAULT_PIN).await
    }

    pub async fn pin_with_label(&self, object: &ObjectRef, label: &str) -> Result<usize> {
        self.pins.pin(object, label).await
    }

    pub async fn pin_all(&self, objects: &[ObjectRef], label: &str) -> Result<usize> {
        self.pins.pin_all(objects, label).await
    }

    pub async fn unpin(&self, object: &ObjectRef) -> Result<()> {
        self.pins.unpin(object, DEFAULT_PIN).await
    }

    pub async fn unpin_with_label(&self, object: &ObjectRef, label: &str) -> Result<()> {
        self.pins.unpin(object, label).await
    }

    pub async fn unpin_all(&self, objects: &[ObjectRef], label: &str) -> Result<()> {
        self.pins.unpin_all(objects, label).await
    }

    /// Remove `label` from every record carrying it.
    pub async fn unpin_label(&self, label: &str) -> Result<usize> {
        self.pins.unpin_label(label).await
    }

    pub async fn labels(&self, object: &ObjectRef) -> Result<std::collections::BTreeSet<String>> {
        self.pins.labels(object).await
    }

    /// Reclaim unlabelled records that are no longer protected.
    pub async fn compact(&self) -> Result<usize> {
        self.objects.prune();
        self.pins.compact().await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn query(&self, class_name: &str) -> Query {
        Query::new(class_name)
    }

    /// Run `query` against the remote store.
    pub async fn find(&self, query: &Query) -> Result<Vec<ObjectRef>> {
        self.queries.find(query, &Source::Remote).await
    }

    pub async fn find_from(&self, query: &Query, source: &Source) -> Result<Vec<ObjectRef>> {
        self.queries.find(query, source).await
    }

    pub async fn first(&self, query: &Query, source: &Source) -> Result<Option<ObjectRef>> {
        self.queries.first(query, source).await
    }

    pub async fn count(&self, query: &Query, source: &Source) -> Result<usize> {
        self.queries.count(query, source).await
    }

    pub async fn find_with_policy(
        &self,
        query: &Query,
        policy: CachePolicy,
    ) -> Result<Vec<ObjectRef>> {
        self.cache.find(query, policy).await
    }

    pub async fn find_cache_then_network<F>(&self, query: &Query, handler: F)
    where
        F: FnMut(ResultOrigin, Result<Vec<ObjectRef>>),
    {
        self.cache.find_cache_then_network(query, handler).await
    }

    pub async fn has_cached_result(&self, query: &Query) -> Result<bool> {
        self.cache.cache().has(query).await
    }

    pub async fn clear_cached_result(&self, query: &Query) -> Result<()> {
        self.cache.cache().clear(query).await
    }

    pub async fn clear_all_cached_results(&self) -> Result<usize> {
        self.cache.cache().clear_all().await
    }

    /// Query over the members of `owner`'s relation `key`. Runs only
    /// against the remote store.
    pub fn relation_query(&self, owner: &ObjectRef, key: &str) -> Result<Query> {
        let Some(Value::Relation { class_name }) = owner.get(key) else {
            return Err(Error::Type(format!(
                "{key:?} is not a relation on {}",
                owner.class_name()
            )));
        };
        if !owner.is_saved() {
            return Err(Error::state("relation owner has not been saved"));
        }
        Ok(Query::new(class_name).where_related_to(owner.pointer(), key))
    }

    // ========================================================================
    // Sync
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.outbox.subscribe()
    }

    /// Start delivering queued entries in the background.
    pub fn start_sync(&self) {
        self.outbox.start();
    }

    /// Deliver queued entries now, until nothing more can finish.
    pub async fn sync_now(&self) -> SyncReport {
        self.outbox.flush().await
    }

    pub fn notify_connectivity(&self) {
        self.outbox.notify_connectivity();
    }

    /// Stop background delivery. Queued entries stay persisted.
    pub async fn close(&self) {
        self.outbox.shutdown().await;
        tracing::info!(queued = self.outbox.pending_count(), "Closed client session");
    }
}
