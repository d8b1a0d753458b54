//! In-process remote store for tests and demos.

use super::RemoteStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use stash_engine::{
    Candidate, ClassName, Constraint, FieldOperation, IdentityKey, Matcher, ObjectId,
    ObjectState, OperationSet, Pointer, Query, SubqueryResults,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct RemoteData {
    records: BTreeMap<(ClassName, String), ObjectState>,
    /// (owner class, owner id, relation key) to member (class, id)
    relations: BTreeMap<(ClassName, String, String), BTreeSet<(ClassName, String)>>,
    failures: VecDeque<Error>,
    offline: bool,
    saves: Vec<(IdentityKey, OperationSet)>,
    deletes: Vec<IdentityKey>,
}

/// In-process [`RemoteStore`] evaluating queries with the engine's matcher.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    data: Mutex<RemoteData>,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Store a record as if another client had saved it.
    pub fn insert(&self, state: ObjectState) -> Result<ObjectState> {
        let object_id = state
            .object_id()
            .ok_or_else(|| Error::Type("seeded record needs an objectId".to_string()))?
            .to_string();
        let now = Utc::now();
        let state = match state.created_at() {
            Some(_) => state,
            None => state.with_created_at(now).with_updated_at(now),
        };
        self.data
            .lock()
            .records
            .insert((state.class_name().to_string(), object_id), state.clone());
        Ok(state)
    }

    /// Add `member` to `owner`'s relation `key`.
    pub fn add_relation(&self, owner: &Pointer, key: &str, member: &Pointer) -> Result<()> {
        let (Some(owner_id), Some(member_id)) =
            (owner.object_id.server_id(), member.object_id.server_id())
        else {
            return Err(Error::ServerRejected(
                "relations require saved objects".to_string(),
            ));
        };
        self.data
            .lock()
            .relations
            .entry((owner.class_name.clone(), owner_id.to_string(), key.to_string()))
            .or_default()
            .insert((member.class_name.clone(), member_id.to_string()));
        Ok(())
    }

    /// Fail the next call with `error`. Queued failures are used in order.
    pub fn push_failure(&self, error: Error) {
        self.data.lock().failures.push_back(error);
    }

    /// While offline every call fails with a connectivity error.
    pub fn set_offline(&self, offline: bool) {
        self.data.lock().offline = offline;
    }

    pub fn record(&self, class_name: &str, object_id: &str) -> Option<ObjectState> {
        self.data
            .lock()
            .records
            .get(&(class_name.to_string(), object_id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.data.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every save received, in arrival order.
    pub fn save_log(&self) -> Vec<(IdentityKey, OperationSet)> {
        self.data.lock().saves.clone()
    }

    /// Every delete received, in arrival order.
    pub fn delete_log(&self) -> Vec<IdentityKey> {
        self.data.lock().deletes.clone()
    }

    /// Number of calls received, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn begin(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut data = self.data.lock();
        if data.offline {
            return Err(Error::Connectivity("remote unreachable".to_string()));
        }
        match data.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl RemoteData {
    fn candidates(&self, class_name: &str) -> Vec<Candidate> {
        self.records
            .iter()
            .filter(|((class, _), _)| class == class_name)
            .map(|((_, id), state)| Candidate::new(ObjectId::Server(id.clone()), state.clone()))
            .collect()
    }

    /// Evaluate a query, returning unprojected matches. Unpaged evaluation
    /// skips sorting, skip and limit.
    fn run(&self, query: &Query, paged: bool) -> Result<Vec<Candidate>> {
        let (related, constraints): (Vec<_>, Vec<_>) = query
            .constraints
            .iter()
            .cloned()
            .partition(|c| matches!(c, Constraint::RelatedTo { .. }));
        let mut query = query.clone();
        query.constraints = constraints;

        let mut members: Option<BTreeSet<String>> = None;
        for constraint in related {
            let Constraint::RelatedTo { owner, key } = constraint else {
                continue;
            };
            let owner_id = owner.object_id.server_id().ok_or_else(|| {
                Error::ServerRejected("relation owner has not been saved".to_string())
            })?;
            let ids: BTreeSet<String> = self
                .relations
                .get(&(owner.class_name.clone(), owner_id.to_string(), key))
                .into_iter()
                .flatten()
                .filter(|(class, _)| *class == query.class_name)
                .map(|(_, id)| id.clone())
                .collect();
            members = Some(match members {
                Some(existing) => existing.intersection(&ids).cloned().collect(),
                None => ids,
            });
        }

        let mut subqueries = SubqueryResults::new();
        for sub in query.constraints.iter().flat_map(Constraint::subqueries) {
            if !subqueries.contains(sub)? {
                let results = self.run(sub, true)?;
                subqueries.insert(sub, results)?;
            }
        }

        let matcher = Matcher::new(&query, &subqueries)?;
        let candidates = self
            .candidates(&query.class_name)
            .into_iter()
            .filter(|c| match &members {
                Some(ids) => c.id.server_id().is_some_and(|id| ids.contains(id)),
                None => true,
            });
        if paged {
            Ok(matcher.execute(candidates))
        } else {
            Ok(candidates.filter(|c| matcher.matches(c)).collect())
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn fetch(&self, key: &IdentityKey) -> Result<ObjectState> {
        self.begin().await?;
        let Some(id) = key.id.server_id() else {
            return Err(Error::NotFound(format!("{key} has not been saved")));
        };
        self.record(&key.class_name, id)
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn fetch_many(&self, class_name: &str, ids: &[String]) -> Result<Vec<ObjectState>> {
        self.begin().await?;
        let data = self.data.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                data.records
                    .get(&(class_name.to_string(), id.clone()))
                    .cloned()
            })
            .collect())
    }

    async fn query(&self, query: &Query) -> Result<Vec<ObjectState>> {
        self.begin().await?;
        let hits = self.data.lock().run(query, true)?;
        Ok(hits
            .into_iter()
            .map(|c| match &query.select_keys {
                Some(keys) => c.state.select(keys),
                None => c.state,
            })
            .collect())
    }

    async fn count(&self, query: &Query) -> Result<usize> {
        self.begin().await?;
        let matches = self.data.lock().run(query, false)?.len();
        Ok(matches)
    }

    async fn save(&self, key: &IdentityKey, operations: &OperationSet) -> Result<ObjectState> {
        self.begin().await?;
        if let Err(token) = operations.resolve_local_ids(&|_| None) {
            return Err(Error::ServerRejected(format!(
                "pointer to unsaved object {token}"
            )));
        }

        let mut data = self.data.lock();
        let now = Utc::now();
        let (object_id, base, created) = match &key.id {
            ObjectId::Server(id) => {
                let existing = data
                    .records
                    .get(&(key.class_name.clone(), id.clone()))
                    .cloned()
                    .ok_or_else(|| Error::NotFound(key.to_string()))?;
                (id.clone(), existing, false)
            }
            ObjectId::Local(_) => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                let state = ObjectState::new(key.class_name.clone())
                    .with_object_id(id.clone())
                    .with_created_at(now);
                (id, state, true)
            }
        };

        let saved = operations.apply_to(&base)?.with_updated_at(now);
        let mut response = ObjectState::new(key.class_name.clone())
            .with_object_id(object_id.clone())
            .with_updated_at(now);
        if created {
            response = response.with_created_at(now);
        }
        // Echo values the server computed from non-Set operations
        for (field, op) in operations.iter() {
            if matches!(op, FieldOperation::Set { .. } | FieldOperation::Delete) {
                continue;
            }
            if let Some(value) = saved.get(field) {
                response = response.with_field(field.clone(), value.clone())?;
            }
        }

        data.records
            .insert((key.class_name.clone(), object_id), saved);
        data.saves.push((key.clone(), operations.clone()));
        Ok(response)
    }

    async fn delete(&self, key: &IdentityKey) -> Result<()> {
        self.begin().await?;
        let mut data = self.data.lock();
        if let Some(id) = key.id.server_id() {
            data.records.remove(&(key.class_name.clone(), id.to_string()));
            data.relations
                .retain(|(class, owner, _), _| !(class == &key.class_name && owner == id));
        }
        data.deletes.push(key.clone());
        Ok(())
    }
}
