//! Query execution against the remote store or the local datastore.

use crate::datastore::LocalDatastore;
use crate::error::{Error, Result};
use crate::object::ObjectRef;
use crate::object_store::ObjectStore;
use crate::remote::RemoteGate;
use stash_engine::{
    Candidate, IdentityKey, Matcher, ObjectId, ObjectState, Pointer, Query, SubqueryResults,
    Value,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Where a query reads from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Source {
    #[default]
    Remote,
    /// Every record in the local datastore
    LocalDatastore,
    /// Local records carrying one label
    Pin(String),
}

impl Source {
    fn label(&self) -> Option<&str> {
        match self {
            Source::Pin(label) => Some(label),
            _ => None,
        }
    }
}

/// A local record considered by a query.
struct LocalRow {
    key: IdentityKey,
    registered: Option<ObjectRef>,
    snapshot: crate::object::Snapshot,
}

pub struct QueryEngine {
    datastore: Arc<LocalDatastore>,
    objects: Arc<ObjectStore>,
    gate: RemoteGate,
}

impl QueryEngine {
    pub fn new(datastore: Arc<LocalDatastore>, objects: Arc<ObjectStore>, gate: RemoteGate) -> Self {
        Self {
            datastore,
            objects,
            gate,
        }
    }

    /// Matching objects, routed through the identity registry.
    pub async fn find(&self, query: &Query, source: &Source) -> Result<Vec<ObjectRef>> {
        match source {
            Source::Remote => {
                let states = self.remote_states(query).await?;
                self.materialize(query, &states).await
            }
            _ => self.find_local(query, source.label()).await,
        }
    }

    /// The first match, if any.
    pub async fn first(&self, query: &Query, source: &Source) -> Result<Option<ObjectRef>> {
        let query = query.clone().limit(1);
        Ok(self.find(&query, source).await?.into_iter().next())
    }

    /// Number of matches, ignoring skip and limit.
    pub async fn count(&self, query: &Query, source: &Source) -> Result<usize> {
        match source {
            Source::Remote => {
                query.validate()?;
                self.gate
                    .call("count", self.gate.remote().count(query))
                    .await
            }
            _ => {
                let (rows, subqueries) = self.prepare_local(query, source.label()).await?;
                let matcher = Matcher::new(query, &subqueries)?;
                let candidates: Vec<Candidate> = rows.iter().map(candidate).collect();
                Ok(matcher.count(&candidates))
            }
        }
    }

    /// Raw remote results, without touching the registry.
    pub(crate) async fn remote_states(&self, query: &Query) -> Result<Vec<ObjectState>> {
        query.validate()?;
        let states = self
            .gate
            .call("query", self.gate.remote().query(query))
            .await?;
        tracing::debug!(class = %query.class_name, results = states.len(), "Remote query finished");
        Ok(states)
    }

    /// Route remote (or cached remote) records through the registry and
    /// resolve the query's includes remotely.
    pub(crate) async fn materialize(
        &self,
        query: &Query,
        states: &[ObjectState],
    ) -> Result<Vec<ObjectRef>> {
        let objects = states
            .iter()
            .map(|state| self.objects.materialize(state))
            .collect::<Result<Vec<_>>>()?;
        for path in &query.include {
            self.include_remote(&objects, path).await?;
        }
        Ok(objects)
    }

    /// Route cached records through the registry without any remote call.
    /// Objects already holding newer data keep it.
    pub(crate) fn materialize_cached(&self, states: &[ObjectState]) -> Result<Vec<ObjectRef>> {
        states
            .iter()
            .map(|state| self.objects.materialize_cached(state))
            .collect()
    }

    async fn find_local(&self, query: &Query, label: Option<&str>) -> Result<Vec<ObjectRef>> {
        let (rows, subqueries) = self.prepare_local(query, label).await?;
        let matcher = Matcher::new(query, &subqueries)?;

        let mut by_id: HashMap<ObjectId, LocalRow> = HashMap::with_capacity(rows.len());
        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            candidates.push(candidate(&row));
            by_id.insert(row.key.id.clone(), row);
        }

        let mut objects = Vec::new();
        for hit in matcher.execute(candidates) {
            let Some(row) = by_id.remove(&hit.id) else {
                continue;
            };
            let object = match row.registered {
                Some(object) => object,
                None => self.objects.rehydrate(&row.key, &row.snapshot)?,
            };
            objects.push(object);
        }

        for path in &query.include {
            self.include_local(&objects, path).await?;
        }
        tracing::debug!(class = %query.class_name, results = objects.len(), "Local query finished");
        Ok(objects)
    }

    /// Validate the query, load candidates and evaluate every subquery,
    /// innermost first.
    async fn prepare_local(
        &self,
        query: &Query,
        label: Option<&str>,
    ) -> Result<(Vec<LocalRow>, SubqueryResults)> {
        query.validate()?;
        if query.requires_remote() {
            return Err(Error::Constraint(
                "relation constraints can only be evaluated by the remote store".to_string(),
            ));
        }

        let mut subqueries = SubqueryResults::new();
        for sub in query.subqueries().into_iter().rev() {
            if subqueries.contains(sub)? {
                continue;
            }
            let rows = self.local_rows(&sub.class_name, label).await?;
            let hits = Matcher::new(sub, &subqueries)?.execute(rows.iter().map(candidate));
            subqueries.insert(sub, hits)?;
        }

        let rows = self.local_rows(&query.class_name, label).await?;
        Ok((rows, subqueries))
    }

    /// Stored records of one class, overlaid with live edits. Objects deleted
    /// locally are left out.
    async fn local_rows(&self, class_name: &str, label: Option<&str>) -> Result<Vec<LocalRow>> {
        let records = self
            .datastore
            .scan(class_name, |_, record| match label {
                Some(label) => record.labels.contains(label),
                None => true,
            })
            .collect()
            .await?;

        let mut rows = Vec::with_capacity(records.len());
        for (key, record) in records {
            let registered = self.objects.find(&key);
            if registered.as_ref().is_some_and(|o| o.is_deleted()) {
                continue;
            }
            rows.push(LocalRow {
                key,
                registered,
                snapshot: record.snapshot,
            });
        }
        Ok(rows)
    }

    async fn include_local(&self, roots: &[ObjectRef], path: &str) -> Result<()> {
        let mut level: Vec<ObjectRef> = roots.to_vec();
        for segment in path.split('.') {
            let mut next = Vec::new();
            for object in &level {
                let mut targets = Vec::new();
                for pointer in pointers_at(object, segment) {
                    targets.push(self.load_local(&pointer).await?);
                }
                next.extend(targets.iter().cloned());
                object.set_included(segment, targets);
            }
            level = dedup(next);
        }
        Ok(())
    }

    async fn load_local(&self, pointer: &Pointer) -> Result<ObjectRef> {
        let key = IdentityKey::new(pointer.class_name.clone(), pointer.object_id.clone())?;
        if let Some(object) = self.objects.find(&key) {
            if object.is_data_available() {
                return Ok(object);
            }
        }
        let record = match self.datastore.get_record(&key).await? {
            Some(record) => record,
            None => {
                return Err(Error::NotFound(format!(
                    "included object {key} is not in the local datastore"
                )))
            }
        };
        self.objects.rehydrate(&key, &record.snapshot)
    }

    /// Resolve one include path level by level, one batched fetch per class
    /// per level. Unknown targets are left unresolved.
    async fn include_remote(&self, roots: &[ObjectRef], path: &str) -> Result<()> {
        let mut level: Vec<ObjectRef> = roots.to_vec();
        for segment in path.split('.') {
            let pointers: Vec<(ObjectRef, Vec<Pointer>)> = level
                .iter()
                .map(|object| (Arc::clone(object), pointers_at(object, segment)))
                .collect();

            let mut wanted: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for pointer in pointers.iter().flat_map(|(_, ps)| ps) {
                if let Some(id) = pointer.object_id.server_id() {
                    let ids = wanted.entry(pointer.class_name.clone()).or_default();
                    if !ids.iter().any(|known| known == id) {
                        ids.push(id.to_string());
                    }
                }
            }

            let mut fetched: HashMap<(String, String), ObjectRef> = HashMap::new();
            for (class_name, ids) in wanted {
                let states = self
                    .gate
                    .call("fetch_many", self.gate.remote().fetch_many(&class_name, &ids))
                    .await?;
                for state in states {
                    let object = self.objects.materialize(&state)?;
                    if let Some(id) = state.object_id() {
                        fetched.insert((class_name.clone(), id.to_string()), object);
                    }
                }
            }

            let mut next = Vec::new();
            for (object, pointers) in pointers {
                let targets: Vec<ObjectRef> = pointers
                    .iter()
                    .filter_map(|p| {
                        let id = p.object_id.server_id()?;
                        fetched.get(&(p.class_name.clone(), id.to_string())).cloned()
                    })
                    .collect();
                next.extend(targets.iter().cloned());
                object.set_included(segment, targets);
            }
            level = dedup(next);
        }
        Ok(())
    }
}

fn candidate(row: &LocalRow) -> Candidate {
    let state = match &row.registered {
        Some(object) => object.state(),
        None => row.snapshot.state.clone(),
    };
    Candidate::new(row.key.id.clone(), state)
}

/// Pointers stored under `key`: a single pointer or an array of them.
fn pointers_at(object: &ObjectRef, key: &str) -> Vec<Pointer> {
    match object.get(key) {
        Some(Value::Pointer(pointer)) => vec![pointer],
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Pointer(pointer) => Some(pointer),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn dedup(objects: Vec<ObjectRef>) -> Vec<ObjectRef> {
    let mut seen = HashSet::new();
    objects
        .into_iter()
        .filter(|o| seen.insert(Arc::as_ptr(o)))
        .collect()
}
