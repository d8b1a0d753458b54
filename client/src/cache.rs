//! Query result cache and cache policies.
//!
//! Results are cached per query signature under `qcache:<signature>`,
//! separate from the label-based datastore used for pinning.

use crate::error::{Error, Result};
use crate::object::ObjectRef;
use crate::query_engine::{QueryEngine, Source};
use crate::storage::{scan_all, DurableStorage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stash_engine::{ObjectState, Query};
use std::sync::Arc;
use std::time::Duration;

/// Key prefix of cached query results.
pub const QUERY_CACHE_PREFIX: &str = "qcache:";

const CACHE_FORMAT_VERSION: u32 = 1;

/// How a query combines the result cache with the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Remote only; the cache is neither read nor written
    #[default]
    IgnoreCache,
    /// Cache only; a miss is `NotFound`
    CacheOnly,
    /// Remote only; results are cached
    NetworkOnly,
    /// Cache first; remote on a miss or an empty hit
    CacheElseNetwork,
    /// Remote first; cache when the remote fails
    NetworkElseCache,
    /// Cache result, then remote result, to one handler
    CacheThenNetwork,
}

/// Which half of a cache-then-network query produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOrigin {
    Cache,
    Network,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedResult {
    format_version: u32,
    cached_at: DateTime<Utc>,
    states: Vec<ObjectState>,
}

/// Query results stored by signature.
pub struct QueryCache {
    storage: Arc<dyn DurableStorage>,
    max_age: Option<Duration>,
}

impl QueryCache {
    pub fn new(storage: Arc<dyn DurableStorage>, max_age: Option<Duration>) -> Self {
        Self { storage, max_age }
    }

    /// Cached states for `query`. Entries older than the maximum age are
    /// misses.
    pub async fn get(&self, query: &Query) -> Result<Option<Vec<ObjectState>>> {
        let Some(bytes) = self.storage.get(&cache_key(query)?).await? else {
            return Ok(None);
        };
        let cached: CachedResult = serde_json::from_slice(&bytes)?;
        if cached.format_version > CACHE_FORMAT_VERSION {
            return Err(Error::Io(format!(
                "cached result format version {} is newer than supported version {CACHE_FORMAT_VERSION}",
                cached.format_version
            )));
        }
        if let Some(max_age) = self.max_age {
            let age = Utc::now()
                .signed_duration_since(cached.cached_at)
                .to_std()
                .unwrap_or_default();
            if age > max_age {
                tracing::debug!(class = %query.class_name, age_ms = age.as_millis() as u64, "Cached result is stale");
                return Ok(None);
            }
        }
        Ok(Some(cached.states))
    }

    pub async fn put(&self, query: &Query, states: &[ObjectState]) -> Result<()> {
        let cached = CachedResult {
            format_version: CACHE_FORMAT_VERSION,
            cached_at: Utc::now(),
            states: states.to_vec(),
        };
        self.storage
            .put(&cache_key(query)?, serde_json::to_vec(&cached)?)
            .await
    }

    pub async fn has(&self, query: &Query) -> Result<bool> {
        Ok(self.get(query).await?.is_some())
    }

    pub async fn clear(&self, query: &Query) -> Result<()> {
        self.storage.delete(&cache_key(query)?).await
    }

    /// Drop every cached result. Returns the number removed.
    pub async fn clear_all(&self) -> Result<usize> {
        let entries = scan_all(&*self.storage, QUERY_CACHE_PREFIX).await?;
        for (key, _) in &entries {
            self.storage.delete(key).await?;
        }
        tracing::debug!(entries = entries.len(), "Cleared cached query results");
        Ok(entries.len())
    }
}

fn cache_key(query: &Query) -> Result<String> {
    Ok(format!("{QUERY_CACHE_PREFIX}{}", query.signature()?))
}

/// Runs queries under a [`CachePolicy`].
pub struct CachePolicyResolver {
    engine: Arc<QueryEngine>,
    cache: QueryCache,
}

impl CachePolicyResolver {
    pub fn new(engine: Arc<QueryEngine>, cache: QueryCache) -> Self {
        Self { engine, cache }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Run `query` under a single-result policy.
    ///
    /// `CacheThenNetwork` yields two results and is rejected here; use
    /// [`CachePolicyResolver::find_cache_then_network`].
    pub async fn find(&self, query: &Query, policy: CachePolicy) -> Result<Vec<ObjectRef>> {
        match policy {
            CachePolicy::IgnoreCache => self.engine.find(query, &Source::Remote).await,
            CachePolicy::CacheOnly => self.from_cache(query).await?.ok_or_else(|| {
                Error::NotFound(format!("no cached result for {} query", query.class_name))
            }),
            CachePolicy::NetworkOnly => self.from_network(query).await,
            CachePolicy::CacheElseNetwork => {
                let cached = self.cache_fallback(query).await;
                if let Some(hit) = &cached {
                    if !hit.is_empty() {
                        return Ok(hit.clone());
                    }
                }
                match self.from_network(query).await {
                    Ok(objects) => Ok(objects),
                    Err(e) => cached.ok_or(e),
                }
            }
            CachePolicy::NetworkElseCache => match self.from_network(query).await {
                Ok(objects) => Ok(objects),
                Err(e) => {
                    tracing::debug!(class = %query.class_name, error = %e, "Remote query failed, trying cache");
                    self.cache_fallback(query).await.ok_or(e)
                }
            },
            CachePolicy::CacheThenNetwork => Err(Error::Constraint(
                "CacheThenNetwork delivers two results; use find_cache_then_network".to_string(),
            )),
        }
    }

    /// Call `handler` with the cached result (empty on a miss, never an
    /// error), then with the remote outcome.
    pub async fn find_cache_then_network<F>(&self, query: &Query, mut handler: F)
    where
        F: FnMut(ResultOrigin, Result<Vec<ObjectRef>>),
    {
        let cached = self.cache_fallback(query).await.unwrap_or_default();
        handler(ResultOrigin::Cache, Ok(cached));
        handler(ResultOrigin::Network, self.from_network(query).await);
    }

    async fn from_cache(&self, query: &Query) -> Result<Option<Vec<ObjectRef>>> {
        match self.cache.get(query).await? {
            Some(states) => Ok(Some(self.engine.materialize_cached(&states)?)),
            None => Ok(None),
        }
    }

    /// Cache read used as a fallback; failures count as a miss.
    async fn cache_fallback(&self, query: &Query) -> Option<Vec<ObjectRef>> {
        match self.from_cache(query).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(class = %query.class_name, error = %e, "Failed to read cached result");
                None
            }
        }
    }

    async fn from_network(&self, query: &Query) -> Result<Vec<ObjectRef>> {
        let states = self.engine.remote_states(query).await?;
        if let Err(e) = self.cache.put(query, &states).await {
            tracing::warn!(class = %query.class_name, error = %e, "Failed to cache query result");
        }
        self.engine.materialize(query, &states).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn states() -> Vec<ObjectState> {
        vec![ObjectState::from_fields("GameScore", [("score", 1)])
            .unwrap()
            .with_object_id("a")]
    }

    #[tokio::test]
    async fn put_get_clear() {
        let cache = QueryCache::new(Arc::new(MemoryStorage::new()), None);
        let query = Query::new("GameScore").where_greater_than("score", 0);

        assert!(!cache.has(&query).await.unwrap());
        cache.put(&query, &states()).await.unwrap();
        assert_eq!(cache.get(&query).await.unwrap(), Some(states()));

        let other = Query::new("GameScore").where_greater_than("score", 5);
        assert!(!cache.has(&other).await.unwrap());

        cache.clear(&query).await.unwrap();
        assert!(!cache.has(&query).await.unwrap());
    }

    #[tokio::test]
    async fn stale_entries_are_misses() {
        let cache = QueryCache::new(Arc::new(MemoryStorage::new()), Some(Duration::ZERO));
        let query = Query::new("GameScore");
        cache.put(&query, &states()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get(&query).await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_all_removes_only_cached_results() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put("obj:GameScore:a", vec![1]).await.unwrap();
        let cache = QueryCache::new(storage.clone(), None);
        cache.put(&Query::new("A"), &[]).await.unwrap();
        cache.put(&Query::new("B"), &[]).await.unwrap();

        assert_eq!(cache.clear_all().await.unwrap(), 2);
        assert!(storage.get("obj:GameScore:a").await.unwrap().is_some());
    }
}
