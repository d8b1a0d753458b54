//! The remote object service.
//!
//! [`RemoteStore`] is the capability the client consumes; [`RemoteGate`]
//! bounds concurrency and applies the call timeout. With the `test-utils`
//! feature, [`InMemoryRemote`] provides a complete in-process implementation.

use crate::error::{Error, Result};
use async_trait::async_trait;
use stash_engine::{IdentityKey, ObjectState, OperationSet, Query};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[cfg(any(test, feature = "test-utils"))]
mod memory;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::InMemoryRemote;

/// Remote object service.
///
/// Failures distinguish retryable [`Error::Connectivity`] from fatal
/// rejections ([`Error::ServerRejected`], [`Error::NotFound`]).
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn fetch(&self, key: &IdentityKey) -> Result<ObjectState>;

    /// Fetch several records of one class. Missing ids are skipped.
    async fn fetch_many(&self, class_name: &str, ids: &[String]) -> Result<Vec<ObjectState>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch(&IdentityKey::server(class_name, id.as_str())?).await {
                Ok(state) => out.push(state),
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn query(&self, query: &Query) -> Result<Vec<ObjectState>>;

    /// Number of matching records, ignoring skip and limit.
    async fn count(&self, query: &Query) -> Result<usize>;

    /// Apply `operations` to the record at `key`.
    ///
    /// A local key creates the record. The response carries `objectId`,
    /// timestamps and any server-computed field values.
    async fn save(&self, key: &IdentityKey, operations: &OperationSet) -> Result<ObjectState>;

    /// Delete the record at `key`. Deleting a missing record succeeds.
    async fn delete(&self, key: &IdentityKey) -> Result<()>;
}

/// Concurrency bound and timeout around a [`RemoteStore`].
#[derive(Clone)]
pub struct RemoteGate {
    remote: Arc<dyn RemoteStore>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl RemoteGate {
    pub fn new(remote: Arc<dyn RemoteStore>, max_in_flight: usize, timeout: Duration) -> Self {
        Self {
            remote,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            timeout,
        }
    }

    pub fn remote(&self) -> &dyn RemoteStore {
        &*self.remote
    }

    /// Run one remote call once a permit is free. Exceeding the timeout is a
    /// connectivity failure.
    pub async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Connectivity("remote gate closed".to_string()))?;
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "Remote call timed out");
                Err(Error::Connectivity(format!(
                    "{operation} timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }

    /// Permits not currently held.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}
