//! Durable key-value storage.
//!
//! Every persistent namespace lives in one [`DurableStorage`]:
//! `obj:` records, `outbox:` entries, `localid:` mappings and `qcache:`
//! query results. Writes are atomic per key.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::Result;
use async_trait::async_trait;

/// Crash-safe key-value medium.
#[async_trait]
pub trait DurableStorage: Send + Sync + 'static {
    /// Insert or replace the value under `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Up to `limit` entries whose key starts with `prefix`, in key order,
    /// strictly after `start_after` when given.
    async fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Read every entry under `prefix`.
pub(crate) async fn scan_all(
    storage: &dyn DurableStorage,
    prefix: &str,
) -> Result<Vec<(String, Vec<u8>)>> {
    const PAGE: usize = 256;

    let mut out = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = storage.scan_prefix(prefix, cursor.as_deref(), PAGE).await?;
        let done = page.len() < PAGE;
        cursor = page.last().map(|(key, _)| key.clone());
        out.extend(page);
        if done {
            return Ok(out);
        }
    }
}
