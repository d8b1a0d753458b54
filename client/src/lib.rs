//! # Stash Client
//!
//! Async runtime for the Stash local datastore.
//!
//! A [`Client`] keeps one live instance per object identity, stores records
//! under pin labels in durable storage, evaluates queries locally or
//! remotely, and delivers queued writes through a persistent outbox.
//!
//! ## Components
//!
//! - [`ObjectStore`]: identity registry of [`LiveObject`]s
//! - [`LocalDatastore`]: labelled records over [`DurableStorage`]
//! - [`PinManager`]: recursive pinning and reclamation
//! - [`QueryEngine`]: remote and local query execution
//! - [`Outbox`]: ordered, retried delivery of eventual writes
//! - [`CachePolicyResolver`]: query result caching policies
//!
//! ## Features
//!
//! - `test-utils`: exports `InMemoryRemote`, an in-process [`RemoteStore`]
//!   with failure injection, for tests and demos
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stash_client::{Client, ClientConfig, RemoteStore, Source};
//! use std::sync::Arc;
//!
//! # async fn run(remote: Arc<dyn RemoteStore>) -> stash_client::Result<()> {
//! let client = Client::connect(ClientConfig::default(), remote).await?;
//!
//! let score = client.create("GameScore")?;
//! score.set("player", "Sean")?;
//! score.set("score", 1337)?;
//! client.pin(&score).await?;
//! client.save_eventually(&score).await?;
//!
//! let query = client.query("GameScore").where_greater_than("score", 1000);
//! let local = client.find_from(&query, &Source::LocalDatastore).await?;
//! assert_eq!(local.len(), 1);
//!
//! client.sync_now().await;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod datastore;
pub mod error;
pub mod locks;
pub mod object;
pub mod object_store;
pub mod outbox;
pub mod pin;
pub mod query_engine;
pub mod remote;
pub mod storage;

pub use cache::{CachePolicy, CachePolicyResolver, QueryCache, ResultOrigin};
pub use client::Client;
pub use config::{ClientConfig, ConfigError};
pub use datastore::{LocalDatastore, StoredObject};
pub use error::{Error, Result};
pub use locks::KeyedLocks;
pub use object::{LiveObject, ObjectRef, Snapshot};
pub use object_store::ObjectStore;
pub use outbox::{Outbox, OutboxAction, OutboxEntry, SyncEvent, SyncReport};
pub use pin::{PinManager, DEFAULT_PIN, OUTBOX_PIN};
pub use query_engine::{QueryEngine, Source};
pub use remote::{RemoteGate, RemoteStore};
pub use storage::{DurableStorage, MemoryStorage, SqliteStorage};

#[cfg(any(test, feature = "test-utils"))]
pub use remote::InMemoryRemote;

pub use stash_engine::{
    FieldOperation, GeoPoint, IdentityKey, ObjectId, ObjectState, OperationSet, Pointer, Query,
    SortDirection, Value,
};
