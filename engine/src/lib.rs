//! # Stash Engine
//!
//! The deterministic core of the Stash client datastore.
//!
//! This crate models records, field operations and queries without touching
//! storage, the network or a clock. Everything here is a pure function of its
//! inputs, so the async runtime in `stash-client` can replay, merge and
//! evaluate the same values on any thread.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or platform
//! - **Immutable states**: Every edit produces a new [`ObjectState`]
//! - **One query meaning**: Local evaluation and remote stores share [`Query`]
//!
//! ## Core Concepts
//!
//! ### Values
//!
//! Field values are [`Value`]s: JSON scalars and containers plus typed
//! pointers, relations, files, geo points and dates. Typed values encode as
//! JSON objects tagged with `"__type"`.
//!
//! ### Identity
//!
//! Records are named by an [`IdentityKey`]: a class name and either a
//! server-assigned object id or a local token ([`ObjectId`]).
//!
//! ### Operations
//!
//! Unsaved edits are [`FieldOperation`]s grouped into an [`OperationSet`].
//! Edits to the same key coalesce:
//! - `Set` then `Increment` becomes a single `Set`
//! - Two `Increment`s add up
//! - `Delete` then `Add` becomes a `Set` of the added objects
//!
//! ### Queries
//!
//! A [`Query`] is a class, a constraint list and modifiers. The [`Matcher`]
//! evaluates it against in-memory [`Candidate`]s.
//!
//! ## Quick Start
//!
//! ```rust
//! use stash_engine::{
//!     Candidate, FieldOperation, Matcher, ObjectId, ObjectState, OperationSet, Query,
//!     SubqueryResults, Value,
//! };
//!
//! // 1. Build a record
//! let state = ObjectState::from_fields("GameScore", [("player", "Sean")])
//!     .unwrap()
//!     .with_object_id("xWMyZ4YEGZ");
//!
//! // 2. Record an edit and apply it
//! let mut batch = OperationSet::new("batch_1");
//! batch
//!     .record("score", FieldOperation::Increment { amount: 1337.0 })
//!     .unwrap();
//! let state = batch.apply_to(&state).unwrap();
//! assert_eq!(state.get("score"), Some(&Value::Number(1337.0)));
//!
//! // 3. Query it
//! let query = Query::new("GameScore").where_greater_than("score", 1000);
//! let matcher = Matcher::new(&query, &SubqueryResults::new()).unwrap();
//! let hits = matcher.execute(vec![Candidate::new(ObjectId::Server("xWMyZ4YEGZ".into()), state)]);
//! assert_eq!(hits.len(), 1);
//! ```

pub mod error;
pub mod identity;
pub mod matcher;
pub mod operation;
pub mod query;
pub mod state;
pub mod value;

// Re-export main types at crate root
pub use error::Error;
pub use identity::{validate_class_name, IdentityKey, ObjectId, OBJECT_KEY_PREFIX};
pub use matcher::{Candidate, Matcher, SubqueryResults};
pub use operation::{BatchId, FieldOperation, OperationSet};
pub use query::{
    Constraint, GeoBound, Query, SortDirection, SortKey, DEFAULT_LIMIT, MAX_LIMIT, MAX_SKIP,
};
pub use state::{ObjectState, RESERVED_KEYS};
pub use value::{FileRef, GeoPoint, Pointer, Value, EARTH_RADIUS_KM, EARTH_RADIUS_MILES};

/// Type aliases for clarity
pub type ClassName = String;
