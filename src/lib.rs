//! `packbound` is the pack and garbage-collection engine for a relational-backed,
//! append-only object store: given a pack horizon (a transaction id), it identifies every
//! object revision and transaction that can be reclaimed, optionally computes the
//! transitive live-set from the pickled object graph, and physically deletes the dead
//! revisions and superseded history, atomically with respect to concurrent committers.
//!
//! This crate does not open connections to real application data on its own, allocate
//! object ids, resolve write conflicts, or expose a wire protocol or CLI: those are the
//! responsibility of the embedding object store. `packbound` only owns the pack algorithm,
//! its reference-graph traversal, and the SQL-dialect abstraction that lets it run
//! against more than one relational backend.

pub mod connection;
pub mod dialect;
pub mod error;
pub mod locker;
pub mod pack;
pub mod refs;
pub mod script;

pub mod backend {
    pub mod postgres;
    pub mod sqlite;
}

#[cfg(test)]
pub(crate) mod testutil;

/// Object identifier. The root object's oid is the reserved value 0.
pub type Oid = u64;

/// Transaction identifier. Monotonically increasing with commit order; values `<= 0` are
/// reserved sentinels and never denote a user transaction.
pub type Tid = i64;

pub type Result<T> = std::result::Result<T, error::Error>;

pub use dialect::{DialectProfile, PlaceholderStyle};
pub use pack::{ObjectHistoryRecord, PackController, PackControllerConfig, TransactionRecord};
pub use refs::RefExtractor;
pub use script::{Param, ParamMap, ScriptRunner};
