//! txhistory-storage: storage backends for the router transaction history.
//!
//! Backends:
//! - [`memory`]: in-memory (dev/testing, no persistence)
//! - `sqlite`: SQLite via `sqlx` (embedded, single-file persistence)
//! - `postgres`: PostgreSQL via `sqlx`, tables under the `router` schema
//!
//! Every backend implements `HistoryStore` and `CheckpointStore` from
//! `txhistory-core` and commits a batch, its quarantine rows, and the
//! checkpoint advance in one transaction.

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStorage;
