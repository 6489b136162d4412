//! # shardstore-core
//!
//! Embeddable, pluggable key-value/document storage with a uniform contract
//! over physical backends. The primary backend is the sharded engine: one
//! SQLite file per (partition, keyspace) pair, encrypted-at-rest payloads,
//! TTL-based soft expiry with background compaction, digest-based filter-tag
//! queries, schema-versioned migration, and an eventual-consistency sync
//! protocol between independent store instances.
//!
//! ## Architecture
//!
//! - **ident**: deterministic record/shard/tag identity digests
//! - **crypto**: transparent payload encryption
//! - **record**: the data model and the `Document` schema trait
//! - **storage**: the `Storage` contract, the shard engine and its router
//! - **sync**: outbox, wire protocol, and the background sync loop
//! - **notify**: change-listener and diagnostics callbacks

pub mod config;
pub mod crypto;
pub mod error;
pub mod ident;
pub mod notify;
pub mod record;
pub mod storage;
pub mod sync;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use record::{Document, ModelTag, TagSet, TxControl, NO_EXPIRY};
pub use storage::{ShardedStore, Storage};
pub use sync::{SyncedStore, Urgency};

/// Core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
