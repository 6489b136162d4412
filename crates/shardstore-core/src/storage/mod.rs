//! Storage contract and backends.
//!
//! The [`Storage`] trait is the capability set every backend must implement.
//! The sharded engine ([`ShardedStore`]) is the primary backend; the sync
//! layer wraps any `Storage` implementation.

mod router;
mod shard;
mod sharded;

pub use router::ShardRouter;
pub use shard::Shard;
pub use sharded::ShardedStore;

use crate::error::Result;
use crate::record::{ModelTag, TagSet, TxControl};

/// Uniform contract over physical backends.
///
/// All operations address records by `(partition, key, keyspace)`.
///
/// Error policy: `open`, `close` and `migrate` propagate typed errors;
/// the data-path operations return `bool`/`Option` and swallow internal
/// failures (a failed decrypt or decode reads as absence, not an error).
/// This favors availability over precise diagnostics; swallowed failures
/// are still reported through the configured diagnostics hook.
pub trait Storage: Send + Sync {
    /// Acquire and initialize backing resources.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Init` if the backing store cannot be created or
    /// reached.
    fn open(&self) -> Result<()>;

    /// Release resources and stop background work. Idempotent.
    fn close(&self);

    /// Bracket a unit of work on the shard serving `(partition, keyspace)`.
    ///
    /// Shard-local only: no atomicity is provided across shards. Backends
    /// without native transactions may treat this as a no-op returning
    /// `true`.
    fn transact(&self, partition: &str, keyspace: &str, control: TxControl) -> bool;

    /// Upsert a record. `ttl < 0` means "no expiry"; otherwise the record
    /// expires `ttl` seconds from now. Returns `false` on write failure.
    #[allow(clippy::too_many_arguments)]
    fn put(
        &self,
        partition: &str,
        key: &str,
        keyspace: &str,
        ttl: i64,
        tags: &TagSet,
        model: Option<&ModelTag>,
        value: &[u8],
    ) -> bool;

    /// Fetch a record value. `None` when absent, expired, or undecryptable.
    fn get(&self, partition: &str, key: &str, keyspace: &str) -> Option<Vec<u8>>;

    /// Logically delete a record by setting its TTL into the past. Physical
    /// purge is deferred to the background sweep so offline sync peers can
    /// still observe the deletion. Returns `false` if nothing was deleted.
    fn delete(&self, partition: &str, key: &str, keyspace: &str) -> bool;

    /// Fetch all live records matching every tag in `tags`, then apply an
    /// in-process predicate. No filter pushdown beyond tag equality.
    fn query(
        &self,
        partition: &str,
        keyspace: &str,
        tags: &TagSet,
        predicate: &dyn Fn(&[u8]) -> bool,
    ) -> Vec<Vec<u8>>;

    /// Visit live, tag-matching records in ascending timestamp order without
    /// materializing the full result set. The visitor returns `false` to
    /// stop early.
    fn iterate(
        &self,
        partition: &str,
        keyspace: &str,
        tags: &TagSet,
        visitor: &mut dyn FnMut(&[u8]) -> bool,
    );

    /// [`query`](Self::query) without a predicate.
    fn all(&self, partition: &str, keyspace: &str, tags: &TagSet) -> Vec<Vec<u8>>;

    /// Scan every shard for records tagged with `from` and rewrite them.
    ///
    /// For each matching record the transform receives the decoded value; an
    /// `Ok(Some)` result is rewritten under `to`'s tag (key, keyspace and
    /// TTL preserved), an `Ok(None)` result deletes the record, and an error
    /// aborts the scan. Runs synchronously, record by record, with no
    /// checkpointing: a crash mid-migration leaves a partially migrated
    /// keyspace.
    ///
    /// # Errors
    ///
    /// Returns the first shard, decode, or transform error encountered.
    fn migrate(
        &self,
        from: &ModelTag,
        to: &ModelTag,
        transform: &dyn Fn(&[u8]) -> Result<Option<Vec<u8>>>,
    ) -> Result<()>;
}
