//! Durable sync bookkeeping, persisted through the wrapped store itself.
//!
//! The outbox, its pending-id index, the per-keyspace tidemark, and the
//! instance origin all live in reserved keyspaces under a reserved
//! partition, so they share the store's durability and encryption without
//! side files.

use std::sync::{Arc, Mutex};

use tracing::warn;
use uuid::Uuid;

use crate::ident::record_id;
use crate::record::{TagSet, NO_EXPIRY};
use crate::storage::Storage;
use crate::sync::message::SyncTransaction;

/// Partition reserved for sync bookkeeping. Write interception ignores it.
pub(crate) const SYNC_PARTITION: &str = "__sync";

/// Keyspace for scalar state: origin, tidemarks, pending indexes.
const STATE_KEYSPACE: &str = "__state";

/// Pending replication units for one sync-enabled keyspace.
///
/// Entries are keyed by the target record id, so a second write to a record
/// that is already awaiting acknowledgement refreshes the stored transaction
/// instead of duplicating the index entry.
pub(crate) struct Outbox {
    store: Arc<dyn Storage>,
    outbox_keyspace: String,
    index_key: String,
    pending: Mutex<Vec<String>>,
}

impl Outbox {
    /// Load (or initialize) the outbox for `keyspace`.
    pub(crate) fn load(store: Arc<dyn Storage>, keyspace: &str) -> Self {
        let index_key = format!("{}.pending", keyspace);
        let pending = store
            .get(SYNC_PARTITION, &index_key, STATE_KEYSPACE)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            store,
            outbox_keyspace: format!("{}.outbox", keyspace),
            index_key,
            pending: Mutex::new(pending),
        }
    }

    /// Append a transaction, refreshing any entry already pending for the
    /// same record id.
    pub(crate) fn append(&self, txn: &SyncTransaction) {
        let id = record_id(&txn.key, &txn.keyspace);
        let body = match serde_json::to_vec(txn) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "outbox entry serialization failed");
                return;
            }
        };
        self.store.put(
            SYNC_PARTITION,
            &id,
            &self.outbox_keyspace,
            NO_EXPIRY,
            &TagSet::new(),
            None,
            &body,
        );

        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        if !pending.contains(&id) {
            pending.push(id);
            self.persist_index(&pending);
        }
    }

    /// Up to `limit` pending transactions, oldest first. A pending id whose
    /// body can no longer be read is dropped from the outbox and the index.
    pub(crate) fn batch(&self, limit: usize) -> Vec<SyncTransaction> {
        let ids: Vec<String> = match self.pending.lock() {
            Ok(pending) => pending.iter().take(limit).cloned().collect(),
            Err(_) => return Vec::new(),
        };
        let mut txns = Vec::new();
        let mut stale = Vec::new();
        for id in ids {
            let parsed = self
                .store
                .get(SYNC_PARTITION, &id, &self.outbox_keyspace)
                .and_then(|body| serde_json::from_slice(&body).ok());
            match parsed {
                Some(txn) => txns.push(txn),
                None => stale.push(id),
            }
        }
        if !stale.is_empty() {
            warn!(dropped = stale.len(), "unreadable outbox entries dropped");
            for id in &stale {
                self.store.delete(SYNC_PARTITION, id, &self.outbox_keyspace);
            }
            if let Ok(mut pending) = self.pending.lock() {
                pending.retain(|id| !stale.contains(id));
                self.persist_index(&pending);
            }
        }
        txns
    }

    /// Drop acknowledged transactions from the outbox and the index.
    ///
    /// A write that lands while a round is in flight refreshes the stored
    /// entry; such an entry no longer matches the transaction that was
    /// actually sent and must stay pending for the next round.
    pub(crate) fn acknowledge(&self, txns: &[SyncTransaction]) {
        if txns.is_empty() {
            return;
        }
        let mut acked = Vec::new();
        for txn in txns {
            let id = record_id(&txn.key, &txn.keyspace);
            let sent = match serde_json::to_vec(txn) {
                Ok(sent) => sent,
                Err(_) => continue,
            };
            match self.store.get(SYNC_PARTITION, &id, &self.outbox_keyspace) {
                Some(stored) if stored != sent => continue,
                Some(_) => {
                    self.store.delete(SYNC_PARTITION, &id, &self.outbox_keyspace);
                    acked.push(id);
                }
                None => acked.push(id),
            }
        }
        if acked.is_empty() {
            return;
        }
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        pending.retain(|id| !acked.contains(id));
        self.persist_index(&pending);
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn persist_index(&self, pending: &[String]) {
        match serde_json::to_vec(pending) {
            Ok(body) => {
                self.store.put(
                    SYNC_PARTITION,
                    &self.index_key,
                    STATE_KEYSPACE,
                    NO_EXPIRY,
                    &TagSet::new(),
                    None,
                    &body,
                );
            }
            Err(e) => warn!(error = %e, "outbox index serialization failed"),
        }
    }
}

/// Last acknowledged change position for `keyspace`; zero when never synced.
pub(crate) fn load_tidemark(store: &dyn Storage, keyspace: &str) -> i64 {
    store
        .get(SYNC_PARTITION, &format!("{}.tidemark", keyspace), STATE_KEYSPACE)
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or(0)
}

/// Persist the tidemark after a successful round.
pub(crate) fn store_tidemark(store: &dyn Storage, keyspace: &str, tidemark: i64) {
    if let Ok(body) = serde_json::to_vec(&tidemark) {
        store.put(
            SYNC_PARTITION,
            &format!("{}.tidemark", keyspace),
            STATE_KEYSPACE,
            NO_EXPIRY,
            &TagSet::new(),
            None,
            &body,
        );
    }
}

/// Stable per-instance origin identifier, generated once and persisted so it
/// survives restarts.
pub(crate) fn load_or_create_origin(store: &dyn Storage) -> String {
    if let Some(bytes) = store.get(SYNC_PARTITION, "origin", STATE_KEYSPACE) {
        if let Ok(origin) = String::from_utf8(bytes) {
            if !origin.is_empty() {
                return origin;
            }
        }
    }
    let origin = Uuid::new_v4().to_string();
    store.put(
        SYNC_PARTITION,
        "origin",
        STATE_KEYSPACE,
        NO_EXPIRY,
        &TagSet::new(),
        None,
        origin.as_bytes(),
    );
    origin
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::record::now_millis;
    use crate::storage::ShardedStore;
    use crate::sync::message::TxKind;
    use tempfile::TempDir;

    fn txn(key: &str) -> SyncTransaction {
        SyncTransaction {
            origin: "inst-1".to_string(),
            key: key.to_string(),
            keyspace: "notes".to_string(),
            value: Some(hex::encode(b"v")),
            queryable_tag_digests: Vec::new(),
            kind: TxKind::Put,
            timestamp: now_millis(),
        }
    }

    fn open_store(dir: &TempDir) -> Arc<ShardedStore> {
        Arc::new(ShardedStore::new(StoreConfig::new(dir.path())).unwrap())
    }

    #[test]
    fn test_append_is_idempotent_per_record() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let outbox = Outbox::load(store, "notes");

        outbox.append(&txn("a"));
        outbox.append(&txn("a"));
        outbox.append(&txn("b"));

        assert_eq!(outbox.pending_len(), 2);
        assert_eq!(outbox.batch(200).len(), 2);
    }

    #[test]
    fn test_acknowledge_drops_entries() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let outbox = Outbox::load(store, "notes");

        outbox.append(&txn("a"));
        outbox.append(&txn("b"));
        let batch = outbox.batch(1);
        assert_eq!(batch.len(), 1);

        outbox.acknowledge(&batch);
        assert_eq!(outbox.pending_len(), 1);
        assert_eq!(outbox.batch(200)[0].key, "b");
    }

    #[test]
    fn test_refreshed_entry_survives_acknowledgement() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let outbox = Outbox::load(store, "notes");

        outbox.append(&txn("a"));
        let batch = outbox.batch(200);

        // a newer write for the same record lands while the batch is in flight
        let mut refreshed = txn("a");
        refreshed.value = Some(hex::encode(b"v2"));
        refreshed.timestamp += 1;
        outbox.append(&refreshed);

        outbox.acknowledge(&batch);
        assert_eq!(outbox.pending_len(), 1);
        let resent = outbox.batch(200);
        assert_eq!(resent[0].value, Some(hex::encode(b"v2")));
    }

    #[test]
    fn test_batch_purges_unreadable_entries() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let outbox = Outbox::load(Arc::clone(&store) as Arc<dyn Storage>, "notes");

        outbox.append(&txn("a"));
        outbox.append(&txn("b"));
        // pending id whose body is gone
        let id = record_id("a", "notes");
        store.delete(SYNC_PARTITION, &id, "notes.outbox");

        let batch = outbox.batch(200);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key, "b");
        assert_eq!(outbox.pending_len(), 1);
    }

    #[test]
    fn test_pending_index_survives_reload() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        {
            let outbox = Outbox::load(Arc::clone(&store) as Arc<dyn Storage>, "notes");
            outbox.append(&txn("a"));
        }
        let outbox = Outbox::load(store, "notes");
        assert_eq!(outbox.pending_len(), 1);
    }

    #[test]
    fn test_origin_is_stable_across_reloads() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let first = load_or_create_origin(store.as_ref());
        let second = load_or_create_origin(store.as_ref());
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn test_tidemark_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert_eq!(load_tidemark(store.as_ref(), "notes"), 0);
        store_tidemark(store.as_ref(), "notes", 17);
        assert_eq!(load_tidemark(store.as_ref(), "notes"), 17);
    }
}
