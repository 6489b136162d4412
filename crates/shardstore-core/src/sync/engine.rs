//! The sync engine: write interception plus the background push/pull loop.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::crypto::PayloadCipher;
use crate::error::{Result, StoreError};
use crate::record::{now_millis, ModelTag, TagSet, TxControl, NO_EXPIRY};
use crate::storage::Storage;
use crate::sync::message::{SyncMessage, SyncTransaction, TxKind};
use crate::sync::outbox::{
    load_or_create_origin, load_tidemark, store_tidemark, Outbox, SYNC_PARTITION,
};
use crate::sync::transport::{HttpTransport, SyncTransport};
use crate::sync::Urgency;

/// Maximum outstanding transactions sent per round.
const MAX_BATCH: usize = 200;

struct KeyspaceSync {
    keyspace: String,
    outbox: Outbox,
    tidemark: Mutex<i64>,
}

/// A [`Storage`] wrapper that replicates selected keyspaces to a remote
/// peer.
///
/// Writes and deletes on a sync-enabled keyspace write through to local
/// storage first; on local success the change is also appended to a durable
/// outbox. A background worker per keyspace pushes pending transactions and
/// pulls remote ones at the configured urgency interval. Remote transactions
/// carrying this instance's own origin are never re-applied.
pub struct SyncedStore {
    local: Arc<dyn Storage>,
    transport: Arc<dyn SyncTransport>,
    partition: String,
    origin: String,
    account_id: String,
    sync_secret: Option<String>,
    cipher: Option<PayloadCipher>,
    urgency: Urgency,
    keyspaces: Vec<Arc<KeyspaceSync>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncedStore {
    /// Wrap `local`, replicating `keyspaces` within `partition`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Init` when the configuration requests raw
    /// (unhashed) queryable properties: synced tag digests must never expose
    /// raw values, so that combination is a fatal misconfiguration.
    pub fn new(
        local: Arc<dyn Storage>,
        config: &StoreConfig,
        partition: impl Into<String>,
        keyspaces: Vec<String>,
        transport: Arc<dyn SyncTransport>,
    ) -> Result<Arc<Self>> {
        if !config.hash_queryables {
            return Err(StoreError::Init(
                "Sync-enabled stores must hash queryable properties".to_string(),
            ));
        }

        let origin = load_or_create_origin(local.as_ref());
        let keyspaces = keyspaces
            .into_iter()
            .map(|keyspace| {
                let outbox = Outbox::load(Arc::clone(&local), &keyspace);
                let tidemark = Mutex::new(load_tidemark(local.as_ref(), &keyspace));
                Arc::new(KeyspaceSync {
                    keyspace,
                    outbox,
                    tidemark,
                })
            })
            .collect();

        Ok(Arc::new(Self {
            local,
            transport,
            partition: partition.into(),
            origin,
            account_id: config.account_id.clone().unwrap_or_default(),
            sync_secret: config.sync_secret.clone(),
            cipher: config.encryption_secret.as_deref().map(PayloadCipher::new),
            urgency: config.urgency,
            keyspaces,
            stop: Arc::new((Mutex::new(false), Condvar::new())),
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// Wrap `local` with an HTTP transport built from the configured sync
    /// endpoint.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Init` when no endpoint is configured, or on the
    /// same misconfiguration [`new`](Self::new) rejects.
    pub fn from_config(
        local: Arc<dyn Storage>,
        config: &StoreConfig,
        partition: impl Into<String>,
        keyspaces: Vec<String>,
    ) -> Result<Arc<Self>> {
        let endpoint = config
            .sync_endpoint
            .clone()
            .ok_or_else(|| StoreError::Init("No sync endpoint configured".to_string()))?;
        Self::new(
            local,
            config,
            partition,
            keyspaces,
            Arc::new(HttpTransport::new(endpoint)),
        )
    }

    /// Stable origin identifier of this instance.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Number of transactions awaiting acknowledgement for `keyspace`.
    pub fn pending(&self, keyspace: &str) -> usize {
        self.keyspace_sync(keyspace)
            .map(|ks| ks.outbox.pending_len())
            .unwrap_or(0)
    }

    /// Start one background worker per sync-enabled keyspace. Each worker
    /// runs a round immediately, then every urgency interval, for the
    /// lifetime of the store.
    pub fn start(self: &Arc<Self>) {
        let mut workers = match self.workers.lock() {
            Ok(workers) => workers,
            Err(_) => return,
        };
        for ks in &self.keyspaces {
            let engine = Arc::clone(self);
            let ks = Arc::clone(ks);
            workers.push(std::thread::spawn(move || {
                let interval = engine.urgency.interval();
                loop {
                    engine.run_round(&ks);
                    let (lock, signal) = &*engine.stop;
                    let Ok(stopped) = lock.lock() else { break };
                    // A close() issued while the round was running has
                    // already notified; re-check before sleeping.
                    if *stopped {
                        break;
                    }
                    let Ok((stopped, _)) =
                        signal.wait_timeout_while(stopped, interval, |stopped| !*stopped)
                    else {
                        break;
                    };
                    if *stopped {
                        break;
                    }
                }
            }));
        }
    }

    /// Run one synchronous round for every sync-enabled keyspace.
    pub fn sync_now(&self) {
        for ks in &self.keyspaces {
            self.run_round(ks);
        }
    }

    fn keyspace_sync(&self, keyspace: &str) -> Option<&Arc<KeyspaceSync>> {
        self.keyspaces.iter().find(|ks| ks.keyspace == keyspace)
    }

    /// One push/pull round for one keyspace. Every failure is treated as
    /// "no changes this round"; outbox entries and the tidemark only move
    /// after a fully successful exchange.
    fn run_round(&self, ks: &KeyspaceSync) {
        let outgoing = ks.outbox.batch(MAX_BATCH);
        let tidemark = ks.tidemark.lock().map(|t| *t).unwrap_or(0);

        let request = SyncMessage {
            account_id: self.account_id.clone(),
            instance_id: self.origin.clone(),
            secret: self.sync_secret.clone(),
            keyspace: ks.keyspace.clone(),
            tidemark,
            transactions: outgoing.clone(),
            eot: None,
            status: None,
        };

        let response = match self.transport.exchange(&request) {
            Ok(response) => response,
            Err(e) => {
                warn!(keyspace = %ks.keyspace, error = %e, "sync round failed");
                return;
            }
        };

        let mut applied = 0usize;
        for txn in &response.transactions {
            // Loop prevention: never re-apply our own changes on echo.
            if txn.origin == self.origin {
                continue;
            }
            self.apply(txn);
            applied += 1;
        }

        ks.outbox.acknowledge(&outgoing);
        if let Ok(mut mark) = ks.tidemark.lock() {
            *mark = response.tidemark;
        }
        store_tidemark(self.local.as_ref(), &ks.keyspace, response.tidemark);
        debug!(
            keyspace = %ks.keyspace,
            pushed = outgoing.len(),
            applied,
            tidemark = response.tidemark,
            "sync round complete"
        );
    }

    /// Apply one remote transaction to local storage.
    fn apply(&self, txn: &SyncTransaction) {
        match txn.kind {
            TxKind::Put => {
                let Some(wire_value) = &txn.value else {
                    warn!(key = %txn.key, "remote PUT without value ignored");
                    return;
                };
                let bytes = match hex::decode(wire_value) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(key = %txn.key, error = %e, "remote payload not hex");
                        return;
                    }
                };
                let plain = match &self.cipher {
                    Some(cipher) => match cipher.decrypt(&bytes) {
                        Ok(plain) => plain,
                        Err(e) => {
                            warn!(key = %txn.key, error = %e, "remote payload undecryptable");
                            return;
                        }
                    },
                    None => bytes,
                };
                let tags = TagSet::from_digests(txn.queryable_tag_digests.clone());
                self.local.put(
                    &self.partition,
                    &txn.key,
                    &txn.keyspace,
                    NO_EXPIRY,
                    &tags,
                    None,
                    &plain,
                );
            }
            TxKind::Delete => {
                self.local.delete(&self.partition, &txn.key, &txn.keyspace);
            }
        }
    }

    /// Record a locally originated change in the keyspace's outbox.
    fn intercept(&self, partition: &str, key: &str, keyspace: &str, kind: TxKind, value: Option<(&TagSet, &[u8])>) {
        if partition != self.partition || partition == SYNC_PARTITION {
            return;
        }
        let Some(ks) = self.keyspace_sync(keyspace) else {
            return;
        };
        let (digests, wire_value) = match value {
            Some((tags, plain)) => {
                let at_rest = match &self.cipher {
                    Some(cipher) => cipher.encrypt(plain),
                    None => plain.to_vec(),
                };
                (tags.digests().to_vec(), Some(hex::encode(at_rest)))
            }
            None => (Vec::new(), None),
        };
        ks.outbox.append(&SyncTransaction {
            origin: self.origin.clone(),
            key: key.to_string(),
            keyspace: keyspace.to_string(),
            value: wire_value,
            queryable_tag_digests: digests,
            kind,
            timestamp: now_millis(),
        });
    }
}

impl Storage for SyncedStore {
    fn open(&self) -> Result<()> {
        self.local.open()
    }

    fn close(&self) {
        {
            if let Ok(mut stopped) = self.stop.0.lock() {
                *stopped = true;
            }
        }
        self.stop.1.notify_all();
        if let Ok(mut workers) = self.workers.lock() {
            for worker in workers.drain(..) {
                let _ = worker.join();
            }
        }
        self.local.close();
    }

    fn transact(&self, partition: &str, keyspace: &str, control: TxControl) -> bool {
        self.local.transact(partition, keyspace, control)
    }

    fn put(
        &self,
        partition: &str,
        key: &str,
        keyspace: &str,
        ttl: i64,
        tags: &TagSet,
        model: Option<&ModelTag>,
        value: &[u8],
    ) -> bool {
        let ok = self
            .local
            .put(partition, key, keyspace, ttl, tags, model, value);
        if ok {
            self.intercept(partition, key, keyspace, TxKind::Put, Some((tags, value)));
        }
        ok
    }

    fn get(&self, partition: &str, key: &str, keyspace: &str) -> Option<Vec<u8>> {
        self.local.get(partition, key, keyspace)
    }

    fn delete(&self, partition: &str, key: &str, keyspace: &str) -> bool {
        let ok = self.local.delete(partition, key, keyspace);
        if ok {
            self.intercept(partition, key, keyspace, TxKind::Delete, None);
        }
        ok
    }

    fn query(
        &self,
        partition: &str,
        keyspace: &str,
        tags: &TagSet,
        predicate: &dyn Fn(&[u8]) -> bool,
    ) -> Vec<Vec<u8>> {
        self.local.query(partition, keyspace, tags, predicate)
    }

    fn iterate(
        &self,
        partition: &str,
        keyspace: &str,
        tags: &TagSet,
        visitor: &mut dyn FnMut(&[u8]) -> bool,
    ) {
        self.local.iterate(partition, keyspace, tags, visitor)
    }

    fn all(&self, partition: &str, keyspace: &str, tags: &TagSet) -> Vec<Vec<u8>> {
        self.local.all(partition, keyspace, tags)
    }

    fn migrate(
        &self,
        from: &ModelTag,
        to: &ModelTag,
        transform: &dyn Fn(&[u8]) -> Result<Option<Vec<u8>>>,
    ) -> Result<()> {
        self.local.migrate(from, to, transform)
    }
}
