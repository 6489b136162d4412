//! The sharded storage engine.
//!
//! Routes every operation to the shard serving its (partition, keyspace)
//! pair, encrypts payloads at rest when a secret is configured, and invokes
//! the change listener after successful mutations. Data-path failures are
//! swallowed into absence per the contract and reported through the
//! diagnostics hook.

use tracing::warn;

use crate::config::StoreConfig;
use crate::crypto::PayloadCipher;
use crate::error::{Result, StoreError};
use crate::ident::record_id;
use crate::record::{now_secs, Document, ModelTag, TagSet, TxControl};
use crate::storage::router::ShardRouter;
use crate::storage::shard::Shard;
use crate::storage::Storage;

/// Multi-file storage engine: one SQLite file per (partition, keyspace).
pub struct ShardedStore {
    config: StoreConfig,
    router: ShardRouter,
    cipher: Option<PayloadCipher>,
}

impl ShardedStore {
    /// Open a sharded store rooted at the configured base directory,
    /// reopening any existing shard files.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Init` if the directory or an existing shard
    /// cannot be opened.
    pub fn new(config: StoreConfig) -> Result<Self> {
        let router = ShardRouter::open(&config.base_dir)?;
        let cipher = config
            .encryption_secret
            .as_deref()
            .map(PayloadCipher::new);
        Ok(Self {
            config,
            router,
            cipher,
        })
    }

    /// Store configuration, as supplied at construction.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Report a swallowed data-path failure.
    fn diag(&self, err: &StoreError) {
        warn!(error = %err, "data-path failure swallowed as absence");
        if let Some(hook) = &self.config.diagnostics {
            hook(err);
        }
    }

    fn notify(&self, key: &str, keyspace: &str) {
        if let Some(listener) = &self.config.listener {
            listener(key, keyspace);
        }
    }

    /// Payload as stored at rest.
    fn encode(&self, value: &[u8]) -> Vec<u8> {
        match &self.cipher {
            Some(cipher) => cipher.encrypt(value),
            None => value.to_vec(),
        }
    }

    /// Stored payload back to caller bytes.
    fn decode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match &self.cipher {
            Some(cipher) => cipher.decrypt(payload),
            None => Ok(payload.to_vec()),
        }
    }

    fn resolve(&self, partition: &str, keyspace: &str) -> Result<std::sync::Arc<Shard>> {
        self.router.resolve(partition, keyspace)
    }

    /// Build the tag set for caller-supplied queryable pairs, digesting them
    /// unless queryable hashing was explicitly disabled.
    pub fn tag_set(&self, pairs: &[(String, String)]) -> TagSet {
        let mut tags = TagSet::new();
        for (name, value) in pairs {
            if self.config.hash_queryables {
                tags.insert_pair(name, value);
            } else {
                tags.insert_raw_pair(name, value);
            }
        }
        tags
    }

    // --- Typed document layer ---
    //
    // The minimal typed seam over the byte-level contract. Documents declare
    // their own schema tag and queryable properties; the store never
    // inspects a value's runtime shape.

    /// Serialize and store a document with its declared schema tag and
    /// filter tags. Returns `false` on serialization or write failure.
    pub fn put_document<T: Document>(
        &self,
        partition: &str,
        key: &str,
        keyspace: &str,
        ttl: i64,
        doc: &T,
    ) -> bool {
        let value = match serde_json::to_vec(doc) {
            Ok(v) => v,
            Err(e) => {
                self.diag(&StoreError::Unknown(format!(
                    "Document serialization failed: {}",
                    e
                )));
                return false;
            }
        };
        let tags = self.tag_set(&doc.filter_values());
        self.put(partition, key, keyspace, ttl, &tags, Some(&T::model()), &value)
    }

    /// Fetch and decode a document. Decode failures read as absence.
    pub fn get_document<T: Document>(
        &self,
        partition: &str,
        key: &str,
        keyspace: &str,
    ) -> Option<T> {
        let value = self.get(partition, key, keyspace)?;
        match serde_json::from_slice(&value) {
            Ok(doc) => Some(doc),
            Err(e) => {
                self.diag(&StoreError::Unknown(format!(
                    "Document decode failed: {}",
                    e
                )));
                None
            }
        }
    }

    /// Fetch all live documents whose tag set covers every supplied
    /// queryable pair. Undecodable records are skipped.
    pub fn query_documents<T: Document>(
        &self,
        partition: &str,
        keyspace: &str,
        filters: &[(String, String)],
    ) -> Vec<T> {
        let tags = self.tag_set(filters);
        self.all(partition, keyspace, &tags)
            .into_iter()
            .filter_map(|value| match serde_json::from_slice(&value) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    self.diag(&StoreError::Unknown(format!(
                        "Document decode failed: {}",
                        e
                    )));
                    None
                }
            })
            .collect()
    }

    /// Migrate every record of schema `F` to schema `T`. The transform
    /// returning `None` deletes the source record.
    ///
    /// # Errors
    ///
    /// Returns the first shard or decode error encountered.
    pub fn migrate_documents<F, T>(
        &self,
        transform: impl Fn(F) -> Option<T>,
    ) -> Result<()>
    where
        F: Document,
        T: Document,
    {
        self.migrate(&F::model(), &T::model(), &|bytes| {
            let doc: F = serde_json::from_slice(bytes)
                .map_err(|e| StoreError::Unknown(format!("Migration decode failed: {}", e)))?;
            match transform(doc) {
                Some(out) => {
                    let bytes = serde_json::to_vec(&out).map_err(|e| {
                        StoreError::Unknown(format!("Migration encode failed: {}", e))
                    })?;
                    Ok(Some(bytes))
                }
                None => Ok(None),
            }
        })
    }
}

impl Storage for ShardedStore {
    fn open(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config.base_dir)
            .map_err(|e| StoreError::Init(format!("Cannot create shard directory: {}", e)))
    }

    fn close(&self) {
        self.router.close();
    }

    fn transact(&self, partition: &str, keyspace: &str, control: TxControl) -> bool {
        let statement = match control {
            TxControl::Begin => "BEGIN",
            TxControl::Commit => "COMMIT",
            TxControl::Rollback => "ROLLBACK",
        };
        let result = self
            .resolve(partition, keyspace)
            .and_then(|shard| shard.transact_raw(statement));
        match result {
            Ok(()) => true,
            Err(e) => {
                self.diag(&e);
                false
            }
        }
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
        let now = now_secs();
        let ttl_abs = if ttl < 0 { None } else { Some(now + ttl) };
        let payload = self.encode(value);
        let id = record_id(key, keyspace);

        let result = self
            .resolve(partition, keyspace)
            .and_then(|shard| shard.upsert(&id, &payload, ttl_abs, now, model, tags));
        match result {
            Ok(()) => {
                self.notify(key, keyspace);
                true
            }
            Err(e) => {
                self.diag(&e);
                false
            }
        }
    }

    fn get(&self, partition: &str, key: &str, keyspace: &str) -> Option<Vec<u8>> {
        let id = record_id(key, keyspace);
        let payload = match self
            .resolve(partition, keyspace)
            .and_then(|shard| shard.fetch(&id, now_secs()))
        {
            Ok(payload) => payload?,
            Err(e) => {
                self.diag(&e);
                return None;
            }
        };
        match self.decode(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                // Wrong key and corruption both land here; the contract
                // reads both as absence.
                self.diag(&e);
                None
            }
        }
    }

    fn delete(&self, partition: &str, key: &str, keyspace: &str) -> bool {
        let id = record_id(key, keyspace);
        match self
            .resolve(partition, keyspace)
            .and_then(|shard| shard.mark_deleted(&id, now_secs()))
        {
            Ok(true) => {
                self.notify(key, keyspace);
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.diag(&e);
                false
            }
        }
    }

    fn query(
        &self,
        partition: &str,
        keyspace: &str,
        tags: &TagSet,
        predicate: &dyn Fn(&[u8]) -> bool,
    ) -> Vec<Vec<u8>> {
        self.all(partition, keyspace, tags)
            .into_iter()
            .filter(|value| predicate(value))
            .collect()
    }

    fn iterate(
        &self,
        partition: &str,
        keyspace: &str,
        tags: &TagSet,
        visitor: &mut dyn FnMut(&[u8]) -> bool,
    ) {
        let shard = match self.resolve(partition, keyspace) {
            Ok(shard) => shard,
            Err(e) => {
                self.diag(&e);
                return;
            }
        };
        let mut decode_failure = None;
        let result = shard.visit_tagged(tags, now_secs(), &mut |payload| {
            match self.decode(payload) {
                Ok(value) => visitor(&value),
                Err(e) => {
                    // skip the record, keep iterating
                    decode_failure = Some(e);
                    true
                }
            }
        });
        if let Some(e) = decode_failure {
            self.diag(&e);
        }
        if let Err(e) = result {
            self.diag(&e);
        }
    }

    fn all(&self, partition: &str, keyspace: &str, tags: &TagSet) -> Vec<Vec<u8>> {
        let payloads = match self
            .resolve(partition, keyspace)
            .and_then(|shard| shard.select_tagged(tags, now_secs()))
        {
            Ok(payloads) => payloads,
            Err(e) => {
                self.diag(&e);
                return Vec::new();
            }
        };
        payloads
            .iter()
            .filter_map(|payload| match self.decode(payload) {
                Ok(value) => Some(value),
                Err(e) => {
                    self.diag(&e);
                    None
                }
            })
            .collect()
    }

    fn migrate(
        &self,
        from: &ModelTag,
        to: &ModelTag,
        transform: &dyn Fn(&[u8]) -> Result<Option<Vec<u8>>>,
    ) -> Result<()> {
        for shard in self.router.all_shards() {
            shard.migrate_model(from, to, &|payload| {
                let plain = self.decode(payload)?;
                match transform(&plain)? {
                    Some(replacement) => Ok(Some(self.encode(&replacement))),
                    None => Ok(None),
                }
            })?;
        }
        Ok(())
    }
}

impl Drop for ShardedStore {
    fn drop(&mut self) {
        self.router.close();
    }
}
