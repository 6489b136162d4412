//! Shard routing: (partition, keyspace) to a physical shard handle.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::ident::shard_name;
use crate::storage::shard::Shard;

/// File extension for shard files.
const SHARD_EXT: &str = "db";

/// Maps (partition, keyspace) pairs to open shard handles.
///
/// Shards are created lazily, exactly once, under the router-wide lock. The
/// lock guards only the lookup-or-create step; it is never held across
/// statement execution against an individual shard, so work on one shard
/// does not block work on another.
pub struct ShardRouter {
    base_dir: PathBuf,
    shards: Mutex<HashMap<String, Arc<Shard>>>,
}

impl ShardRouter {
    /// Open a router over `base_dir`, creating the directory if needed and
    /// reopening every existing shard file in it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Init` if the directory cannot be created or
    /// scanned, or if an existing shard file fails to open.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .map_err(|e| StoreError::Init(format!("Cannot create shard directory: {}", e)))?;

        let mut shards = HashMap::new();
        for entry in fs::read_dir(&base_dir)
            .map_err(|e| StoreError::Init(format!("Cannot scan shard directory: {}", e)))?
        {
            let entry = entry.map_err(|e| StoreError::Init(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SHARD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let shard = Shard::open(&path)?;
            shards.insert(stem.to_string(), Arc::new(shard));
        }
        debug!(dir = %base_dir.display(), reopened = shards.len(), "shard router opened");

        Ok(Self {
            base_dir,
            shards: Mutex::new(shards),
        })
    }

    /// Resolve the shard serving `(partition, keyspace)`, opening and caching
    /// it on first use.
    pub fn resolve(&self, partition: &str, keyspace: &str) -> Result<Arc<Shard>> {
        let name = shard_name(partition, keyspace);
        let mut shards = self
            .shards
            .lock()
            .map_err(|_| StoreError::Init("Shard cache poisoned".to_string()))?;
        if let Some(shard) = shards.get(&name) {
            return Ok(Arc::clone(shard));
        }
        let path = self.base_dir.join(format!("{}.{}", name, SHARD_EXT));
        let shard = Arc::new(Shard::open(&path)?);
        shards.insert(name, Arc::clone(&shard));
        Ok(shard)
    }

    /// Every open shard handle, for fan-out operations such as migration.
    pub fn all_shards(&self) -> Vec<Arc<Shard>> {
        match self.shards.lock() {
            Ok(shards) => shards.values().map(Arc::clone).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Stop every shard's background work and drop the handles. Idempotent.
    pub fn close(&self) {
        let drained: Vec<Arc<Shard>> = match self.shards.lock() {
            Ok(mut shards) => shards.drain().map(|(_, s)| s).collect(),
            Err(_) => return,
        };
        for shard in drained {
            shard.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{now_secs, TagSet};
    use tempfile::TempDir;

    #[test]
    fn test_resolve_is_stable_and_cached() {
        let dir = TempDir::new().unwrap();
        let router = ShardRouter::open(dir.path()).unwrap();

        let a = router.resolve("tenant", "settings").unwrap();
        let b = router.resolve("tenant", "settings").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = router.resolve("tenant", "profiles").unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(router.all_shards().len(), 2);
        router.close();
    }

    #[test]
    fn test_startup_scan_reopens_existing_shards() {
        let dir = TempDir::new().unwrap();
        let id;
        {
            let router = ShardRouter::open(dir.path()).unwrap();
            let shard = router.resolve("tenant", "settings").unwrap();
            id = crate::ident::record_id("k", "settings");
            shard
                .upsert(&id, b"persisted", None, now_secs(), None, &TagSet::new())
                .unwrap();
            router.close();
        }

        let router = ShardRouter::open(dir.path()).unwrap();
        assert_eq!(router.all_shards().len(), 1);
        // the reopened handle serves the same logical pair
        let shard = router.resolve("tenant", "settings").unwrap();
        assert_eq!(
            shard.fetch(&id, now_secs()).unwrap().as_deref(),
            Some(b"persisted".as_slice())
        );
        router.close();
    }

    #[test]
    fn test_non_shard_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();
        let router = ShardRouter::open(dir.path()).unwrap();
        assert!(router.all_shards().is_empty());
        router.close();
    }
}
