//! Store configuration.

use std::path::PathBuf;

use crate::notify::{ChangeListener, DiagnosticsHook};
use crate::sync::Urgency;

/// Configuration surface consumed by the core engine.
///
/// Built with chained setters:
///
/// ```
/// use shardstore_core::config::StoreConfig;
///
/// let config = StoreConfig::new("/tmp/store")
///     .secret("passphrase")
///     .hash_queryables(true);
/// assert!(config.encryption_secret.is_some());
/// ```
#[derive(Clone)]
pub struct StoreConfig {
    /// Directory holding the shard files
    pub base_dir: PathBuf,

    /// Optional symmetric-encryption secret; absent means plaintext at rest
    pub encryption_secret: Option<String>,

    /// Whether queryable properties are stored as digests rather than raw
    /// values. Mandatory for sync-enabled stores.
    pub hash_queryables: bool,

    /// Callback invoked after successful writes/deletes
    pub listener: Option<ChangeListener>,

    /// Optional channel for failures the data path swallows
    pub diagnostics: Option<DiagnosticsHook>,

    /// Polling tier for the sync loop
    pub urgency: Urgency,

    /// Sync service endpoint (e.g., `https://host/sync`)
    pub sync_endpoint: Option<String>,

    /// Account identifier sent with every sync request
    pub account_id: Option<String>,

    /// Optional shared secret sent with every sync request
    pub sync_secret: Option<String>,
}

impl StoreConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            encryption_secret: None,
            hash_queryables: true,
            listener: None,
            diagnostics: None,
            urgency: Urgency::Low,
            sync_endpoint: None,
            account_id: None,
            sync_secret: None,
        }
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.encryption_secret = Some(secret.into());
        self
    }

    pub fn hash_queryables(mut self, hash: bool) -> Self {
        self.hash_queryables = hash;
        self
    }

    pub fn listener(mut self, listener: ChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn diagnostics(mut self, hook: DiagnosticsHook) -> Self {
        self.diagnostics = Some(hook);
        self
    }

    pub fn urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn sync_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.sync_endpoint = Some(endpoint.into());
        self
    }

    pub fn account_id(mut self, account: impl Into<String>) -> Self {
        self.account_id = Some(account.into());
        self
    }

    pub fn sync_secret(mut self, secret: impl Into<String>) -> Self {
        self.sync_secret = Some(secret.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new("/tmp/shards")
            .secret("s3cret")
            .hash_queryables(false)
            .urgency(Urgency::High)
            .sync_endpoint("http://localhost:9090/sync")
            .account_id("acct-1");

        assert_eq!(config.base_dir, PathBuf::from("/tmp/shards"));
        assert_eq!(config.encryption_secret.as_deref(), Some("s3cret"));
        assert!(!config.hash_queryables);
        assert_eq!(config.urgency, Urgency::High);
        assert_eq!(
            config.sync_endpoint.as_deref(),
            Some("http://localhost:9090/sync")
        );
    }

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new("/tmp/shards");
        assert!(config.encryption_secret.is_none());
        assert!(config.hash_queryables);
        assert_eq!(config.urgency, Urgency::Low);
    }
}
