//! Deterministic identity derivation.
//!
//! Every physical coordinate in the store is a digest: row keys are SHA-224
//! over `(key, keyspace)`, shard file names are the 128-bit MD5 of
//! `(partition, keyspace)`, and filter tags are the MD5 of `"name=value"`.
//! None of these are security boundaries; they exist so that coordinates are
//! fixed-width, filesystem-safe, and free of caller-controlled raw values.

use md5::Md5;
use sha2::{Digest, Sha224, Sha256};

/// Physical row key for a record: SHA-224 over key bytes then keyspace bytes.
pub fn record_id(key: &str, keyspace: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(key.as_bytes());
    hasher.update(keyspace.as_bytes());
    hex::encode(hasher.finalize())
}

/// Filesystem-safe shard file stem: MD5 over partition then keyspace.
///
/// One shard serves exactly one `(partition, keyspace)` pair, so this digest
/// is a stable bijection from the logical pair to the physical file.
pub fn shard_name(partition: &str, keyspace: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(partition.as_bytes());
    hasher.update(keyspace.as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest of one queryable `name=value` pair.
///
/// The same function is used when writing the filter column and when probing
/// it, so raw property values never reach disk or the wire.
pub fn filter_tag(name: &str, value: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{}={}", name, value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive the AES-256 key from the configured secret.
///
/// A legacy scheme derived a fixed IV as `md5(secret ++ constant_salt)` and
/// reused the same (key, IV) pair for every record, which under CBC leaks
/// structural information across records sharing plaintext prefixes. Storage
/// compatibility with that scheme is not required, so the cipher layer
/// instead draws a random IV per record and stores it alongside the
/// ciphertext; only the key derivation survives.
pub fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}
