//! Core data types for the storage layer.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Sentinel TTL meaning "never expires".
pub const NO_EXPIRY: i64 = -1;

/// Separator used for the on-disk delimited filter-tag column.
pub(crate) const TAG_SEPARATOR: char = ',';

/// Current time as whole epoch seconds (record timestamps, TTL arithmetic).
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Current time as epoch milliseconds (sync transaction timestamps).
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Schema tag attached to a record at write time: a (name, version) pair.
///
/// Used only to select migration candidates; unrelated to the storage format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTag {
    /// Stored type name (e.g., "user_profile")
    pub name: String,

    /// Integer schema version
    pub version: i64,
}

impl ModelTag {
    pub fn new(name: impl Into<String>, version: i64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// Order-independent set of filter-tag digests for one record.
///
/// The disk form is a single delimited string column, matched at query time
/// by substring containment. A query with multiple tags requires all of them
/// (logical AND).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: Vec<String>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from pre-computed digests (e.g., off the sync wire).
    pub fn from_digests(digests: Vec<String>) -> Self {
        let mut set = Self::new();
        for digest in digests {
            set.insert(digest);
        }
        set
    }

    /// Digest a `name=value` pair and add it to the set.
    pub fn insert_pair(&mut self, name: &str, value: &str) {
        self.insert(crate::ident::filter_tag(name, value));
    }

    /// Add a `name=value` pair without digesting it.
    ///
    /// Only valid for stores that disabled queryable hashing; sync-enabled
    /// stores reject that configuration outright.
    pub fn insert_raw_pair(&mut self, name: &str, value: &str) {
        self.insert(format!("{}={}", name, value));
    }

    fn insert(&mut self, digest: String) {
        if !self.tags.contains(&digest) {
            self.tags.push(digest);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn digests(&self) -> &[String] {
        &self.tags
    }

    /// Disk form: digests joined with the tag separator, wrapped in leading
    /// and trailing separators so query patterns match whole tags rather
    /// than substrings of one (raw-mode tags like `aa=bb` would otherwise
    /// satisfy a probe for `a=b`).
    pub fn to_column(&self) -> String {
        if self.tags.is_empty() {
            return String::new();
        }
        let sep = TAG_SEPARATOR.to_string();
        format!("{}{}{}", sep, self.tags.join(&sep), sep)
    }

    /// Parse the disk form back into a set.
    pub fn from_column(column: &str) -> Self {
        let tags = column
            .split(TAG_SEPARATOR)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { tags }
    }

    /// True when every digest in `required` is present in this set.
    pub fn contains_all(&self, required: &TagSet) -> bool {
        required.tags.iter().all(|t| self.tags.contains(t))
    }
}

/// The atomic stored unit, in its owned row form.
#[derive(Debug, Clone)]
pub struct Record {
    /// Outer addressing namespace
    pub partition: String,

    /// Logical collection within the partition
    pub keyspace: String,

    /// Caller-supplied record key
    pub key: String,

    /// Serialized (and possibly encrypted) payload
    pub value: Vec<u8>,

    /// Absolute expiry epoch-seconds; `None` never expires
    pub ttl: Option<i64>,

    /// Epoch-seconds of the last write, used for iteration order
    pub timestamp: i64,

    /// Optional schema tag for migration scans
    pub model: Option<ModelTag>,

    /// Derived filter tags
    pub tags: TagSet,
}

/// Transaction bracketing control for [`Storage::transact`].
///
/// [`Storage::transact`]: crate::storage::Storage::transact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxControl {
    Begin,
    Commit,
    Rollback,
}

/// Explicit schema declaration for stored types.
///
/// The store never inspects a value's runtime shape; a type that wants
/// versioned migration and tag-indexed queries declares both itself. Types
/// without filterable properties return an empty list.
pub trait Document: Serialize + DeserializeOwned {
    /// Schema tag recorded with every instance of this type.
    fn model() -> ModelTag;

    /// Queryable `(name, value)` pairs for this instance.
    ///
    /// These are digested into filter tags at write time; raw values are
    /// never stored when queryable hashing is enabled.
    fn filter_values(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_set_round_trips_column_form() {
        let mut set = TagSet::new();
        set.insert_pair("color", "red");
        set.insert_pair("size", "large");

        let column = set.to_column();
        let parsed = TagSet::from_column(&column);

        assert_eq!(parsed, set);
    }

    #[test]
    fn test_tag_set_is_order_independent_for_matching() {
        let mut a = TagSet::new();
        a.insert_pair("color", "red");
        a.insert_pair("size", "large");

        let mut b = TagSet::new();
        b.insert_pair("size", "large");
        b.insert_pair("color", "red");

        assert!(a.contains_all(&b));
        assert!(b.contains_all(&a));
    }

    #[test]
    fn test_tag_set_deduplicates() {
        let mut set = TagSet::new();
        set.insert_pair("color", "red");
        set.insert_pair("color", "red");
        assert_eq!(set.digests().len(), 1);
    }

    #[test]
    fn test_contains_all_requires_superset() {
        let mut record_tags = TagSet::new();
        record_tags.insert_pair("color", "red");

        let mut required = TagSet::new();
        required.insert_pair("color", "red");
        required.insert_pair("size", "large");

        assert!(!record_tags.contains_all(&required));
        // empty requirement always matches
        assert!(record_tags.contains_all(&TagSet::new()));
    }

    #[test]
    fn test_empty_column_parses_to_empty_set() {
        assert!(TagSet::from_column("").is_empty());
    }

    #[test]
    fn test_column_form_wraps_tags_in_separators() {
        let mut set = TagSet::new();
        set.insert_pair("color", "red");
        let column = set.to_column();
        assert!(column.starts_with(TAG_SEPARATOR));
        assert!(column.ends_with(TAG_SEPARATOR));
        assert!(TagSet::new().to_column().is_empty());
    }

    #[test]
    fn test_model_tag_equality() {
        assert_eq!(ModelTag::new("user", 1), ModelTag::new("user", 1));
        assert_ne!(ModelTag::new("user", 1), ModelTag::new("user", 2));
    }
}
