//! Sync wire messages.
//!
//! Request and response share one shape; the exchange is a single
//! request/response round-trip over a textual JSON channel. Payload bytes
//! are hex-encoded on the wire, and queryable properties travel only as tag
//! digests, never raw values.

use serde::{Deserialize, Serialize};

/// Operation kind for one replicated mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxKind {
    Put,
    Delete,
}

/// One pending replication unit.
///
/// Created on every write/delete to a sync-enabled keyspace; removed from
/// the outbox once acknowledged by the remote peer; never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTransaction {
    /// Instance that produced this change, for loop prevention
    pub origin: String,

    /// Target record key
    pub key: String,

    /// Target keyspace
    pub keyspace: String,

    /// Hex-encoded payload (encrypted when the store is configured with a
    /// secret); absent for deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Filter-tag digests for the record; raw queryable values never travel
    #[serde(default)]
    pub queryable_tag_digests: Vec<String>,

    /// Operation kind
    #[serde(rename = "type")]
    pub kind: TxKind,

    /// Epoch-milliseconds when the change was produced
    pub timestamp: i64,
}

/// Shared request/response envelope for one sync round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Account the store belongs to
    pub account_id: String,

    /// Stable origin identifier of the sending instance
    pub instance_id: String,

    /// Optional shared secret for the service endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Keyspace this round covers
    pub keyspace: String,

    /// Replication cursor: last change position acknowledged by this side
    pub tidemark: i64,

    /// Outgoing (request) or incoming (response) transactions
    #[serde(default)]
    pub transactions: Vec<SyncTransaction>,

    /// End-of-transmission marker, set by the peer when no more changes
    /// are pending beyond this response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eot: Option<bool>,

    /// Peer-reported round status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_uppercase() {
        let txn = SyncTransaction {
            origin: "inst-1".to_string(),
            key: "k".to_string(),
            keyspace: "ks".to_string(),
            value: Some(hex::encode(b"payload")),
            queryable_tag_digests: vec!["abc".to_string()],
            kind: TxKind::Put,
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&txn).unwrap();
        assert!(json.contains(r#""type":"PUT""#));

        let parsed: SyncTransaction = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, TxKind::Put);
        assert_eq!(parsed.value, txn.value);
    }

    #[test]
    fn test_delete_omits_value() {
        let txn = SyncTransaction {
            origin: "inst-1".to_string(),
            key: "k".to_string(),
            keyspace: "ks".to_string(),
            value: None,
            queryable_tag_digests: Vec::new(),
            kind: TxKind::Delete,
            timestamp: 0,
        };
        let json = serde_json::to_string(&txn).unwrap();
        assert!(!json.contains("value"));
        assert!(json.contains(r#""type":"DELETE""#));
    }

    #[test]
    fn test_message_round_trip_with_optional_fields_absent() {
        let msg = SyncMessage {
            account_id: "acct".to_string(),
            instance_id: "inst".to_string(),
            secret: None,
            keyspace: "ks".to_string(),
            tidemark: 42,
            transactions: Vec::new(),
            eot: None,
            status: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("eot"));

        let parsed: SyncMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.tidemark, 42);
        assert!(parsed.transactions.is_empty());
    }
}
