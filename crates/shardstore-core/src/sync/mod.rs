//! Eventual-consistency sync protocol.
//!
//! A [`SyncedStore`] wraps any [`Storage`] backend, intercepting writes and
//! deletes on sync-enabled keyspaces to also append them to a durable
//! outbox, and drives a background push/pull loop against a remote peer at
//! an urgency-determined interval. The protocol is last-writer-wins; loop
//! prevention relies on a stable per-instance origin identifier.
//!
//! [`Storage`]: crate::storage::Storage

mod engine;
mod message;
mod outbox;
mod transport;

pub use engine::SyncedStore;
pub use message::{SyncMessage, SyncTransaction, TxKind};
pub use transport::{HttpTransport, SyncTransport};

use std::time::Duration;

/// Polling tier for the background sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    SuperLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Urgency {
    /// Sleep interval between sync rounds for this tier.
    pub fn interval(self) -> Duration {
        match self {
            Urgency::SuperLow => Duration::from_secs(120),
            Urgency::Low => Duration::from_secs(60),
            Urgency::Medium => Duration::from_secs(30),
            Urgency::High => Duration::from_secs(15),
            Urgency::VeryHigh => Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urgency_intervals() {
        assert_eq!(Urgency::SuperLow.interval(), Duration::from_secs(120));
        assert_eq!(Urgency::Low.interval(), Duration::from_secs(60));
        assert_eq!(Urgency::Medium.interval(), Duration::from_secs(30));
        assert_eq!(Urgency::High.interval(), Duration::from_secs(15));
        assert_eq!(Urgency::VeryHigh.interval(), Duration::from_secs(5));
    }
}
