//! Request/response channel to the sync peer.

use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::sync::message::SyncMessage;

/// Blocking single-round-trip exchange with the remote peer.
///
/// One exchange per keyspace is in flight at a time; the sync loop blocks on
/// it and does not advance to its sleep until the round completes.
pub trait SyncTransport: Send + Sync {
    /// Send a request and block for the peer's response.
    ///
    /// # Errors
    ///
    /// Any transport or decode error; the sync loop treats every failure as
    /// "no changes this round".
    fn exchange(&self, request: &SyncMessage) -> Result<SyncMessage>;
}

/// JSON-over-HTTP transport to a configured service endpoint.
pub struct HttpTransport {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .build();
        Self {
            endpoint: endpoint.into(),
            agent,
        }
    }
}

impl SyncTransport for HttpTransport {
    fn exchange(&self, request: &SyncMessage) -> Result<SyncMessage> {
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(request)
            .map_err(|e| StoreError::Init(format!("Sync endpoint unreachable: {}", e)))?;
        response
            .into_json()
            .map_err(|e| StoreError::Query(format!("Malformed sync response: {}", e)))
    }
}
