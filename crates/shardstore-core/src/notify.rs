//! Collaborator callbacks invoked by the engine.

use std::sync::Arc;

use crate::error::StoreError;

/// Callback invoked with `(key, keyspace)` after every successful write or
/// delete. Consumed by the reactive binding layer to trigger re-reads; the
/// core does not interpret it.
pub type ChangeListener = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Diagnostic channel for failures the data path swallows.
///
/// The read and write paths deliberately map internal failures (failed
/// decrypt, failed decode, failed statement) to absence or `false`. That
/// policy favors availability, but it makes "wrong key" indistinguishable
/// from "missing data" for callers, so every swallowed failure is also
/// reported here for tests and operational visibility.
pub type DiagnosticsHook = Arc<dyn Fn(&StoreError) + Send + Sync>;
