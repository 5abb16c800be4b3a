//! The external work function contract.
//!
//! The scheduler treats the downstream worker (GPU inference service,
//! export renderer, upload ingester) as an opaque async call: it is not
//! assumed to be cancellable, only to eventually return — or to be abandoned
//! when the dispatcher's deadline fires.

use async_trait::async_trait;

/// Failure classification for the external work function.
///
/// The split drives the dispatcher's retry policy: transient failures are
/// retried with exponential backoff up to a fixed bound while the job stays
/// `Processing`; permanent failures immediately become terminal `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// Temporary downstream trouble (connect failure, 5xx, overload).
    #[error("Transient infrastructure error: {0}")]
    Transient(String),

    /// Non-retryable failure (bad payload, model rejection, 4xx).
    #[error("Permanent work error: {0}")]
    Permanent(String),
}

/// One invocation of the scarce downstream resource.
///
/// `payload` is the serialized job kind; `generation` identifies the
/// attempt so downstream logs can be correlated, but the scheduler never
/// trusts the callee with lifecycle decisions — a result arriving after
/// cancellation simply fails its compare-and-swap and is discarded.
#[async_trait]
pub trait WorkFunction: Send + Sync {
    async fn invoke(
        &self,
        payload: serde_json::Value,
        generation: u64,
    ) -> Result<serde_json::Value, WorkError>;
}
