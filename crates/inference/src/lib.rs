//! HTTP client for the external segmentation inference service.
//!
//! This is the opaque work function the scheduler invokes: the payload goes
//! out, a result JSON comes back, and failures are classified into
//! transient (retryable) and permanent (terminal) for the dispatcher's
//! retry policy.

pub mod client;

pub use client::{InferenceApiError, InferenceClient};
