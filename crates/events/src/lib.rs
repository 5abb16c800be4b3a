//! CytoSeg event broadcast hub.
//!
//! Every accepted job transition is appended to a per-scope sequenced log
//! and fanned out to live subscribers:
//!
//! - [`JobEvent`] — the canonical lifecycle event envelope.
//! - [`EventHub`] — per-scope append-only replay buffer plus
//!   `tokio::sync::broadcast` live delivery.
//! - [`Subscription`] — replay-then-live handle handed to WebSocket
//!   connections, with seq-based deduplication at the seam.

pub mod hub;

pub use hub::{EventHub, JobEvent, Subscription};
