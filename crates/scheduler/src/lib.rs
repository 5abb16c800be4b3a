//! CytoSeg job scheduler.
//!
//! One owned [`Scheduler`] instance per process coordinates the whole job
//! lifecycle:
//!
//! - [`admission`] — batch validation and job creation (never blocks on
//!   capacity).
//! - [`queue`] — owner-fair dispatch queue.
//! - [`pool`] — bounded slot pool with guaranteed release.
//! - [`dispatcher`] — parallel worker tasks driving jobs through the
//!   compare-and-swap state machine.
//! - [`cancel`] — idempotent cancellation coordinator.
//! - [`store`] — in-memory [`cytoseg_core::JobStore`] implementation.
//!
//! All mutation goes through the store's CAS primitive; the event hub is an
//! independent subscriber fed from the accepted-transition path only.

pub mod admission;
pub mod cancel;
pub mod dispatcher;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use admission::{AdmissionError, BatchDescriptor, BatchItem, BatchReceipt};
pub use cancel::{BatchCancelSummary, CancelOutcome, CancellationCoordinator};
pub use dispatcher::PoolSpec;
pub use pool::{ResourcePool, SlotGuard};
pub use scheduler::{
    BatchSnapshot, PoolStatsSnapshot, Scheduler, SchedulerConfig, SchedulerStatsSnapshot,
};
pub use store::MemoryJobStore;
