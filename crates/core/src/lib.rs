//! CytoSeg core domain types.
//!
//! This crate holds the job record and its state machine, the closed set of
//! job kinds, batch aggregation, the cancellation token, and the narrow
//! persistence and work-function contracts consumed by the scheduler. It has
//! no internal dependencies so every other crate can build on it.

pub mod error;
pub mod job;
pub mod store;
pub mod types;
pub mod work;

pub use error::CoreError;
pub use job::{
    BatchCounts, CancelToken, Job, JobError, JobErrorCode, JobKind, JobKindTag, JobState,
    TransitionDetail,
};
pub use store::{JobStore, StoreError};
pub use work::{WorkError, WorkFunction};
