//! Batch admission.
//!
//! Validation is all-or-nothing: every item is checked before any job is
//! created, so a rejected submission leaves no partial batch behind.
//! Admission never blocks on capacity — it persists the jobs, emits their
//! `Queued` events, hands them to the routed pools' queues, and returns.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use cytoseg_core::error::CoreError;
use cytoseg_core::job::{Job, JobKind, JobKindTag, MAX_BATCH_ITEMS};
use cytoseg_core::store::StoreError;
use cytoseg_core::types::{BatchId, DbId, JobId};

use crate::dispatcher::PoolRuntime;
use crate::scheduler::SchedulerCore;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One item of a batch submission.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
    #[serde(flatten)]
    pub kind: JobKind,
    #[serde(default)]
    pub priority: i32,
}

/// A batch submission as received from the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchDescriptor {
    pub items: Vec<BatchItem>,
}

/// What the caller gets back from an accepted submission.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchReceipt {
    pub batch_id: BatchId,
    /// Job ids in item order.
    pub job_ids: Vec<JobId>,
}

/// Why a submission was rejected. No jobs exist after any of these.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Batch must contain at least one item")]
    Empty,

    #[error("Batch exceeds the maximum of {MAX_BATCH_ITEMS} items ({0} submitted)")]
    TooManyItems(usize),

    #[error("Item {index}: {source}")]
    InvalidItem {
        index: usize,
        #[source]
        source: CoreError,
    },

    #[error("No pool is configured to handle {0:?} jobs")]
    UnroutableKind(JobKindTag),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Validate and admit a batch on behalf of `owner_id`.
pub(crate) async fn admit(
    core: &SchedulerCore,
    routes: &HashMap<JobKindTag, Arc<PoolRuntime>>,
    owner_id: DbId,
    descriptor: BatchDescriptor,
) -> Result<BatchReceipt, AdmissionError> {
    if descriptor.items.is_empty() {
        return Err(AdmissionError::Empty);
    }
    if descriptor.items.len() > MAX_BATCH_ITEMS {
        return Err(AdmissionError::TooManyItems(descriptor.items.len()));
    }
    for (index, item) in descriptor.items.iter().enumerate() {
        item.kind
            .validate()
            .map_err(|source| AdmissionError::InvalidItem { index, source })?;
        let tag = item.kind.tag();
        if !routes.contains_key(&tag) {
            return Err(AdmissionError::UnroutableKind(tag));
        }
    }

    let batch_id = uuid::Uuid::now_v7();
    let jobs: Vec<Job> = descriptor
        .items
        .into_iter()
        .map(|item| {
            Job::new(uuid::Uuid::now_v7(), Some(batch_id), owner_id, item.kind, item.priority)
        })
        .collect();
    let job_ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();

    core.store.insert_batch(jobs.clone()).await?;

    for job in &jobs {
        core.publish_queued(job);
        // Routing was checked above, so the lookup cannot miss.
        if let Some(pool) = routes.get(&job.kind.tag()) {
            pool.enqueue(job);
        }
    }

    tracing::info!(
        batch_id = %batch_id,
        owner_id,
        jobs = job_ids.len(),
        "Batch admitted",
    );
    Ok(BatchReceipt { batch_id, job_ids })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
