//! Job record, lifecycle state machine, and batch aggregation.
//!
//! A [`Job`] is one schedulable unit of cancellable, resource-bound work.
//! Its `generation` counter is bumped only on accepted transitions and is the
//! basis of the compare-and-swap discipline: a mutation presented with a
//! stale generation is a silent no-op, which is what makes "cancel wins over
//! late completion" hold unconditionally.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{BatchId, DbId, JobId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Supported export formats for export jobs.
pub const VALID_EXPORT_FORMATS: &[&str] = &["coco", "geojson", "xlsx"];

/// Maximum number of items accepted in a single batch submission.
pub const MAX_BATCH_ITEMS: usize = 500;

/// Maximum length of a model identifier.
const MAX_MODEL_LEN: usize = 128;

/// Maximum length of an uploaded filename.
const MAX_FILENAME_LEN: usize = 255;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
///
/// `Queued → Dispatched → Processing → {Completed | Failed | Cancelled}`.
/// Cancellation is legal from any non-terminal state. Terminal states are
/// absorbing: no transition is ever applied after one is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Dispatched,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Whether this state is terminal (absorbing).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match (self, next) {
            (Self::Queued, Self::Dispatched) => true,
            (Self::Dispatched, Self::Processing) => true,
            (Self::Processing, Self::Completed | Self::Failed) => true,
            // Cancellation can arrive at any non-terminal point.
            (s, Self::Cancelled) if !s.is_terminal() => true,
            _ => false,
        }
    }

    /// The set of source states from which `target` is reachable.
    ///
    /// Used by the Postgres store to express the legality check as a
    /// `state = ANY(...)` guard inside the compare-and-swap UPDATE.
    pub fn legal_sources(target: JobState) -> &'static [JobState] {
        match target {
            Self::Queued => &[],
            Self::Dispatched => &[Self::Queued],
            Self::Processing => &[Self::Dispatched],
            Self::Completed | Self::Failed => &[Self::Processing],
            Self::Cancelled => &[Self::Queued, Self::Dispatched, Self::Processing],
        }
    }

    /// Stable string form used in the database and in event frames.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the stable string form back into a state.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "queued" => Ok(Self::Queued),
            "dispatched" => Ok(Self::Dispatched),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CoreError::Internal(format!("Unknown job state: '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Job kinds
// ---------------------------------------------------------------------------

/// Closed tagged variant describing what a job does.
///
/// Validated once at admission; never re-interpreted ad hoc downstream. The
/// serialized form is the opaque payload handed to the external work
/// function.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Run one image through an ML segmentation model.
    SegmentationItem {
        image_id: JobId,
        model: String,
        #[serde(default)]
        threshold: Option<f64>,
    },
    /// Render one export artifact (annotations in a given format).
    ExportItem {
        project_id: DbId,
        format: String,
        image_ids: Vec<JobId>,
    },
    /// Ingest one uploaded image into the platform.
    UploadItem {
        filename: String,
        size_bytes: i64,
        content_type: String,
    },
}

/// Discriminant-only view of [`JobKind`], used for routing jobs to the
/// worker pool that handles them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKindTag {
    Segmentation,
    Export,
    Upload,
}

impl JobKind {
    /// The routing tag for this kind.
    pub fn tag(&self) -> JobKindTag {
        match self {
            Self::SegmentationItem { .. } => JobKindTag::Segmentation,
            Self::ExportItem { .. } => JobKindTag::Export,
            Self::UploadItem { .. } => JobKindTag::Upload,
        }
    }

    /// Validate the variant's payload against its expected schema.
    ///
    /// Called exactly once, at admission. Rules:
    /// - Segmentation: non-empty model name (bounded length); threshold,
    ///   when present, in `(0.0, 1.0]`.
    /// - Export: known format; at least one image.
    /// - Upload: non-empty bounded filename; positive size; `image/*`
    ///   content type.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::SegmentationItem { model, threshold, .. } => {
                if model.is_empty() {
                    return Err(CoreError::Validation(
                        "Segmentation model must not be empty".to_string(),
                    ));
                }
                if model.len() > MAX_MODEL_LEN {
                    return Err(CoreError::Validation(format!(
                        "Segmentation model name must not exceed {MAX_MODEL_LEN} characters"
                    )));
                }
                if let Some(t) = threshold {
                    if !(*t > 0.0 && *t <= 1.0) {
                        return Err(CoreError::Validation(format!(
                            "Segmentation threshold must be in (0.0, 1.0], got {t}"
                        )));
                    }
                }
                Ok(())
            }
            Self::ExportItem { format, image_ids, .. } => {
                if !VALID_EXPORT_FORMATS.contains(&format.as_str()) {
                    return Err(CoreError::Validation(format!(
                        "Unknown export format: '{format}'. Valid formats: {}",
                        VALID_EXPORT_FORMATS.join(", ")
                    )));
                }
                if image_ids.is_empty() {
                    return Err(CoreError::Validation(
                        "Export must reference at least one image".to_string(),
                    ));
                }
                Ok(())
            }
            Self::UploadItem { filename, size_bytes, content_type } => {
                if filename.is_empty() {
                    return Err(CoreError::Validation(
                        "Upload filename must not be empty".to_string(),
                    ));
                }
                if filename.len() > MAX_FILENAME_LEN {
                    return Err(CoreError::Validation(format!(
                        "Upload filename must not exceed {MAX_FILENAME_LEN} characters"
                    )));
                }
                if *size_bytes <= 0 {
                    return Err(CoreError::Validation(format!(
                        "Upload size must be positive, got {size_bytes}"
                    )));
                }
                if !content_type.starts_with("image/") {
                    return Err(CoreError::Validation(format!(
                        "Upload content type must be image/*, got '{content_type}'"
                    )));
                }
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Failure record
// ---------------------------------------------------------------------------

/// Machine-readable failure class recorded on a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorCode {
    /// The external call exceeded the configured deadline.
    Timeout,
    /// The work function reported a non-retryable failure.
    Permanent,
    /// Transient infrastructure failures persisted past the retry bound.
    RetriesExhausted,
}

/// Structured failure stored on a terminal `Failed` job.
///
/// `message` is already redacted for caller visibility; raw downstream
/// detail stays in the server logs only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub code: JobErrorCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: JobErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// The failure recorded when a job's external call times out.
    pub fn timeout(elapsed_secs: u64) -> Self {
        Self::new(
            JobErrorCode::Timeout,
            format!("Work function did not return within {elapsed_secs}s"),
        )
    }
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// The authoritative record of one unit of work.
///
/// Only [`JobStore::try_transition`](crate::store::JobStore::try_transition)
/// may mutate `state`, `generation`, or the terminal fields — no other code
/// path writes job state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub batch_id: Option<BatchId>,
    pub owner_id: DbId,
    #[serde(flatten)]
    pub kind: JobKind,
    pub priority: i32,
    /// Bumped on every accepted mutation; never on rejected ones.
    pub generation: u64,
    pub state: JobState,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    /// Opaque success payload from the work function.
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub cancel_requested: bool,
    pub cancel_requested_at: Option<Timestamp>,
}

impl Job {
    /// Create a freshly admitted job: generation 0, `Queued`.
    pub fn new(
        id: JobId,
        batch_id: Option<BatchId>,
        owner_id: DbId,
        kind: JobKind,
        priority: i32,
    ) -> Self {
        Self {
            id,
            batch_id,
            owner_id,
            kind,
            priority,
            generation: 0,
            state: JobState::Queued,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            cancel_requested: false,
            cancel_requested_at: None,
        }
    }

    /// The event scope this job's transitions are published under.
    ///
    /// Jobs admitted through a batch use the batch id; a job without a
    /// batch falls back to its own id as a single-job scope.
    pub fn scope(&self) -> BatchId {
        self.batch_id.unwrap_or(self.id)
    }

    /// The cancellation token matching this job's current generation.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken { job_id: self.id, generation: self.generation }
    }
}

/// Payload accompanying a state transition.
///
/// The store applies the matching fields as part of the accepted
/// compare-and-swap; a rejected transition applies nothing.
#[derive(Debug, Clone)]
pub enum TransitionDetail {
    /// No extra fields (dispatch, processing).
    None,
    /// Success payload for `Completed`.
    Completed(serde_json::Value),
    /// Structured failure for `Failed`.
    Failed(JobError),
    /// Cancellation reason for `Cancelled`.
    Cancelled { reason: String },
}

/// A cancellation token: valid only while the job's generation matches.
///
/// Presenting a stale token is a silent no-op. Tokens are never
/// reconstructed mid-flight, only checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelToken {
    pub job_id: JobId,
    pub generation: u64,
}

// ---------------------------------------------------------------------------
// Batch aggregation
// ---------------------------------------------------------------------------

/// Aggregate counts for a batch, always derived from constituent jobs —
/// never stored redundantly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub queued: usize,
    pub dispatched: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchCounts {
    /// Derive counts from a set of jobs.
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            match job.state {
                JobState::Queued => counts.queued += 1,
                JobState::Dispatched => counts.dispatched += 1,
                JobState::Processing => counts.processing += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Total number of jobs counted.
    pub fn total(&self) -> usize {
        self.queued + self.dispatched + self.processing + self.completed + self.failed
            + self.cancelled
    }

    /// Whether every constituent job has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.queued == 0 && self.dispatched == 0 && self.processing == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
