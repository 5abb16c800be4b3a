/// Owner and project identifiers are platform-issued BIGSERIAL keys.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Jobs and batches are identified by UUIDs minted at admission time.
pub type JobId = uuid::Uuid;

/// Grouping key for jobs submitted together.
pub type BatchId = uuid::Uuid;
