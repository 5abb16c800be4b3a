pub mod batches;
pub mod jobs;
pub mod scheduler;
