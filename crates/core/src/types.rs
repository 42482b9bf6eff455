/// Identifies whoever submitted a job (the chat the reply goes to).
pub type SubmitterId = i64;

/// Jobs are keyed by time-ordered (v7) UUIDs.
pub type JobId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
