//! Job records and generation outcomes.

use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;

use crate::types::{JobId, SubmitterId, Timestamp};

/// A fully assembled request arriving from the chat layer.
///
/// The chat layer is responsible for collecting both the prompt and the
/// input image before handing the request over.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub submitter: SubmitterId,
    pub prompt: String,
    pub input_path: PathBuf,
    /// Message the eventual replies should thread under, if any.
    pub reply_to: Option<i64>,
}

/// A pending generation job.
///
/// Immutable once created. The worker loop deletes `input_path` when it is
/// done with the job, whatever the outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub submitter: SubmitterId,
    pub prompt: String,
    pub input_path: PathBuf,
    pub enqueued_at: Timestamp,
    pub reply_to: Option<i64>,
}

impl Job {
    /// Stamp a request with a fresh id and the current time.
    pub fn from_request(request: JobRequest) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            submitter: request.submitter,
            prompt: request.prompt,
            input_path: request.input_path,
            enqueued_at: Utc::now(),
            reply_to: request.reply_to,
        }
    }
}

/// What the engine produced for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    /// Local path of the downloaded output image. `None` when the engine
    /// finished without producing an image.
    pub output_path: Option<PathBuf>,
    pub success: bool,
}

impl GenerationResult {
    pub fn produced(output_path: PathBuf) -> Self {
        Self {
            output_path: Some(output_path),
            success: true,
        }
    }

    /// The engine finished the execution but its history lists no image.
    pub fn no_output() -> Self {
        Self {
            output_path: None,
            success: false,
        }
    }
}
