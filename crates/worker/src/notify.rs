//! Outbound notifications to submitters.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use fluxbot_core::{Job, SubmitterId};

/// Where a notice goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recipient {
    pub submitter: SubmitterId,
    /// Message to thread the notice under, if any.
    pub reply_to: Option<i64>,
}

impl Recipient {
    pub fn of(job: &Job) -> Self {
        Self {
            submitter: job.submitter,
            reply_to: job.reply_to,
        }
    }
}

/// Something a submitter is told about their job.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Accepted; `position` is 1-based.
    Queued {
        position: usize,
        estimated_wait: Duration,
    },
    /// The worker picked the job up.
    Started,
    /// A cold start is waiting for GPU memory.
    AwaitingResources { used_percent: f64 },
    /// Terminal: the output image is at `output` until the notifier
    /// returns.
    Completed { output: PathBuf },
    /// Terminal: the engine finished without an image.
    NoOutput,
    /// Terminal: the job failed.
    Failed { reason: String },
    /// The job was removed from the queue by an operator before it ran.
    Aborted,
}

impl Notice {
    /// Whether this is the single final notice of a job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Notice::Completed { .. } | Notice::NoOutput | Notice::Failed { .. } | Notice::Aborted
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Delivery channel back to submitters.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: Recipient, notice: Notice) -> Result<(), NotifyError>;
}
