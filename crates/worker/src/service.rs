//! Request intake and operator commands used by the chat layer.

use std::sync::Arc;
use std::time::Duration;

use fluxbot_core::estimation::{estimated_wait, DEFAULT_JOB_ESTIMATE};
use fluxbot_core::{Job, JobId, JobRequest};

use crate::abort::AbortController;
use crate::completion_log::{CompletionLog, CompletionLogError};
use crate::notify::{Notice, Notifier, Recipient};
use crate::queue::JobQueue;
use crate::worker::{deliver, remove_artifact};

/// Outcome of accepting a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub job_id: JobId,
    pub position: usize,
    pub estimated_wait: Duration,
}

pub struct JobService {
    queue: Arc<JobQueue>,
    abort: AbortController,
    notifier: Arc<dyn Notifier>,
    completions: Arc<CompletionLog>,
    job_estimate: Duration,
}

impl JobService {
    pub fn new(
        queue: Arc<JobQueue>,
        abort: AbortController,
        notifier: Arc<dyn Notifier>,
        completions: Arc<CompletionLog>,
    ) -> Self {
        Self {
            queue,
            abort,
            notifier,
            completions,
            job_estimate: DEFAULT_JOB_ESTIMATE,
        }
    }

    /// Override the assumed duration of one job.
    pub fn with_job_estimate(mut self, job_estimate: Duration) -> Self {
        self.job_estimate = job_estimate;
        self
    }

    /// Queue a complete request and tell the submitter where it landed.
    pub async fn handle_request(&self, request: JobRequest) -> Enqueued {
        let job = Job::from_request(request);
        let job_id = job.id;
        let recipient = Recipient::of(&job);

        let intake = self.queue.intake().await;
        let position = self.queue.enqueue(job);
        let wait = estimated_wait(position, self.job_estimate);
        tracing::info!(
            job_id = %job_id,
            submitter = recipient.submitter,
            position,
            estimated_wait_secs = wait.as_secs(),
            "Job queued",
        );

        deliver(
            self.notifier.as_ref(),
            recipient,
            Notice::Queued {
                position,
                estimated_wait: wait,
            },
        )
        .await;
        drop(intake);

        Enqueued {
            job_id,
            position,
            estimated_wait: wait,
        }
    }

    /// Jobs waiting, not counting the one in flight.
    pub fn depth(&self) -> usize {
        self.queue.depth()
    }

    /// Drain the queue, kill the engine, and notify every displaced
    /// submitter. Returns how many jobs were cleared.
    pub async fn abort(&self) -> usize {
        let displaced = self.abort.kill_and_drain().await;
        self.queue.intake_settled().await;

        for job in &displaced {
            tracing::info!(job_id = %job.id, submitter = job.submitter, "Job displaced by abort");
            deliver(self.notifier.as_ref(), Recipient::of(job), Notice::Aborted).await;
            remove_artifact(&job.input_path).await;
        }

        displaced.len()
    }

    /// Last `n` completion log lines.
    pub async fn recent_completions(&self, n: usize) -> Result<Vec<String>, CompletionLogError> {
        self.completions.tail(n).await
    }
}
