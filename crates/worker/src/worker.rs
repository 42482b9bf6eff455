//! The single worker loop.
//!
//! Takes one job at a time off the queue, brings the engine up (gated on
//! GPU headroom for cold starts), runs the job, reports the outcome, and
//! removes the job's files. When the queue is empty afterwards the engine
//! is stopped.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fluxbot_core::{GenerationResult, Job};
use fluxbot_engine::{EngineLifecycle, GenerationClient};
use fluxbot_gpu::AdmissionController;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::completion_log::CompletionLog;
use crate::error::JobError;
use crate::notify::{Notice, Notifier, Recipient};
use crate::queue::{DrainEpoch, JobQueue};

/// Default bound on joining the loop at shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound on waiting for one execution. `None` waits forever.
    pub max_execution_wait: Option<Duration>,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_execution_wait: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

pub struct WorkerLoop {
    queue: Arc<JobQueue>,
    engine: Arc<dyn EngineLifecycle>,
    client: Arc<dyn GenerationClient>,
    admission: Arc<AdmissionController>,
    notifier: Arc<dyn Notifier>,
    completions: Arc<CompletionLog>,
    config: WorkerConfig,
}

impl WorkerLoop {
    pub fn new(
        queue: Arc<JobQueue>,
        engine: Arc<dyn EngineLifecycle>,
        client: Arc<dyn GenerationClient>,
        admission: Arc<AdmissionController>,
        notifier: Arc<dyn Notifier>,
        completions: Arc<CompletionLog>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            engine,
            client,
            admission,
            notifier,
            completions,
            config,
        }
    }

    /// Run the loop on its own task.
    pub fn spawn(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let shutdown_timeout = self.config.shutdown_timeout;
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { self.run(cancel).await })
        };
        WorkerHandle {
            cancel,
            task,
            shutdown_timeout,
        }
    }

    /// Process jobs until `cancel` fires. Cancellation is only observed
    /// between jobs.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Worker loop started");

        loop {
            let (job, epoch) = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Worker loop shutting down");
                    break;
                }
                next = self.queue.dequeue_tracked() => next,
            };
            self.process(job, epoch).await;
        }
    }

    /// Everything that happens to one dequeued job.
    pub async fn process(&self, job: Job, epoch: DrainEpoch) {
        let recipient = Recipient::of(&job);
        tracing::info!(job_id = %job.id, submitter = job.submitter, "Job started");
        self.queue.intake_settled().await;
        self.notify(recipient, Notice::Started).await;

        let outcome = match self.execute(&job, recipient, epoch).await {
            Err(e) if !matches!(e, JobError::Aborted) && self.queue.drained_since(epoch) => {
                tracing::info!(job_id = %job.id, error = %e, "In-flight job failed after abort");
                Err(JobError::Aborted)
            }
            other => other,
        };

        let output = match outcome {
            Ok(GenerationResult {
                output_path: Some(output),
                success: true,
            }) => {
                tracing::info!(job_id = %job.id, output = %output.display(), "Job completed");
                self.notify(recipient, Notice::Completed { output: output.clone() }).await;
                if let Err(e) = self.completions.append(job.id).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to record completion");
                }
                Some(output)
            }
            Ok(result) => {
                tracing::warn!(job_id = %job.id, "Job finished without output");
                self.notify(recipient, Notice::NoOutput).await;
                result.output_path
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Job failed");
                if matches!(e, JobError::ExecutionTimeout { .. }) {
                    self.engine.kill().await;
                }
                self.notify(recipient, Notice::Failed { reason: e.to_string() }).await;
                None
            }
        };

        remove_artifact(&job.input_path).await;
        if let Some(output) = output {
            remove_artifact(&output).await;
        }

        if self.queue.depth() == 0 {
            tracing::info!("Queue empty, stopping engine");
            self.engine.stop().await;
        }
    }

    async fn execute(
        &self,
        job: &Job,
        recipient: Recipient,
        epoch: DrainEpoch,
    ) -> Result<GenerationResult, JobError> {
        self.ensure_engine(recipient, epoch).await?;
        self.check_not_drained(epoch)?;

        let asset = self.client.upload_asset(&job.input_path).await?;
        self.check_not_drained(epoch)?;

        let execution_id = self.client.submit(&asset, &job.prompt).await?;
        self.check_not_drained(epoch)?;
        tracing::info!(job_id = %job.id, execution_id = %execution_id, "Job submitted");

        match self.config.max_execution_wait {
            Some(limit) => tokio::time::timeout(limit, self.client.await_completion(&execution_id))
                .await
                .map_err(|_| JobError::ExecutionTimeout { waited: limit })?
                .map_err(JobError::from),
            None => Ok(self.client.await_completion(&execution_id).await?),
        }
    }

    /// Start the engine if it is down, waiting for GPU headroom first.
    async fn ensure_engine(&self, recipient: Recipient, epoch: DrainEpoch) -> Result<(), JobError> {
        if self.engine.is_running().await {
            tracing::debug!("Engine already running, skipping admission");
            return Ok(());
        }
        self.check_not_drained(epoch)?;

        tokio::select! {
            _ = self.admission.wait_for_headroom(|used_percent| {
                self.notify(recipient, Notice::AwaitingResources { used_percent })
            }) => {}
            _ = self.queue.drained_after(epoch) => return Err(JobError::Aborted),
        }
        self.check_not_drained(epoch)?;

        self.engine.start().await?;
        Ok(())
    }

    fn check_not_drained(&self, epoch: DrainEpoch) -> Result<(), JobError> {
        if self.queue.drained_since(epoch) {
            return Err(JobError::Aborted);
        }
        Ok(())
    }

    async fn notify(&self, recipient: Recipient, notice: Notice) {
        deliver(self.notifier.as_ref(), recipient, notice).await;
    }
}

/// Send a notice, logging delivery failures.
pub(crate) async fn deliver(notifier: &dyn Notifier, recipient: Recipient, notice: Notice) {
    if let Err(e) = notifier.notify(recipient, notice).await {
        tracing::warn!(submitter = recipient.submitter, error = %e, "Notification not delivered");
    }
}

/// Delete a job file. A file that is already gone is fine.
pub(crate) async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed job file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove job file"),
    }
}

/// Owner of a spawned [`WorkerLoop`].
pub struct WorkerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop taking jobs and wait (bounded) for the loop to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        match tokio::time::timeout(self.shutdown_timeout, self.task).await {
            Ok(Ok(())) => tracing::info!("Worker loop stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Worker loop task failed"),
            Err(_) => tracing::warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Worker loop did not stop in time",
            ),
        }
    }
}
