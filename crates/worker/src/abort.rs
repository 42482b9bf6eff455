//! Operator abort: empty the queue and kill the engine.

use std::sync::Arc;

use fluxbot_core::Job;
use fluxbot_engine::EngineLifecycle;

use crate::queue::JobQueue;

pub struct AbortController {
    queue: Arc<JobQueue>,
    engine: Arc<dyn EngineLifecycle>,
}

impl AbortController {
    pub fn new(queue: Arc<JobQueue>, engine: Arc<dyn EngineLifecycle>) -> Self {
        Self { queue, engine }
    }

    /// Drain every waiting job, then force-kill the engine.
    ///
    /// The drain comes first so the worker cannot pick up a waiting job
    /// once the kill is under way; a job it already holds sees the drain
    /// and ends as aborted. Returns the displaced jobs so each submitter
    /// can be told.
    pub async fn kill_and_drain(&self) -> Vec<Job> {
        let drained = self.queue.drain_all();
        tracing::warn!(drained = drained.len(), "Abort requested, queue drained");

        self.engine.kill().await;
        tracing::info!("Engine killed by abort");

        drained
    }
}
