//! Unbounded FIFO of pending jobs.
//!
//! Jobs live in a mutex-guarded deque; a fair semaphore counts them so
//! blocked dequeuers are woken strictly in arrival order. Every
//! [`JobQueue::drain_all`] advances a drain epoch under the same lock,
//! letting the worker tell whether the job it holds was dequeued before
//! an abort.
//!
//! Intake holds [`JobQueue::intake`] from enqueue until the submitter has
//! been told the position. Anything that reports on a job it took out of
//! the queue first waits on [`JobQueue::intake_settled`], so a submitter
//! always hears "queued" before any later notice.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use fluxbot_core::Job;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify, Semaphore};

/// Number of drains performed before a job was dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainEpoch(u64);

struct State {
    jobs: VecDeque<Job>,
    epoch: u64,
}

pub struct JobQueue {
    state: Mutex<State>,
    /// One permit per queued job. Never closed.
    available: Semaphore,
    drained: Notify,
    intake: AsyncMutex<()>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                jobs: VecDeque::new(),
                epoch: 0,
            }),
            available: Semaphore::new(0),
            drained: Notify::new(),
            intake: AsyncMutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `job`; returns its 1-based position.
    pub fn enqueue(&self, job: Job) -> usize {
        let mut state = self.lock();
        state.jobs.push_back(job);
        // Permit added under the lock so a concurrent drain sees the job
        // and its permit together.
        self.available.add_permits(1);
        state.jobs.len()
    }

    /// Wait for a job and remove the head of the queue.
    pub async fn dequeue_blocking(&self) -> Job {
        self.dequeue_tracked().await.0
    }

    /// [`dequeue_blocking`](Self::dequeue_blocking), also returning the
    /// drain epoch observed at removal.
    ///
    /// Cancel safe: a dropped call never removes a job.
    pub async fn dequeue_tracked(&self) -> (Job, DrainEpoch) {
        loop {
            if let Ok(permit) = self.available.acquire().await {
                permit.forget();
            }

            let popped = {
                let mut state = self.lock();
                let epoch = DrainEpoch(state.epoch);
                state.jobs.pop_front().map(|job| (job, epoch))
            };
            if let Some(popped) = popped {
                return popped;
            }
            // A drain took the job this permit stood for.
        }
    }

    /// Taken around an enqueue and the notice that reports it.
    pub async fn intake(&self) -> AsyncMutexGuard<'_, ()> {
        self.intake.lock().await
    }

    /// Wait until no intake that began earlier is still announcing.
    pub async fn intake_settled(&self) {
        drop(self.intake.lock().await);
    }

    /// Jobs currently waiting.
    pub fn depth(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Copy of the waiting jobs in service order.
    pub fn snapshot(&self) -> Vec<Job> {
        self.lock().jobs.iter().cloned().collect()
    }

    /// Remove and return every waiting job, in service order.
    pub fn drain_all(&self) -> Vec<Job> {
        let drained: Vec<Job> = {
            let mut state = self.lock();
            state.epoch += 1;
            let drained: Vec<Job> = state.jobs.drain(..).collect();
            self.available.forget_permits(drained.len());
            drained
        };
        self.drained.notify_waiters();
        drained
    }

    /// Whether a drain happened after `epoch` was observed.
    pub fn drained_since(&self, epoch: DrainEpoch) -> bool {
        self.lock().epoch != epoch.0
    }

    /// Resolve once a drain happens after `epoch` was observed.
    pub async fn drained_after(&self, epoch: DrainEpoch) {
        loop {
            let notified = self.drained.notified();
            if self.drained_since(epoch) {
                return;
            }
            notified.await;
        }
    }
}
