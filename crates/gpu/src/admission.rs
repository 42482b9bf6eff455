//! Resource admission controller.
//!
//! Gates a cold engine start on GPU memory headroom. The gate fails
//! open: a probe that cannot be read admits the job, so a missing GPU
//! tool can never stall the queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::probe::ResourceProbe;

/// Threshold and polling cadence for cold starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionConfig {
    /// Headroom exists while used memory is strictly below this share.
    pub max_used_percent: f64,
    pub poll_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_used_percent: 20.0,
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Outcome of one headroom check.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Headroom {
    Available,
    /// Used share at or above the threshold.
    Exhausted { used_percent: f64 },
}

pub struct AdmissionController {
    probe: Arc<dyn ResourceProbe>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(probe: Arc<dyn ResourceProbe>, config: AdmissionConfig) -> Self {
        Self { probe, config }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Whether used memory is below `below_percent`. Never fails.
    pub async fn has_headroom(&self, below_percent: f64) -> bool {
        self.check(below_percent).await == Headroom::Available
    }

    async fn check(&self, below_percent: f64) -> Headroom {
        match self.probe.usage().await {
            Ok(usage) => {
                let used_percent = usage.used_percent();
                if used_percent < below_percent {
                    tracing::debug!(used_percent, below_percent, "GPU headroom available");
                    Headroom::Available
                } else {
                    Headroom::Exhausted { used_percent }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "GPU probe unavailable, admitting job");
                Headroom::Available
            }
        }
    }

    /// Suspend until [`has_headroom`](Self::has_headroom) holds.
    ///
    /// `on_waiting` receives the observed used percentage after every
    /// failed check, before the next poll interval. A probe that is busy
    /// `n` times and then clear is checked `n + 1` times and reports
    /// waiting `n` times.
    pub async fn await_headroom<F, Fut>(&self, below_percent: f64, poll_interval: Duration, mut on_waiting: F)
    where
        F: FnMut(f64) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let mut polls = 0u32;
        loop {
            polls += 1;
            match self.check(below_percent).await {
                Headroom::Available => {
                    if polls > 1 {
                        tracing::info!(polls, "GPU headroom recovered");
                    }
                    return;
                }
                Headroom::Exhausted { used_percent } => {
                    tracing::info!(
                        used_percent,
                        below_percent,
                        retry_in_secs = poll_interval.as_secs(),
                        "Waiting for GPU memory headroom",
                    );
                    on_waiting(used_percent).await;
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    /// [`await_headroom`](Self::await_headroom) with the configured
    /// threshold and interval.
    pub async fn wait_for_headroom<F, Fut>(&self, on_waiting: F)
    where
        F: FnMut(f64) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        self.await_headroom(self.config.max_used_percent, self.config.poll_interval, on_waiting)
            .await;
    }
}
