//! The resource probe seam.

use async_trait::async_trait;
use serde::Serialize;

/// Memory usage of one GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub used_mb: u64,
    pub total_mb: u64,
}

impl ResourceUsage {
    /// Used share of total memory, `0.0..=100.0`.
    pub fn used_percent(&self) -> f64 {
        if self.total_mb == 0 {
            return 0.0;
        }
        self.used_mb as f64 * 100.0 / self.total_mb as f64
    }
}

/// The metric could not be read. Never fatal: admission treats it as
/// headroom available.
#[derive(Debug, thiserror::Error)]
#[error("resource probe unavailable: {reason}")]
pub struct ProbeUnavailable {
    pub reason: String,
}

impl ProbeUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Read-only source of the current resource usage.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn usage(&self) -> Result<ResourceUsage, ProbeUnavailable>;
}
