//! Queue position and wait-time estimation.
//!
//! A job at position `p` (1-based) waits for `p - 1` jobs ahead of it,
//! each assumed to take a fixed per-job duration.

use std::time::Duration;

/// Default assumed duration of a single generation job.
pub const DEFAULT_JOB_ESTIMATE: Duration = Duration::from_secs(90);

/// Estimated time before the job at `position` starts.
///
/// Position 0 is treated like position 1 (no wait). Saturates rather
/// than wrapping for absurdly deep queues.
pub fn estimated_wait(position: usize, per_job: Duration) -> Duration {
    let ahead = u32::try_from(position.saturating_sub(1)).unwrap_or(u32::MAX);
    per_job.saturating_mul(ahead)
}

/// Render a wait as a short human-readable string (`"~3 min"`).
pub fn format_wait(wait: Duration) -> String {
    let secs = wait.as_secs();
    if secs == 0 {
        "none".to_string()
    } else if secs < 60 {
        format!("~{secs} s")
    } else {
        format!("~{} min", secs.div_ceil(60))
    }
}
