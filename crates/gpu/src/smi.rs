//! `nvidia-smi` fallback for hosts where NVML cannot be loaded.

use tokio::process::Command;

use crate::probe::{ProbeUnavailable, ResourceUsage};

const NVIDIA_SMI: &str = "nvidia-smi";

/// Query memory of one GPU through `nvidia-smi`.
pub async fn query_memory(gpu_index: u32) -> Result<ResourceUsage, ProbeUnavailable> {
    let output = Command::new(NVIDIA_SMI)
        .args([
            "--query-gpu=memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .arg(format!("--id={gpu_index}"))
        .output()
        .await
        .map_err(|e| ProbeUnavailable::new(format!("failed to run {NVIDIA_SMI}: {e}")))?;

    if !output.status.success() {
        return Err(ProbeUnavailable::new(format!(
            "{NVIDIA_SMI} exited with {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_memory_usage(&stdout).ok_or_else(|| {
        ProbeUnavailable::new(format!("unexpected {NVIDIA_SMI} output: {:?}", stdout.trim()))
    })
}

/// Parse a `memory.used, memory.total` row (MiB, no units).
///
/// Only the first non-empty row is considered.
pub fn parse_memory_usage(stdout: &str) -> Option<ResourceUsage> {
    let line = stdout.lines().map(str::trim).find(|line| !line.is_empty())?;
    let mut fields = line.split(',').map(str::trim);

    let used_mb = fields.next()?.parse::<u64>().ok()?;
    let total_mb = fields.next()?.parse::<u64>().ok()?;
    if total_mb == 0 {
        return None;
    }

    Some(ResourceUsage { used_mb, total_mb })
}
