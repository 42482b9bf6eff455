//! NVML-based GPU memory probe.
//!
//! [`NvmlProbe`] wraps the NVIDIA Management Library to read memory
//! usage of one GPU. When NVML cannot be initialised (no drivers, a
//! container without the library) or a read fails, it falls back to
//! `nvidia-smi`.

use async_trait::async_trait;
use nvml_wrapper::Nvml;

use crate::probe::{ProbeUnavailable, ResourceProbe, ResourceUsage};
use crate::smi;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Reads VRAM usage of the GPU at `gpu_index`.
pub struct NvmlProbe {
    /// `None` when NVML could not be initialised.
    nvml: Option<Nvml>,
    gpu_index: u32,
}

impl NvmlProbe {
    /// Attempt to initialise NVML. Never fails; without NVML every read
    /// goes through `nvidia-smi`.
    pub fn new(gpu_index: u32) -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                tracing::info!(gpu_index, "NVML initialised successfully");
                Some(nvml)
            }
            Err(e) => {
                tracing::warn!(error = %e, "NVML unavailable, falling back to nvidia-smi");
                None
            }
        };
        Self { nvml, gpu_index }
    }

    pub fn gpu_index(&self) -> u32 {
        self.gpu_index
    }

    pub fn nvml_available(&self) -> bool {
        self.nvml.is_some()
    }

    fn read_device(&self, nvml: &Nvml) -> Result<ResourceUsage, nvml_wrapper::error::NvmlError> {
        let device = nvml.device_by_index(self.gpu_index)?;
        let mem_info = device.memory_info()?;

        Ok(ResourceUsage {
            used_mb: mem_info.used / BYTES_PER_MB,
            total_mb: mem_info.total / BYTES_PER_MB,
        })
    }
}

#[async_trait]
impl ResourceProbe for NvmlProbe {
    async fn usage(&self) -> Result<ResourceUsage, ProbeUnavailable> {
        if let Some(nvml) = self.nvml.as_ref() {
            match self.read_device(nvml) {
                Ok(usage) if usage.total_mb > 0 => return Ok(usage),
                Ok(_) => {
                    tracing::warn!(gpu_index = self.gpu_index, "NVML reported zero total memory");
                }
                Err(e) => {
                    tracing::warn!(gpu_index = self.gpu_index, error = %e, "NVML memory query failed");
                }
            }
        }

        smi::query_memory(self.gpu_index).await
    }
}
