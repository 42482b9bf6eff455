//! Configuration loaded from environment variables.
//!
//! Only `TELEGRAM_TOKEN` is required. Every other variable has a default
//! suitable for a single-GPU host running ComfyUI locally; a value that
//! is present but malformed is an error rather than silently replaced.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fluxbot_core::estimation::DEFAULT_JOB_ESTIMATE;
use fluxbot_core::SubmitterId;
use fluxbot_engine::{EngineEndpoint, NodeIds, ProcessConfig};
use fluxbot_gpu::AdmissionConfig;
use fluxbot_worker::WorkerConfig;

pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub telegram_token: String,
    pub telegram_api_url: String,
    /// `host:port` of the engine.
    pub engine_address: String,
    pub comfyui_path: PathBuf,
    pub conda_env: String,
    pub workflow_path: PathBuf,
    pub nodes: NodeIds,
    pub engine_start_timeout: Duration,
    pub engine_stop_grace: Duration,
    pub gpu_index: u32,
    pub admission: AdmissionConfig,
    pub job_estimate: Duration,
    pub max_execution_wait: Option<Duration>,
    /// Downloaded inputs and generated outputs live here.
    pub workspace_dir: PathBuf,
    pub completion_log_path: PathBuf,
    /// Chats allowed to use `/abort` and `/log`. Empty allows every chat.
    pub operator_ids: Vec<SubmitterId>,
}

impl BotConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                     | Default                    |
    /// |-----------------------------|----------------------------|
    /// | `TELEGRAM_TOKEN`            | required                   |
    /// | `TELEGRAM_API_URL`          | `https://api.telegram.org` |
    /// | `COMFYUI_ADDRESS`           | `127.0.0.1:8188`           |
    /// | `COMFYUI_PATH`              | `/opt/ComfyUI`             |
    /// | `CONDA_ENV`                 | `comfyui`                  |
    /// | `WORKFLOW_PATH`             | `FLUX-Kontext-Python.json` |
    /// | `NODE_LOAD_IMAGE`           | `41`                       |
    /// | `NODE_CLIP_TEXT`            | `6`                        |
    /// | `NODE_SEED`                 | `25`                       |
    /// | `ENGINE_START_TIMEOUT_SECS` | `60`                       |
    /// | `ENGINE_STOP_GRACE_SECS`    | `3`                        |
    /// | `GPU_INDEX`                 | `0`                        |
    /// | `VRAM_MAX_USED_PERCENT`     | `20`                       |
    /// | `VRAM_POLL_INTERVAL_SECS`   | `30`                       |
    /// | `JOB_ESTIMATE_SECS`         | `90`                       |
    /// | `MAX_EXECUTION_WAIT_SECS`   | unset (no limit)           |
    /// | `WORKSPACE_DIR`             | `workspace`                |
    /// | `COMPLETION_LOG_PATH`       | `completions.log`          |
    /// | `OPERATOR_IDS`              | empty (comma-separated)    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let telegram_token = env
            .get("TELEGRAM_TOKEN")
            .ok_or(ConfigError::Missing("TELEGRAM_TOKEN"))?;

        let defaults = NodeIds::default();
        let nodes = NodeIds {
            load_image: env.string("NODE_LOAD_IMAGE", &defaults.load_image),
            clip_text: env.string("NODE_CLIP_TEXT", &defaults.clip_text),
            seed: env.string("NODE_SEED", &defaults.seed),
        };

        let admission_defaults = AdmissionConfig::default();
        let max_used_percent: f64 = env.parse("VRAM_MAX_USED_PERCENT", admission_defaults.max_used_percent)?;
        if !(0.0..=100.0).contains(&max_used_percent) {
            return Err(ConfigError::Invalid {
                var: "VRAM_MAX_USED_PERCENT",
                value: max_used_percent.to_string(),
                reason: "must be between 0 and 100".into(),
            });
        }

        let max_execution_wait = match env.get("MAX_EXECUTION_WAIT_SECS") {
            Some(_) => Some(env.secs("MAX_EXECUTION_WAIT_SECS", Duration::ZERO)?),
            None => None,
        };

        Ok(Self {
            telegram_token,
            telegram_api_url: env.string("TELEGRAM_API_URL", DEFAULT_TELEGRAM_API_URL),
            engine_address: env.string("COMFYUI_ADDRESS", "127.0.0.1:8188"),
            comfyui_path: env.string("COMFYUI_PATH", "/opt/ComfyUI").into(),
            conda_env: env.string("CONDA_ENV", "comfyui"),
            workflow_path: env.string("WORKFLOW_PATH", "FLUX-Kontext-Python.json").into(),
            nodes,
            engine_start_timeout: env.secs("ENGINE_START_TIMEOUT_SECS", Duration::from_secs(60))?,
            engine_stop_grace: env.secs("ENGINE_STOP_GRACE_SECS", Duration::from_secs(3))?,
            gpu_index: env.parse("GPU_INDEX", 0)?,
            admission: AdmissionConfig {
                max_used_percent,
                poll_interval: env.secs("VRAM_POLL_INTERVAL_SECS", admission_defaults.poll_interval)?,
            },
            job_estimate: env.secs("JOB_ESTIMATE_SECS", DEFAULT_JOB_ESTIMATE)?,
            max_execution_wait,
            workspace_dir: env.string("WORKSPACE_DIR", "workspace").into(),
            completion_log_path: env.string("COMPLETION_LOG_PATH", "completions.log").into(),
            operator_ids: env.list("OPERATOR_IDS")?,
        })
    }

    /// Launch settings for the engine process.
    pub fn process_config(&self) -> ProcessConfig {
        let mut config = ProcessConfig::comfyui(
            self.comfyui_path.clone(),
            &self.conda_env,
            self.engine_address.clone(),
        );
        config.start_timeout = self.engine_start_timeout;
        config.stop_grace = self.engine_stop_grace;
        config
    }

    pub fn endpoint(&self) -> EngineEndpoint {
        EngineEndpoint::new(self.engine_address.clone())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_execution_wait: self.max_execution_wait,
            ..WorkerConfig::default()
        }
    }

    pub fn is_operator(&self, id: SubmitterId) -> bool {
        self.operator_ids.is_empty() || self.operator_ids.contains(&id)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Non-empty, trimmed value of `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var: key,
                reason: e.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn list<T>(&self, key: &'static str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.get(key) else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse().map_err(|e: T::Err| ConfigError::Invalid {
                    var: key,
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}
