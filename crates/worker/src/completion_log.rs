//! Append-only record of finished jobs.
//!
//! One line per successful job: an RFC 3339 timestamp and the job id.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use fluxbot_core::JobId;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
#[error("completion log {path}: {source}")]
pub struct CompletionLogError {
    pub path: String,
    #[source]
    pub source: std::io::Error,
}

pub struct CompletionLog {
    path: PathBuf,
    /// Keeps appended lines whole.
    write: Mutex<()>,
}

impl CompletionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, source: std::io::Error) -> CompletionLogError {
        CompletionLogError {
            path: self.path.display().to_string(),
            source,
        }
    }

    /// Record that `job_id` completed now.
    pub async fn append(&self, job_id: JobId) -> Result<(), CompletionLogError> {
        let line = format!(
            "{} {job_id}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );

        let _guard = self.write.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.error(e))?;
        file.write_all(line.as_bytes()).await.map_err(|e| self.error(e))?;
        file.flush().await.map_err(|e| self.error(e))?;
        Ok(())
    }

    /// The last `n` lines, oldest first. A missing file has no lines.
    pub async fn tail(&self, n: usize) -> Result<Vec<String>, CompletionLogError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.error(e)),
        };

        let lines: Vec<&str> = content.lines().filter(|line| !line.is_empty()).collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].iter().map(|line| line.to_string()).collect())
    }
}
