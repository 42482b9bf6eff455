//! Job execution against a running engine.
//!
//! [`EngineClient`] uploads the input image, submits the materialized
//! workflow, waits on the event channel for the execution to finish,
//! and downloads the first output image.
//!
//! The event channel is opened before the workflow is posted and held
//! until [`GenerationClient::await_completion`] consumes it, so the
//! completion event cannot slip past between submission and waiting.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fluxbot_core::GenerationResult;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

use crate::api::EngineApi;
use crate::client::{EngineEndpoint, EventConnection};
use crate::history::first_output_image;
use crate::messages::{parse_message, EngineMessage};
use crate::workflow::{WorkflowError, WorkflowTemplate};

/// Failures while executing one job against the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineClientError {
    #[error("upload failed: {0}")]
    UploadError(String),

    #[error("submission failed: {0}")]
    SubmissionError(String),

    #[error("connection to engine lost: {0}")]
    ConnectionLost(String),

    /// The engine reported an error while executing the workflow.
    #[error("engine execution failed at node {node_id}: {message}")]
    ExecutionFailed { node_id: String, message: String },

    #[error("failed to retrieve result: {0}")]
    RetrievalError(String),
}

/// The engine-facing steps of one job.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Transfer the input image; returns the name the engine stored it
    /// under.
    async fn upload_asset(&self, path: &Path) -> Result<String, EngineClientError>;

    /// Submit a job referencing an uploaded image; returns the
    /// execution id.
    async fn submit(&self, asset_name: &str, prompt: &str) -> Result<String, EngineClientError>;

    /// Block until `execution_id` finishes, then fetch its output.
    ///
    /// An execution that finishes without an image yields an
    /// unsuccessful [`GenerationResult`], not an error.
    async fn await_completion(&self, execution_id: &str) -> Result<GenerationResult, EngineClientError>;
}

/// Engine client bound to one session token.
pub struct EngineClient {
    endpoint: EngineEndpoint,
    api: EngineApi,
    workflow: WorkflowTemplate,
    client_id: String,
    output_dir: PathBuf,
    /// Event channel opened by `submit`, consumed by `await_completion`.
    pending: Mutex<Option<EventConnection>>,
}

impl EngineClient {
    /// * `output_dir` - where downloaded output images are written.
    pub fn new(endpoint: EngineEndpoint, workflow: WorkflowTemplate, output_dir: impl Into<PathBuf>) -> Self {
        let api = EngineApi::new(endpoint.api_url());
        Self {
            endpoint,
            api,
            workflow,
            client_id: uuid::Uuid::new_v4().to_string(),
            output_dir: output_dir.into(),
            pending: Mutex::new(None),
        }
    }

    /// Session token identifying this client on the event channel.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn open_events(&self) -> Result<EventConnection, EngineClientError> {
        self.endpoint
            .connect(&self.client_id)
            .await
            .map_err(|e| EngineClientError::ConnectionLost(e.to_string()))
    }

    /// Read frames until `execution_id` completes or fails.
    async fn wait_for(&self, conn: &mut EventConnection, execution_id: &str) -> Result<(), EngineClientError> {
        while let Some(frame) = conn.ws_stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match parse_message(&text) {
                    Ok(msg) if msg.is_completion_of(execution_id) => {
                        tracing::info!(prompt_id = %execution_id, "Execution completed");
                        return Ok(());
                    }
                    Ok(EngineMessage::ExecutionError(data)) if data.prompt_id == execution_id => {
                        tracing::error!(
                            prompt_id = %execution_id,
                            node_id = %data.node_id,
                            error_type = %data.exception_type,
                            error_message = %data.exception_message,
                            "Execution error",
                        );
                        return Err(EngineClientError::ExecutionFailed {
                            node_id: data.node_id,
                            message: data.exception_message,
                        });
                    }
                    Ok(EngineMessage::ExecutionInterrupted(data)) if data.prompt_id == execution_id => {
                        return Err(EngineClientError::ConnectionLost(
                            "execution interrupted by the engine".to_string(),
                        ));
                    }
                    Ok(EngineMessage::Progress(data)) => {
                        tracing::debug!(
                            prompt_id = %execution_id,
                            percent = data.percent(),
                            "Generation progress",
                        );
                    }
                    Ok(other) => {
                        tracing::trace!(event = ?other, "Engine event");
                    }
                    Err(e) => {
                        tracing::trace!(error = %e, raw_message = %text, "Skipping engine frame");
                    }
                },
                Ok(Message::Binary(_)) => {
                    // Preview images.
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    return Err(EngineClientError::ConnectionLost(format!(
                        "engine closed the event channel ({frame:?})"
                    )));
                }
                Err(e) => return Err(EngineClientError::ConnectionLost(e.to_string())),
            }
        }

        Err(EngineClientError::ConnectionLost(
            "event channel ended".to_string(),
        ))
    }

    async fn fetch_result(&self, execution_id: &str) -> Result<GenerationResult, EngineClientError> {
        let history = self
            .api
            .get_history(execution_id)
            .await
            .map_err(|e| EngineClientError::RetrievalError(e.to_string()))?;

        let Some(image) = first_output_image(&history, execution_id) else {
            tracing::warn!(prompt_id = %execution_id, "Execution finished without an output image");
            return Ok(GenerationResult::no_output());
        };

        let bytes = self
            .api
            .view_image(&image)
            .await
            .map_err(|e| EngineClientError::RetrievalError(e.to_string()))?;

        let output_path = self
            .output_dir
            .join(format!("output_{execution_id}.{}", image.extension()));

        if let Err(e) = tokio::fs::write(&output_path, &bytes).await {
            let _ = tokio::fs::remove_file(&output_path).await;
            return Err(EngineClientError::RetrievalError(format!(
                "failed to write {}: {e}",
                output_path.display()
            )));
        }

        tracing::info!(
            prompt_id = %execution_id,
            path = %output_path.display(),
            bytes = bytes.len(),
            "Saved output image",
        );
        Ok(GenerationResult::produced(output_path))
    }
}

#[async_trait]
impl GenerationClient for EngineClient {
    async fn upload_asset(&self, path: &Path) -> Result<String, EngineClientError> {
        let uploaded = self
            .api
            .upload_image(path)
            .await
            .map_err(|e| EngineClientError::UploadError(e.to_string()))?;
        tracing::debug!(name = %uploaded.name, "Input image uploaded");
        Ok(uploaded.name)
    }

    async fn submit(&self, asset_name: &str, prompt: &str) -> Result<String, EngineClientError> {
        let workflow = self
            .workflow
            .materialize(asset_name, prompt)
            .map_err(|e: WorkflowError| EngineClientError::SubmissionError(e.to_string()))?;

        // Every submission gets its own channel. One left behind by a job
        // that never awaited may belong to an engine that has since died.
        let mut pending = self.pending.lock().await;
        if let Some(mut stale) = pending.take() {
            tracing::debug!(client_id = %stale.client_id, "Discarding unused event channel");
            let _ = stale.ws_stream.close(None).await;
        }
        *pending = Some(self.open_events().await?);

        let response = match self.api.submit_workflow(&workflow, &self.client_id).await {
            Ok(response) => response,
            Err(e) => {
                // The channel may belong to an engine instance that is
                // about to go away; never carry it into the next job.
                *pending = None;
                return Err(EngineClientError::SubmissionError(e.to_string()));
            }
        };

        tracing::info!(prompt_id = %response.prompt_id, "Workflow submitted to engine");
        Ok(response.prompt_id)
    }

    async fn await_completion(&self, execution_id: &str) -> Result<GenerationResult, EngineClientError> {
        let conn = self.pending.lock().await.take();
        let mut conn = match conn {
            Some(conn) => conn,
            None => self.open_events().await?,
        };

        let outcome = self.wait_for(&mut conn, execution_id).await;
        let _ = conn.ws_stream.close(None).await;
        outcome?;

        self.fetch_result(execution_id).await
    }
}
