//! REST API client for the engine's HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (image upload, workflow submission,
//! history retrieval, output download) using [`reqwest`].

use std::path::Path;

use serde::Deserialize;

use crate::history::OutputImage;

/// HTTP client for the single engine instance.
pub struct EngineApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by `POST /prompt` after successfully queuing a
/// workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
}

/// Response returned by `POST /upload/image`.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    /// Name the engine stored the image under. Workflows reference the
    /// image by this name.
    pub name: String,
}

/// Errors from the engine REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineApiError {
    /// The HTTP request itself failed (connection refused, reset, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The engine returned a non-2xx status code.
    #[error("engine API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// Reading the local file to upload failed.
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineApi {
    /// Create a new API client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Upload a local image so workflows can reference it.
    ///
    /// Sends a multipart `POST /upload/image` with `overwrite=true` and
    /// returns the name the engine stored the file under.
    pub async fn upload_image(&self, path: &Path) -> Result<UploadResponse, EngineApiError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| EngineApiError::ReadFile {
                path: path.display().to_string(),
                source,
            })?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input.png".to_string());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/png")?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "true");

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID. Events for the execution are delivered to the
    /// WebSocket session opened with the same client ID.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, EngineApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The returned JSON is
    /// keyed by prompt id and lists every node's outputs.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, EngineApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download the raw bytes of an output image via `GET /view`.
    pub async fn view_image(&self, image: &OutputImage) -> Result<Vec<u8>, EngineApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.folder_type.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`EngineApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, EngineApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(EngineApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, EngineApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
