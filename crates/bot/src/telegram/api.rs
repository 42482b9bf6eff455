//! Bot API methods used by the bot.
//!
//! Every method is a POST to `{base}/bot{token}/{method}`; files are
//! downloaded from `{base}/file/bot{token}/{file_path}`.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::json;

use super::types::{ApiResponse, File, Message, Update, User};

/// Extra time allowed on top of the long-poll timeout.
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    /// Transport failure. The URL is stripped since it embeds the token.
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// The Bot API answered with `ok: false`.
    #[error("Telegram API error: {description}")]
    Api {
        code: Option<i64>,
        description: String,
    },

    #[error("file {file_id} has no download path")]
    MissingFilePath { file_id: String },

    #[error("file I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<reqwest::Error> for TelegramError {
    fn from(e: reqwest::Error) -> Self {
        TelegramError::Request(e.without_url())
    }
}

pub struct TelegramApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
    poll_timeout: Duration,
}

impl TelegramApi {
    /// * `base_url` - e.g. `https://api.telegram.org`.
    /// * `poll_timeout` - how long `getUpdates` may hold a request open.
    pub fn new(base_url: &str, token: &str, poll_timeout: Duration) -> Result<Self, TelegramError> {
        let client = reqwest::Client::builder()
            .timeout(poll_timeout + REQUEST_TIMEOUT_MARGIN)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            poll_timeout,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    /// Identity of the bot. Fails on a rejected token.
    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &json!({})).await
    }

    /// Long-poll for updates with ids `>= offset`.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": self.poll_timeout.as_secs(),
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<Message, TelegramError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(message_id) = reply_to {
            body["reply_parameters"] = json!({
                "message_id": message_id,
                "allow_sending_without_reply": true,
            });
        }
        self.call("sendMessage", &body).await
    }

    /// Upload a local image as a photo message.
    pub async fn send_photo(
        &self,
        chat_id: i64,
        path: &Path,
        caption: Option<&str>,
        reply_to: Option<i64>,
    ) -> Result<Message, TelegramError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| TelegramError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output.png".to_string());

        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("photo", reqwest::multipart::Part::bytes(bytes).file_name(file_name));
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }
        if let Some(message_id) = reply_to {
            form = form.text(
                "reply_parameters",
                json!({ "message_id": message_id, "allow_sending_without_reply": true }).to_string(),
            );
        }

        let response = self
            .client
            .post(self.method_url("sendPhoto"))
            .multipart(form)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    pub async fn get_file(&self, file_id: &str) -> Result<File, TelegramError> {
        self.call("getFile", &json!({ "file_id": file_id })).await
    }

    /// Download a file by id to `dest`.
    pub async fn download_file(&self, file_id: &str, dest: &Path) -> Result<(), TelegramError> {
        let file = self.get_file(file_id).await?;
        let file_path = file.file_path.ok_or_else(|| TelegramError::MissingFilePath {
            file_id: file_id.to_string(),
        })?;

        let response = self
            .client
            .get(format!("{}/file/bot{}/{}", self.base_url, self.token, file_path))
            .send()
            .await?
            .error_for_status()?;
        let bytes = response.bytes().await?;

        tokio::fs::write(dest, &bytes).await.map_err(|source| TelegramError::Io {
            path: dest.display().to_string(),
            source,
        })?;
        tracing::debug!(file_id, path = %dest.display(), bytes = bytes.len(), "Downloaded file");
        Ok(())
    }

    // ---- private helpers ----

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &serde_json::Value) -> Result<T, TelegramError> {
        let response = self.client.post(self.method_url(method)).json(body).send().await?;
        Self::parse_response(response).await
    }

    /// Unwrap the `{ok, result}` envelope. Error statuses still carry an
    /// envelope with a description.
    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TelegramError> {
        let status = response.status();
        let envelope: ApiResponse<T> = match response.json().await {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => {
                return Err(TelegramError::Api {
                    code: Some(i64::from(status.as_u16())),
                    description: status.canonical_reason().unwrap_or("unknown").to_string(),
                })
            }
        };

        match envelope {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            other => Err(TelegramError::Api {
                code: other.error_code,
                description: other.description.unwrap_or_else(|| "missing result".to_string()),
            }),
        }
    }
}
