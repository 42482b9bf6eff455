//! Long-poll loop and per-message handling.
//!
//! Messages are handled one at a time in update order. A handler only
//! downloads an image and enqueues; generation happens on the worker, so
//! the poller never waits on the GPU.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fluxbot_core::{JobRequest, SubmitterId};
use fluxbot_worker::{CompletionLogError, JobService};
use tokio_util::sync::CancellationToken;

use crate::config::BotConfig;
use crate::conversation::{Conversations, Step};
use crate::telegram::{Message, TelegramApi, TelegramError, Update};
use crate::workspace;

/// Pause after a failed `getUpdates` before polling again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Lines shown by `/log` without an argument.
const DEFAULT_LOG_LINES: usize = 10;
const MAX_LOG_LINES: usize = 100;

const HELP_TEXT: &str = "How to use this bot:\n\n\
    1. Send an image with your prompt written in the caption.\n\n\
    2. Or send an image first; I will ask for a prompt, then send the prompt as a separate message.\n\n\
    3. Or send a text prompt first; I will ask for an image, then send the image.\n\n\
    Commands:\n\
    /queue - how many requests are waiting\n\
    /abort - cancel all queued requests and stop the engine (operators)\n\
    /log [n] - the last n completed jobs (operators)";

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Telegram(#[from] TelegramError),

    #[error(transparent)]
    CompletionLog(#[from] CompletionLogError),
}

/// A slash command sent to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Queue,
    Abort,
    Log(usize),
    Unknown(String),
}

impl Command {
    /// Parse `/name[@bot] [args]`. Returns `None` for anything that is not
    /// a command.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let head = parts.next()?;
        let name = head.split_once('@').map_or(head, |(name, _)| name);

        let command = match name.to_ascii_lowercase().as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "queue" => Command::Queue,
            "abort" => Command::Abort,
            "log" => {
                let lines = parts
                    .next()
                    .and_then(|n| n.parse::<usize>().ok())
                    .unwrap_or(DEFAULT_LOG_LINES)
                    .clamp(1, MAX_LOG_LINES);
                Command::Log(lines)
            }
            other => Command::Unknown(other.to_string()),
        };
        Some(command)
    }
}

pub struct Bot {
    api: Arc<TelegramApi>,
    service: Arc<JobService>,
    config: Arc<BotConfig>,
    conversations: Conversations,
}

impl Bot {
    pub fn new(api: Arc<TelegramApi>, service: Arc<JobService>, config: Arc<BotConfig>) -> Self {
        Self {
            api,
            service,
            config,
            conversations: Conversations::new(),
        }
    }

    /// Poll for updates until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Polling for updates");
        let mut offset = 0;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.api.get_updates(offset) => result,
            };

            match result {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let update_id = update.update_id;
                        if let Err(e) = self.handle_update(update).await {
                            tracing::warn!(update_id, error = %e, "Failed to handle update");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, backoff_secs = POLL_ERROR_BACKOFF.as_secs(), "getUpdates failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        tracing::info!("Update polling stopped");
    }

    pub async fn handle_update(&self, update: Update) -> Result<(), HandlerError> {
        let Some(message) = update.message else {
            return Ok(());
        };

        if message.photo.is_some() {
            return self.handle_photo(&message).await;
        }

        let Some(text) = message.text.as_deref() else {
            return Ok(());
        };
        match Command::parse(text) {
            Some(command) => self.handle_command(&message, command).await,
            None => self.handle_text(&message, text.trim()).await,
        }
    }

    async fn handle_command(&self, message: &Message, command: Command) -> Result<(), HandlerError> {
        let chat_id = message.chat.id;
        tracing::debug!(chat_id, ?command, "Command received");

        let reply = match command {
            Command::Start => {
                if let Some(image) = self.conversations.reset(chat_id) {
                    remove_quietly(&image).await;
                }
                let name = message
                    .from
                    .as_ref()
                    .map(|u| u.first_name.as_str())
                    .filter(|n| !n.is_empty())
                    .unwrap_or("there");
                format!(
                    "Hi {name}!\n\n\
                     I reimagine an image based on your text prompt.\n\n\
                     Send me an image with your prompt in the caption, or send the image and the prompt separately."
                )
            }
            Command::Help => HELP_TEXT.to_string(),
            Command::Queue => match self.service.depth() {
                0 => "The queue is empty.".to_string(),
                1 => "1 request is waiting.".to_string(),
                n => format!("{n} requests are waiting."),
            },
            Command::Abort if self.is_operator(message) => {
                let cleared = self.service.abort().await;
                tracing::info!(chat_id, cleared, "Abort requested");
                format!("Aborted. Cleared {cleared} queued request(s) and stopped the engine.")
            }
            Command::Log(lines) if self.is_operator(message) => {
                let entries = self.service.recent_completions(lines).await?;
                if entries.is_empty() {
                    "No completed jobs yet.".to_string()
                } else {
                    entries.join("\n")
                }
            }
            Command::Abort | Command::Log(_) => "This command is restricted to operators.".to_string(),
            Command::Unknown(name) => format!("Unknown command /{name}. Send /help for usage."),
        };

        self.api
            .send_message(chat_id, &reply, Some(message.message_id))
            .await?;
        Ok(())
    }

    async fn handle_text(&self, message: &Message, text: &str) -> Result<(), HandlerError> {
        if text.is_empty() {
            return Ok(());
        }
        let transition = self.conversations.on_text(message.chat.id, text);
        self.apply(message, transition.step).await
    }

    async fn handle_photo(&self, message: &Message) -> Result<(), HandlerError> {
        let chat_id = message.chat.id;
        let Some(photo) = message.largest_photo() else {
            return Ok(());
        };

        let path = workspace::input_path(&self.config.workspace_dir);
        if let Err(e) = self.api.download_file(&photo.file_id, &path).await {
            tracing::warn!(chat_id, file_id = %photo.file_id, error = %e, "Failed to download photo");
            remove_quietly(&path).await;
            self.api
                .send_message(
                    chat_id,
                    "Sorry, I couldn't download that image. Please try again.",
                    Some(message.message_id),
                )
                .await?;
            return Ok(());
        }

        let transition = self
            .conversations
            .on_photo(chat_id, path, message.caption_text());
        if let Some(stale) = transition.stale_image {
            remove_quietly(&stale).await;
        }
        self.apply(message, transition.step).await
    }

    async fn apply(&self, message: &Message, step: Step) -> Result<(), HandlerError> {
        let chat_id = message.chat.id;
        let reply = match step {
            Step::Submit { prompt, image } => {
                let enqueued = self
                    .service
                    .handle_request(JobRequest {
                        submitter: chat_id,
                        prompt,
                        input_path: image,
                        reply_to: Some(message.message_id),
                    })
                    .await;
                tracing::debug!(chat_id, job_id = %enqueued.job_id, "Request submitted");
                return Ok(());
            }
            Step::AskForImage => "Got your prompt! Now, please send me the image you want me to work on.",
            Step::AskForPrompt => "Got your image! Now, please send me a text prompt for it.",
        };

        self.api
            .send_message(chat_id, reply, Some(message.message_id))
            .await?;
        Ok(())
    }

    fn is_operator(&self, message: &Message) -> bool {
        let id: SubmitterId = message.from.as_ref().map_or(message.chat.id, |u| u.id);
        self.config.is_operator(id)
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}
