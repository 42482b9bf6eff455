//! Delivers worker notices as Telegram messages.

use std::sync::Arc;

use async_trait::async_trait;
use fluxbot_core::estimation::format_wait;
use fluxbot_worker::{Notice, Notifier, NotifyError, Recipient};

use crate::telegram::TelegramApi;

const COMPLETED_CAPTION: &str = "Generation complete!";

pub struct TelegramNotifier {
    api: Arc<TelegramApi>,
}

impl TelegramNotifier {
    pub fn new(api: Arc<TelegramApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, recipient: Recipient, notice: Notice) -> Result<(), NotifyError> {
        let chat_id = recipient.submitter;
        let result = match &notice {
            Notice::Completed { output } => {
                self.api
                    .send_photo(chat_id, output, Some(COMPLETED_CAPTION), recipient.reply_to)
                    .await
            }
            other => {
                self.api
                    .send_message(chat_id, &render(other), recipient.reply_to)
                    .await
            }
        };

        result
            .map(|_| ())
            .map_err(|e| NotifyError(e.to_string()))
    }
}

/// Chat text for a notice. `Completed` is sent as a photo; its text is the
/// caption.
pub fn render(notice: &Notice) -> String {
    match notice {
        Notice::Queued {
            position: 1,
            ..
        } => "Request queued. You're next in line.".to_string(),
        Notice::Queued {
            position,
            estimated_wait,
        } => format!(
            "Request queued at position {position}. Estimated wait: {}.",
            format_wait(*estimated_wait)
        ),
        Notice::Started => "Image and prompt received. Starting generation... This may take a moment.".to_string(),
        Notice::AwaitingResources { used_percent } => format!(
            "The GPU is busy ({used_percent:.0}% memory in use). Your job will start once it frees up."
        ),
        Notice::Completed { .. } => COMPLETED_CAPTION.to_string(),
        Notice::NoOutput => "Sorry, something went wrong during generation and no image was produced.".to_string(),
        Notice::Failed { reason } => format!("An error occurred: {reason}"),
        Notice::Aborted => "Your request was cancelled by an operator. Please send it again later.".to_string(),
    }
}
