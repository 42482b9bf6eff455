//! Minimal Telegram Bot API client over HTTP long polling.

pub mod api;
pub mod types;

pub use api::{TelegramApi, TelegramError};
pub use types::{Chat, File, Message, PhotoSize, Update, User};
