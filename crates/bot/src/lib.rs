//! `fluxbot-bot` library crate.
//!
//! The Telegram front end: configuration, the Bot API client, the
//! per-chat conversation state, command handling, and the notifier that
//! turns worker notices into chat messages. The binary entrypoint lives
//! in `main.rs`.

pub mod config;
pub mod conversation;
pub mod handlers;
pub mod notifier;
pub mod telegram;
pub mod workspace;
