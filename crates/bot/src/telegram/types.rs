//! Bot API objects, limited to the fields this bot reads.

use serde::Deserialize;

/// Envelope around every Bot API response.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub caption: Option<String>,
    /// Available sizes of a photo, smallest first.
    pub photo: Option<Vec<PhotoSize>>,
}

impl Message {
    /// The largest size of an attached photo.
    pub fn largest_photo(&self) -> Option<&PhotoSize> {
        self.photo.as_ref()?.iter().max_by_key(|p| p.width * p.height)
    }

    /// Caption text, if any and not blank.
    pub fn caption_text(&self) -> Option<&str> {
        self.caption.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub width: i64,
    pub height: i64,
}

/// Result of `getFile`.
#[derive(Debug, Clone, Deserialize)]
pub struct File {
    pub file_id: String,
    /// Relative download path, valid for at least an hour.
    pub file_path: Option<String>,
}
