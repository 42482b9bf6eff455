//! Per-chat state while a request is being assembled.
//!
//! A job needs both an image and a prompt. They can arrive together (a
//! photo with a caption) or one after the other in either order; the
//! half that arrives first is parked here until the other follows.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConversationState {
    #[default]
    Idle,
    /// Have a prompt, need an image.
    AwaitingImage { prompt: String },
    /// Have an image, need a prompt.
    AwaitingPrompt { image: PathBuf },
}

/// What the handler should do after a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Submit { prompt: String, image: PathBuf },
    AskForImage,
    AskForPrompt,
}

/// Result of feeding a message into the state map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub step: Step,
    /// A parked image replaced by a newer one; the caller deletes it.
    pub stale_image: Option<PathBuf>,
}

impl Transition {
    fn new(step: Step) -> Self {
        Self {
            step,
            stale_image: None,
        }
    }
}

#[derive(Default)]
pub struct Conversations {
    states: Mutex<HashMap<i64, ConversationState>>,
}

impl Conversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, chat_id: i64) -> ConversationState {
        self.lock().get(&chat_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, ConversationState>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A plain text message, taken as a prompt.
    pub fn on_text(&self, chat_id: i64, text: &str) -> Transition {
        let mut states = self.lock();
        match states.remove(&chat_id).unwrap_or_default() {
            ConversationState::AwaitingPrompt { image } => Transition::new(Step::Submit {
                prompt: text.to_string(),
                image,
            }),
            ConversationState::Idle | ConversationState::AwaitingImage { .. } => {
                states.insert(
                    chat_id,
                    ConversationState::AwaitingImage {
                        prompt: text.to_string(),
                    },
                );
                Transition::new(Step::AskForImage)
            }
        }
    }

    /// A downloaded photo, with its caption if one was given.
    pub fn on_photo(&self, chat_id: i64, image: PathBuf, caption: Option<&str>) -> Transition {
        let mut states = self.lock();
        let previous = states.remove(&chat_id).unwrap_or_default();

        match (caption, previous) {
            (Some(prompt), previous) => Transition {
                step: Step::Submit {
                    prompt: prompt.to_string(),
                    image,
                },
                stale_image: parked_image(previous),
            },
            (None, ConversationState::AwaitingImage { prompt }) => Transition::new(Step::Submit { prompt, image }),
            (None, previous) => {
                states.insert(chat_id, ConversationState::AwaitingPrompt { image });
                Transition {
                    step: Step::AskForPrompt,
                    stale_image: parked_image(previous),
                }
            }
        }
    }

    /// Forget whatever `chat_id` had parked, returning an image to delete.
    pub fn reset(&self, chat_id: i64) -> Option<PathBuf> {
        self.lock().remove(&chat_id).and_then(parked_image)
    }
}

fn parked_image(state: ConversationState) -> Option<PathBuf> {
    match state {
        ConversationState::AwaitingPrompt { image } => Some(image),
        _ => None,
    }
}
