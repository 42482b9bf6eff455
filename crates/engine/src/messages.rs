//! Event frames on the engine's WebSocket channel.
//!
//! Every text frame is a `{"type": ..., "data": {...}}` object. Only the
//! events that decide when a submitted graph is finished are modelled;
//! anything else fails to parse and is skipped by the reader.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineMessage {
    /// `node` is `None` once the prompt has no node left to run.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    #[serde(rename = "progress")]
    Progress(ProgressData),

    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptRef),

    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),

    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(PromptRef),
}

impl EngineMessage {
    /// True when this frame says `prompt_id` finished without error.
    pub fn is_completion_of(&self, prompt_id: &str) -> bool {
        match self {
            Self::Executing(data) => data.node.is_none() && data.prompt_id == prompt_id,
            Self::ExecutionSuccess(data) => data.prompt_id == prompt_id,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

/// Sampler step counter.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i32,
    pub max: i32,
}

impl ProgressData {
    pub fn percent(&self) -> u8 {
        if self.max <= 0 {
            return 0;
        }
        let done = i64::from(self.value.clamp(0, self.max));
        u8::try_from(done * 100 / i64::from(self.max)).unwrap_or(100)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: String,
    pub exception_type: String,
    pub exception_message: String,
}

/// Decode one text frame. Unmodelled event types are an error.
pub fn parse_message(text: &str) -> Result<EngineMessage, serde_json::Error> {
    serde_json::from_str(text)
}
