//! Engine process control and ComfyUI client.
//!
//! Provides the process controller that launches and tears down the
//! engine, typed WebSocket message parsing, the HTTP API wrapper, the
//! workflow template, and the [`GenerationClient`] that runs one job
//! end to end.

pub mod api;
pub mod client;
pub mod executor;
pub mod history;
pub mod messages;
pub mod process;
pub mod workflow;

pub use client::EngineEndpoint;
pub use executor::{EngineClient, EngineClientError, GenerationClient};
pub use process::{EngineLifecycle, EngineProcessController, EngineProcessState, ProcessConfig, ProcessError};
pub use workflow::{NodeIds, WorkflowError, WorkflowTemplate};
