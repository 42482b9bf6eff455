//! Shared value types for the generation queue.
//!
//! Everything in this crate is plain data passed by value between the
//! request intake, the worker loop, and the engine layer. No I/O.

pub mod estimation;
pub mod job;
pub mod types;

pub use job::{GenerationResult, Job, JobRequest};
pub use types::{JobId, SubmitterId, Timestamp};
