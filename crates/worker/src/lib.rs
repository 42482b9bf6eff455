//! `fluxbot-worker` library crate.
//!
//! The job queue, the single worker loop that serializes access to the
//! engine, the operator abort path, and the request intake used by the
//! chat layer.

pub mod abort;
pub mod completion_log;
pub mod error;
pub mod notify;
pub mod queue;
pub mod service;
pub mod worker;

pub use abort::AbortController;
pub use completion_log::{CompletionLog, CompletionLogError};
pub use error::JobError;
pub use notify::{Notice, Notifier, NotifyError, Recipient};
pub use queue::{DrainEpoch, JobQueue};
pub use service::{Enqueued, JobService};
pub use worker::{WorkerConfig, WorkerHandle, WorkerLoop};
