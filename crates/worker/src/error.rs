use std::time::Duration;

use fluxbot_engine::{EngineClientError, ProcessError};

/// Why a job ended without a result. Reported to the submitter; never
/// stops the worker loop.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("engine failed to start: {0}")]
    EngineStart(#[from] ProcessError),

    #[error(transparent)]
    Engine(#[from] EngineClientError),

    #[error("no result after {}s, engine restarted", .waited.as_secs())]
    ExecutionTimeout { waited: Duration },

    #[error("job aborted by an operator")]
    Aborted,
}
