use crate::lock::LockRecord;
use crate::remote::RemoteError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("not initialized: no .crmsafe/ directory under the project root")]
    NotInitialized,

    #[error("execution lock held: {0}")]
    LockHeld(Box<LockRecord>),

    #[error("lock file {}: {source}", .path.display())]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rate limiter destroyed")]
    RateLimiterDestroyed,

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("record belongs to plan '{found}', expected '{expected}'")]
    PlanMismatch { expected: String, found: String },

    #[error("nothing to resume: {0}")]
    NothingToResume(String),

    #[error("resume checkpoint '{0}' is not an action in the plan")]
    UnknownCheckpoint(String),

    #[error("nothing to roll back: {0}")]
    NothingToRollback(String),

    #[error("execution record not found: {0}")]
    RecordNotFound(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CrmError {
    pub(crate) fn lock_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CrmError::LockIo {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CrmError>;
