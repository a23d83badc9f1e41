//! The remote record service, as seen by the executor.
//!
//! `RecordClient` is the read/write capability a run is handed. The executor
//! never calls it directly for a remote round trip; every call goes through
//! the rate limiter, and schema reads additionally go through the cache.

pub mod http;

use crate::plan::Action;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpRecordClient;

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("missing scope: {0}")]
    Scope(String),

    #[error("rate limited by remote service{}", retry_hint(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response {status}: {body}")]
    Unexpected { status: u16, body: String },
}

impl RemoteError {
    /// Credential and scope problems end the run; everything else is a
    /// failure of the one action that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::Auth(_) | RemoteError::Scope(_))
    }

    /// Short kind tag, logged as a field on action-failure events.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteError::Auth(_) => "auth",
            RemoteError::Scope(_) => "scope",
            RemoteError::RateLimited { .. } => "rate_limited",
            RemoteError::Validation(_) => "validation",
            RemoteError::Conflict(_) => "conflict",
            RemoteError::NotFound(_) => "not_found",
            RemoteError::Transport(_) => "transport",
            RemoteError::Unexpected { .. } => "unexpected",
        }
    }
}

fn retry_hint(retry_after_secs: &Option<u64>) -> String {
    match retry_after_secs {
        Some(secs) => format!(" (retry after {secs}s)"),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// PropertyInfo
// ---------------------------------------------------------------------------

/// Schema entry for one property of an object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub read_only: bool,
}

// ---------------------------------------------------------------------------
// RecordClient
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RecordClient: Send + Sync {
    /// Probe credentials and scopes. Called once before any mutation.
    async fn check_access(&self) -> Result<(), RemoteError>;

    async fn property_schema(&self, object_type: &str) -> Result<Vec<PropertyInfo>, RemoteError>;

    /// Current value of one property. An unset property reads as `""`.
    async fn read_property(
        &self,
        object_type: &str,
        object_id: &str,
        property: &str,
    ) -> Result<serde_json::Value, RemoteError>;

    /// Perform the mutation `action` describes.
    async fn apply(&self, action: &Action) -> Result<(), RemoteError>;

    async fn write_property(
        &self,
        object_type: &str,
        object_id: &str,
        property: &str,
        value: &serde_json::Value,
    ) -> Result<(), RemoteError>;
}
