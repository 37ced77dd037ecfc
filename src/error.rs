use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for the sync pipeline. Transient variants are retried
/// internally up to a fixed budget; auth and validation variants always
/// propagate to the caller.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authorization expired, re-consent required")]
    AuthExpired,
    #[error("temporary authorization failure: {0}")]
    TemporaryAuth(String),
    #[error(transparent)]
    Network(#[from] reqwest::Error),
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("sync interrupted after {fetched} records, resume from cursor {cursor:?}: {reason}")]
    Partial {
        cursor: Option<String>,
        fetched: usize,
        reason: String,
    },
    #[error(transparent)]
    Vault(#[from] crate::vault::Error),
    #[error(transparent)]
    Persistence(#[from] crate::store::Error),
}

impl SyncError {
    /// Transient failures are contained within the component that hit them
    /// and retried with bounded backoff. Everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::RateLimited { .. } | SyncError::TemporaryAuth(_)
        )
    }

    pub fn resume_cursor(&self) -> Option<&str> {
        match self {
            SyncError::Partial { cursor, .. } => cursor.as_deref(),
            _ => None,
        }
    }
}
