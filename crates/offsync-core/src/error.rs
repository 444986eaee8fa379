use thiserror::Error;

pub type OfsResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport failure or request timeout. Always retried with backoff.
    #[error("network error: {0}")]
    Network(String),

    /// The server rejected an item's shape.
    #[error("validation error: {0}")]
    Validation(String),

    /// Two versions of an entity diverged. Routed to resolution, not a failure.
    #[error("conflict on {entity_type}/{entity_id}")]
    Conflict {
        entity_type: String,
        entity_id: String,
    },

    /// Checksum mismatch after decrypt. Never retried.
    #[error("integrity error on {entity_type}/{entity_id}: {reason}")]
    Integrity {
        entity_type: String,
        entity_id: String,
        reason: String,
    },

    /// Credentials rejected by the batch endpoint or the realtime channel.
    #[error("auth error: {0}")]
    Auth(String),

    #[error("local store error: {0}")]
    Store(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    /// Short label used for events and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Network(_) => "network",
            SyncError::Validation(_) => "validation",
            SyncError::Conflict { .. } => "conflict",
            SyncError::Integrity { .. } => "integrity",
            SyncError::Auth(_) => "auth",
            SyncError::Store(_) => "store",
            SyncError::Crypto(_) => "crypto",
            SyncError::Config(_) => "config",
            SyncError::Io(_) => "io",
            SyncError::Other(_) => "other",
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Store(format!("serialization: {e}"))
    }
}
