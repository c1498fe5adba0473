use thiserror::Error;

use crate::store::StoreError;

/// Every failure the synchronization layer can surface to a caller.
///
/// Transport failures are recoverable. The poller turns them into a
/// connectivity flag and the mute synchronizer falls back to its cache, so
/// they only reach callers of explicit writes.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("service rejected request (HTTP {status}): {reason}")]
    Service { status: u16, reason: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("a mute change for {0} is already in flight")]
    MutationInFlight(String),

    #[error("push registration unavailable: {0}")]
    Push(String),
}

impl SyncError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Human-readable reason for UI alerts.
    pub fn reason(&self) -> String {
        match self {
            Self::Service { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}
