//! Error types for session and backend coordination
//!
//! Every failure the coordinator can report is tagged with an [`ErrorKind`]
//! so callers can pick the right user-facing affordance without parsing
//! message strings.

use std::time::Duration;
use thiserror::Error;

use crate::types::Backend;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Wrong PIN, or the device rejected the unlock
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// An unlocked backend could not provide seed material for derivation
    #[error("Derivation failed: {0}")]
    Derivation(String),

    #[error("Network error: {0}")]
    Network(String),

    /// Hardware device transport failure (not connected, reconnect failed, ...)
    #[error("Device transport error: {0}")]
    Transport(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Backend {0} has no wallet set up")]
    NotSetUp(Backend),

    #[error("Backend {0} already has a wallet")]
    WalletExists(Backend),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Failure classes surfaced to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Derivation,
    Network,
    Storage,
    State,
    Input,
    Internal,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Authentication(_) => ErrorKind::Authentication,
            SessionError::Derivation(_) => ErrorKind::Derivation,
            SessionError::Network(_) | SessionError::Transport(_) | SessionError::Timeout { .. } => {
                ErrorKind::Network
            }
            SessionError::Storage(_) => ErrorKind::Storage,
            SessionError::InvalidState(_)
            | SessionError::NotSetUp(_)
            | SessionError::WalletExists(_) => ErrorKind::State,
            SessionError::Unsupported(_) | SessionError::InvalidInput(_) => ErrorKind::Input,
            SessionError::Crypto(_) | SessionError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Short actionable hint for errors the user can fix themselves.
    pub fn user_action(&self) -> Option<&'static str> {
        match self {
            SessionError::Authentication(_) => Some("Check your PIN and try again"),
            SessionError::Derivation(_) => Some("Unlock the wallet again or reconnect the device"),
            SessionError::Transport(_) => Some("Reconnect the hardware device"),
            SessionError::NotSetUp(_) => Some("Create or import a wallet first"),
            _ => None,
        }
    }

    pub(crate) fn timeout(operation: &'static str, after: Duration) -> Self {
        SessionError::Timeout { operation, after }
    }
}
