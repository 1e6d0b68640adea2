use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use custody_session::{ErrorKind, SessionError, StorageError};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}

impl From<StorageError> for WalletError {
    fn from(err: StorageError) -> Self {
        WalletError::Session(SessionError::Storage(err))
    }
}

impl WalletError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WalletError::Session(err) => err.kind(),
            WalletError::InvalidInput(_) => ErrorKind::Input,
            WalletError::Config(_) | WalletError::Server(_) => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::State => StatusCode::CONFLICT,
            ErrorKind::Input => StatusCode::BAD_REQUEST,
            ErrorKind::Network => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Derivation | ErrorKind::Storage | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for WalletError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("Request failed: {}", self);
        }

        let action = match &self {
            WalletError::Session(err) => err.user_action(),
            _ => None,
        };
        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "action": action,
        }));

        (status, body).into_response()
    }
}
