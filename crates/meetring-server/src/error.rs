//! Server error types.

use std::io;
use std::time::Duration;

use meetring_core::{StoreError, TimerError};
use meetring_protocol::{ErrorCode, ErrorResponse};
use meetring_providers::{AuthError, FetchError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket, file, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, encoding, etc.).
    #[error("Protocol error: {0}")]
    Protocol(#[from] meetring_protocol::ProtocolError),

    #[error("timed out during {operation}")]
    Timeout { operation: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("timer error: {0}")]
    Timer(#[from] TimerError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Socket path already in use.
    #[error("Socket path already in use: {path}")]
    SocketInUse { path: String },

    /// Socket path parent directory does not exist.
    #[error("Socket path parent directory does not exist: {path}")]
    SocketPathInvalid { path: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Shutdown requested.
    #[error("Server shutdown requested")]
    Shutdown,
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Creates a socket in use error.
    pub fn socket_in_use(path: impl Into<String>) -> Self {
        Self::SocketInUse { path: path.into() }
    }

    /// Creates a socket path invalid error.
    pub fn socket_path_invalid(path: impl Into<String>) -> Self {
        Self::SocketPathInvalid { path: path.into() }
    }
}

/// Failures of a single alarm dispatch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch did not finish within {after:?}")]
    Timeout { after: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Neither the window nor the notification could be shown.
    #[error("could not alert the user (window: {window}; notification: {notification})")]
    PresentationFailed {
        window: String,
        notification: String,
    },
}

/// Wire code for a session failure.
pub fn auth_error_code(err: &AuthError) -> ErrorCode {
    match err {
        AuthError::Required | AuthError::RefreshCooldownActive => ErrorCode::AuthRequired,
        AuthError::Denied(_) => ErrorCode::AuthDenied,
        AuthError::Transient(_) => ErrorCode::Network,
        AuthError::Exhausted { .. } => ErrorCode::AuthExhausted,
        AuthError::WaitTimeout { .. } => ErrorCode::Timeout,
        AuthError::Store(_) => ErrorCode::InternalError,
    }
}

/// Wire code for a fetch failure.
pub fn fetch_error_code(err: &FetchError) -> ErrorCode {
    match err {
        FetchError::Network(_) => ErrorCode::Network,
        FetchError::Quota(_) => ErrorCode::Quota,
        FetchError::Unauthorized => ErrorCode::Unauthorized,
        FetchError::Auth(auth) => auth_error_code(auth),
        FetchError::Store(_) => ErrorCode::InternalError,
    }
}

pub fn auth_error_response(err: &AuthError) -> ErrorResponse {
    ErrorResponse::new(auth_error_code(err), err.to_string())
}

pub fn fetch_error_response(err: &FetchError) -> ErrorResponse {
    ErrorResponse::new(fetch_error_code(err), err.to_string())
}
