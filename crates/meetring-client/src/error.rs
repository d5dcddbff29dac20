//! Client error types.

use std::fmt;

use meetring_protocol::{ErrorResponse, ProtocolError};
use meetring_server::ServerError;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug)]
pub enum ClientError {
    Config(String),
    Io(std::io::Error),
    /// Could not reach the daemon.
    Connection(String),
    Protocol(String),
    Timeout(String),
    /// The daemon answered with an error.
    Remote(ErrorResponse),
    /// The daemon answered with something other than what was asked for.
    UnexpectedResponse(String),
    /// Failure while running the daemon itself.
    Daemon(String),
}

impl ClientError {
    /// Whether the user should run `meetring sign-in` to fix this.
    pub fn needs_sign_in(&self) -> bool {
        matches!(self, Self::Remote(e) if e.code.needs_sign_in())
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Connection(msg) => write!(f, "connection error: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Timeout(msg) => write!(f, "timeout: {}", msg),
            Self::Remote(e) => write!(f, "{}", e),
            Self::UnexpectedResponse(what) => write!(f, "unexpected response: {}", what),
            Self::Daemon(msg) => write!(f, "daemon error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::Io(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<ServerError> for ClientError {
    fn from(err: ServerError) -> Self {
        Self::Daemon(err.to_string())
    }
}

impl From<meetring_core::TimerError> for ClientError {
    fn from(err: meetring_core::TimerError) -> Self {
        Self::Daemon(err.to_string())
    }
}
