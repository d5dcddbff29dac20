//! Request and response types.

use chrono::{DateTime, Utc};
use meetring_core::CalendarEvent;
use serde::{Deserialize, Serialize};

use crate::PROTOCOL_VERSION;

/// Wrapper around every message on the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub protocol_version: String,
    /// Echoed back in the response for correlation.
    pub request_id: String,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(request_id: impl Into<String>, payload: T) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn request(request_id: impl Into<String>, request: T) -> Self {
        Self::new(request_id, request)
    }

    pub fn response(request_id: impl Into<String>, response: T) -> Self {
        Self::new(request_id, response)
    }

    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }
}

/// Actions a client may ask of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    /// Run a poll cycle now and return the resulting snapshot.
    RefreshMeetings,
    CheckAuth,
    /// Interactive sign-in; may open a browser and take minutes.
    SignIn,
    SignOut,
    GetStatusUpdate,
    /// Return the persisted snapshot without fetching.
    GetUpcomingMeetings,
    Ping,
}

impl Request {
    pub fn action(&self) -> &'static str {
        match self {
            Self::RefreshMeetings => "refreshMeetings",
            Self::CheckAuth => "checkAuth",
            Self::SignIn => "signIn",
            Self::SignOut => "signOut",
            Self::GetStatusUpdate => "getStatusUpdate",
            Self::GetUpcomingMeetings => "getUpcomingMeetings",
            Self::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Meetings {
        meetings: Vec<CalendarEvent>,
        /// Non-fatal conditions from the fetch (page cap hit, skipped items).
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },

    Auth {
        #[serde(flatten)]
        status: AuthStatus,
    },

    Status {
        #[serde(flatten)]
        status: StatusUpdate,
    },

    Ok,

    Error {
        #[serde(flatten)]
        error: ErrorResponse,
    },

    Pong,
}

impl Response {
    pub fn meetings(meetings: Vec<CalendarEvent>, warnings: Vec<String>) -> Self {
        Self::Meetings { meetings, warnings }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            error: ErrorResponse::new(code, message),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Error { .. })
    }

    pub fn as_error(&self) -> Option<&ErrorResponse> {
        match self {
            Self::Error { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub signed_in: bool,
    #[serde(default)]
    pub authenticating: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Daemon state summary for `getStatusUpdate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(flatten)]
    pub auth: AuthStatus,
    pub uptime_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorResponse>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub upcoming_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_meeting: Option<CalendarEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

/// Wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No usable credential; the user must sign in.
    AuthRequired,
    AuthDenied,
    /// Retry ceiling hit; the session was signed out.
    AuthExhausted,
    /// The calendar API rejected the credential twice.
    Unauthorized,
    Network,
    Quota,
    Timeout,
    InvalidRequest,
    InternalError,
}

impl ErrorCode {
    pub fn description(&self) -> &'static str {
        match self {
            Self::AuthRequired => "Sign-in required",
            Self::AuthDenied => "Authorization was denied",
            Self::AuthExhausted => "Signed out after repeated authorization failures",
            Self::Unauthorized => "Calendar access was rejected",
            Self::Network => "Network error",
            Self::Quota => "Calendar API quota exceeded",
            Self::Timeout => "The request timed out",
            Self::InvalidRequest => "The request was invalid",
            Self::InternalError => "An internal error occurred",
        }
    }

    /// Codes a UI should answer with a sign-in prompt rather than an error banner.
    pub fn needs_sign_in(&self) -> bool {
        matches!(
            self,
            Self::AuthRequired | Self::AuthExhausted | Self::Unauthorized
        )
    }
}
