//! Error types for authorization and calendar fetching.

use std::time::Duration;

use meetring_core::{StoreError, TimerError};
use thiserror::Error;

/// Session and authorization failures.
///
/// `Clone` so a single in-flight refresh can hand the same result to every
/// joined caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No usable credential; user action is needed.
    #[error("sign-in required")]
    Required,

    /// The user declined consent or a policy blocked it.
    #[error("authorization denied: {0}")]
    Denied(String),

    /// Network or rate-limit trouble during authorization.
    #[error("authorization temporarily failed: {0}")]
    Transient(String),

    /// The retry ceiling was reached and the session was signed out.
    #[error("authorization failed {attempts} times; signed out")]
    Exhausted { attempts: u32 },

    #[error("refresh attempted too recently and no token is available")]
    RefreshCooldownActive,

    #[error("gave up after {waited:?} waiting for an in-flight refresh")]
    WaitTimeout { waited: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Only transient failures are retried, and only inside the session manager.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// True when the caller should show sign-in UI rather than an error banner.
    pub fn needs_sign_in(&self) -> bool {
        matches!(self, Self::Required | Self::Exhausted { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Required => "auth_required",
            Self::Denied(_) => "auth_denied",
            Self::Transient(_) => "auth_transient",
            Self::Exhausted { .. } => "auth_exhausted",
            Self::RefreshCooldownActive => "refresh_cooldown_active",
            Self::WaitTimeout { .. } => "timeout",
            Self::Store(_) => "store",
        }
    }
}

impl From<TimerError> for AuthError {
    fn from(err: TimerError) -> Self {
        match err {
            TimerError::Store(e) => Self::Store(e),
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Calendar fetch failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("calendar quota exceeded: {0}")]
    Quota(String),

    /// The calendar API rejected the credential, even after one refresh.
    #[error("calendar API rejected the credential")]
    Unauthorized,

    #[error(transparent)]
    Auth(AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AuthError> for FetchError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Required => Self::Unauthorized,
            other => Self::Auth(other),
        }
    }
}

/// Conditions that degrade a fetch without failing it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchWarning {
    #[error("stopped after {pages} pages with more results pending")]
    PaginationCapped { pages: usize },

    #[error("skipped {skipped} malformed event(s)")]
    Malformed { skipped: usize },
}
