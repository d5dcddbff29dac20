//! Authorization and calendar access for meetring.
//!
//! - [`oauth`]: the [`Authorizer`] collaborator and its Google implementations
//! - [`SessionManager`]: single-flight, cooldown-guarded token lifecycle
//! - [`CalendarApi`] / [`GoogleCalendarClient`]: one page of `events.list`
//! - [`EventFetcher`]: pagination, 401 recovery and eligibility filtering

pub mod calendar;
pub mod error;
pub mod fetcher;
pub mod oauth;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

pub use calendar::{CalendarApi, EventPage, GoogleCalendarClient, parse_event};
pub use error::{AuthError, FetchError, FetchWarning};
pub use fetcher::{EventFetcher, FetchConfig, FetchOutcome};
pub use oauth::{
    Authorizer, ImplicitGrantAuthorizer, OAuthConfig, PkceAuthorizer, TokenGrant,
    parse_redirect_fragment,
};
pub use session::{BackoffPolicy, Session, SessionConfig, SessionManager};

/// HTTP client shared by the token endpoint and the calendar API.
pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("meetring/", env!("CARGO_PKG_VERSION")))
        .build()
}
