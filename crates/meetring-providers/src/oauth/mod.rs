//! OAuth 2.0 authorization for Google APIs.
//!
//! Two flows implement [`Authorizer`]:
//!
//! - [`ImplicitGrantAuthorizer`]: browser consent returning an access token in
//!   the redirect fragment. It cannot refresh silently.
//! - [`PkceAuthorizer`]: authorization code with PKCE. The refresh token it
//!   obtains lets non-interactive refreshes succeed without a browser.
//!
//! Both listen on a loopback port for the redirect.

mod implicit;
mod loopback;
mod pkce;

use std::time::Duration;

use meetring_core::BoxFuture;

use crate::error::AuthError;

pub use implicit::ImplicitGrantAuthorizer;
pub use loopback::{BrowserOpener, system_browser};
pub use pkce::{PkceAuthorizer, PkceFlow};

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const CALENDAR_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/calendar.readonly";

/// Result of a successful authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Lifetime in seconds, as reported by the authorization server.
    pub expires_in: Option<i64>,
    pub refresh_token: Option<String>,
}

impl TokenGrant {
    pub fn new(access_token: impl Into<String>, expires_in: Option<i64>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in,
            refresh_token: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }
}

/// Obtains access tokens.
///
/// With `interactive = false` an implementation must not prompt the user; it
/// either refreshes silently (using `refresh_token` when it has one) or fails
/// with [`AuthError::Required`].
pub trait Authorizer: Send + Sync {
    fn authorize<'a>(
        &'a self,
        interactive: bool,
        refresh_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<TokenGrant, AuthError>>;
}

/// Client registration and endpoints.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    /// Required by Google for installed-app code exchange; unused by the implicit flow.
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
    pub auth_url: String,
    pub token_url: String,
    /// Inclusive range of loopback ports to try for the redirect listener.
    pub port_range: (u16, u16),
    /// How long to wait for the browser to come back.
    pub callback_timeout: Duration,
}

impl OAuthConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            scopes: vec![CALENDAR_READONLY_SCOPE.to_string()],
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            port_range: (8080, 8090),
            callback_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_endpoints(mut self, auth_url: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.auth_url = auth_url.into();
        self.token_url = token_url.into();
        self
    }

    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range = (start, end);
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.client_id.trim().is_empty() {
            return Err("OAuth client_id is required".to_string());
        }
        if self.scopes.is_empty() {
            return Err("at least one OAuth scope is required".to_string());
        }
        if self.port_range.0 > self.port_range.1 {
            return Err("invalid loopback port range".to_string());
        }
        Ok(())
    }
}

/// Maps an OAuth `error` code to the session taxonomy.
pub fn map_oauth_error(code: &str, description: Option<&str>) -> AuthError {
    let detail = match description {
        Some(d) if !d.is_empty() => format!("{code}: {d}"),
        _ => code.to_string(),
    };
    match code {
        "access_denied" | "unauthorized_client" | "admin_policy_enforced" => AuthError::Denied(detail),
        "temporarily_unavailable" | "server_error" | "slow_down" => AuthError::Transient(detail),
        "login_required" | "interaction_required" | "consent_required" | "invalid_grant" => {
            AuthError::Required
        }
        _ => AuthError::Denied(detail),
    }
}

/// Parses an implicit-grant redirect (`access_token`, `expires_in`, `error`).
///
/// Accepts the raw fragment or query string, with or without its leading `#`/`?`.
pub fn parse_redirect_fragment(fragment: &str) -> Result<TokenGrant, AuthError> {
    let params = loopback::parse_params(fragment.trim_start_matches(['#', '?']));

    if let Some(code) = params.get("error") {
        return Err(map_oauth_error(
            code,
            params.get("error_description").map(String::as_str),
        ));
    }

    let access_token = params
        .get("access_token")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::Denied("redirect carried no access token".to_string()))?;
    let expires_in = params.get("expires_in").and_then(|s| s.parse::<i64>().ok());

    Ok(TokenGrant::new(access_token.clone(), expires_in))
}
