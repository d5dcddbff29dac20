//! Authorization code flow with PKCE (RFC 7636) and refresh-token renewal.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng as _;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use meetring_core::BoxFuture;

use super::implicit::random_state;
use super::loopback::{BrowserOpener, LoopbackServer, abandoned, result_page, system_browser};
use super::{Authorizer, OAuthConfig, TokenGrant, map_oauth_error};
use crate::error::AuthError;

const CALLBACK_PATH: &str = "/callback";

/// Verifier length in bytes, before base64 encoding.
const CODE_VERIFIER_LENGTH: usize = 32;

/// Per-attempt PKCE secrets.
#[derive(Debug, Clone)]
pub struct PkceFlow {
    pub verifier: String,
    /// `BASE64URL(SHA256(verifier))`.
    pub challenge: String,
    pub state: String,
}

impl PkceFlow {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let bytes: Vec<u8> = (0..CODE_VERIFIER_LENGTH).map(|_| rng.random()).collect();
        let verifier = URL_SAFE_NO_PAD.encode(&bytes);
        let challenge = compute_challenge(&verifier);
        Self {
            verifier,
            challenge,
            state: random_state(),
        }
    }

    pub fn build_auth_url(
        &self,
        auth_url: &str,
        client_id: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&\
            code_challenge={}&code_challenge_method=S256&state={}&\
            access_type=offline&prompt=consent",
            auth_url,
            urlencoding::encode(client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes.join(" ")),
            urlencoding::encode(&self.challenge),
            urlencoding::encode(&self.state),
        )
    }
}

impl Default for PkceFlow {
    fn default() -> Self {
        Self::new()
    }
}

fn compute_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Browser consent with PKCE, renewing silently from a stored refresh token.
#[derive(Clone)]
pub struct PkceAuthorizer {
    config: OAuthConfig,
    http: reqwest::Client,
    browser: BrowserOpener,
}

impl PkceAuthorizer {
    pub fn new(config: OAuthConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            browser: system_browser(),
        }
    }

    pub fn with_browser(mut self, browser: BrowserOpener) -> Self {
        self.browser = browser;
        self
    }

    /// Exchanges a refresh token for a new access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let mut params = vec![
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.as_str()));
        }
        let grant = self.token_request(&params).await?;
        info!("refreshed access token");
        Ok(grant)
    }

    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, AuthError> {
        let mut params = vec![
            ("client_id", self.config.client_id.as_str()),
            ("code", code),
            ("code_verifier", verifier),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.as_str()));
        }
        let grant = self.token_request(&params).await?;
        info!(has_refresh_token = grant.refresh_token.is_some(), "obtained tokens");
        Ok(grant)
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenGrant, AuthError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::Transient(format!("token request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Transient(format!("failed to read token response: {e}")))?;

        if !status.is_success() {
            return Err(classify_token_error(status, &body));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::Transient(format!("invalid token response: {e}")))?;
        let mut grant = TokenGrant::new(token.access_token, token.expires_in);
        grant.refresh_token = token.refresh_token;
        Ok(grant)
    }

    async fn run_flow(&self) -> Result<TokenGrant, AuthError> {
        let flow = PkceFlow::new();
        let server = LoopbackServer::bind(self.config.port_range).await?;
        let redirect_uri = server.redirect_uri(CALLBACK_PATH);
        let url = flow.build_auth_url(
            &self.config.auth_url,
            &self.config.client_id,
            &redirect_uri,
            &self.config.scopes,
        );

        info!("starting PKCE sign-in; opening browser");
        debug!(%url, "authorization URL");
        (self.browser)(&url);

        let wait = async {
            loop {
                let request = server.next_request().await;
                if request.path != CALLBACK_PATH {
                    request.respond("404 Not Found", "").await;
                    continue;
                }
                let params = request.params();
                let outcome = if let Some(code) = params.get("error") {
                    Err(map_oauth_error(
                        code,
                        params.get("error_description").map(String::as_str),
                    ))
                } else if params.get("state") != Some(&flow.state) {
                    Err(AuthError::Denied("OAuth state mismatch".to_string()))
                } else {
                    params
                        .get("code")
                        .filter(|c| !c.is_empty())
                        .cloned()
                        .ok_or_else(|| AuthError::Denied("callback carried no code".to_string()))
                };
                request
                    .respond(
                        if outcome.is_ok() { "200 OK" } else { "400 Bad Request" },
                        result_page(outcome.is_ok()),
                    )
                    .await;
                return outcome;
            }
        };

        let code = match tokio::time::timeout(self.config.callback_timeout, wait).await {
            Ok(code) => code?,
            Err(_) => {
                warn!("timed out waiting for the browser redirect");
                return Err(abandoned(self.config.callback_timeout));
            }
        };

        self.exchange_code(&code, &flow.verifier, &redirect_uri).await
    }
}

fn classify_token_error(status: reqwest::StatusCode, body: &str) -> AuthError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return AuthError::Transient(format!("token endpoint returned {status}"));
    }
    match serde_json::from_str::<TokenErrorBody>(body) {
        Ok(err) if err.error == "invalid_grant" => AuthError::Required,
        Ok(err) => map_oauth_error(&err.error, err.error_description.as_deref()),
        Err(_) => AuthError::Denied(format!("token endpoint returned {status}")),
    }
}

impl Authorizer for PkceAuthorizer {
    fn authorize<'a>(
        &'a self,
        interactive: bool,
        refresh_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<TokenGrant, AuthError>> {
        Box::pin(async move {
            if let Some(refresh_token) = refresh_token {
                match self.refresh(refresh_token).await {
                    Ok(grant) => return Ok(grant),
                    Err(AuthError::Required) if interactive => {
                        debug!("refresh token rejected; falling back to browser consent");
                    }
                    Err(e) => return Err(e),
                }
            }
            if !interactive {
                return Err(AuthError::Required);
            }
            self.run_flow().await
        })
    }
}
