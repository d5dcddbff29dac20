//! Implicit-grant flow over a loopback redirect.
//!
//! Browsers never send the URL fragment to the server, so the redirect
//! target serves a relay page that re-requests `/token` with the fragment
//! moved into the query string.

use rand::Rng as _;
use tracing::{debug, info, warn};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use meetring_core::BoxFuture;

use super::loopback::{BrowserOpener, LoopbackServer, abandoned, result_page, system_browser};
use super::{Authorizer, OAuthConfig, TokenGrant, parse_redirect_fragment};
use crate::error::AuthError;

const CALLBACK_PATH: &str = "/callback";
const TOKEN_PATH: &str = "/token";

const RELAY_PAGE: &str = r#"<html><body><p>Completing sign-in&hellip;</p><script>
var q = window.location.hash.length > 1 ? window.location.hash.substring(1) : window.location.search.substring(1);
window.location.replace('/token?' + q);
</script></body></html>"#;

#[derive(Clone)]
pub struct ImplicitGrantAuthorizer {
    config: OAuthConfig,
    browser: BrowserOpener,
}

impl ImplicitGrantAuthorizer {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            config,
            browser: system_browser(),
        }
    }

    pub fn with_browser(mut self, browser: BrowserOpener) -> Self {
        self.browser = browser;
        self
    }

    pub fn auth_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=token&scope={}&state={}&include_granted_scopes=true",
            self.config.auth_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&self.config.scopes.join(" ")),
            urlencoding::encode(state),
        )
    }

    async fn run_flow(&self) -> Result<TokenGrant, AuthError> {
        let server = LoopbackServer::bind(self.config.port_range).await?;
        let redirect_uri = server.redirect_uri(CALLBACK_PATH);
        let state = random_state();
        let url = self.auth_url(&redirect_uri, &state);

        info!("starting implicit-grant sign-in; opening browser");
        debug!(%url, "authorization URL");
        (self.browser)(&url);

        let wait = async {
            loop {
                let request = server.next_request().await;
                match request.path.as_str() {
                    CALLBACK_PATH => request.respond("200 OK", RELAY_PAGE).await,
                    TOKEN_PATH => {
                        let params = request.params();
                        if params.get("state") != Some(&state) && !params.contains_key("error") {
                            request.respond("400 Bad Request", result_page(false)).await;
                            return Err(AuthError::Denied("OAuth state mismatch".to_string()));
                        }
                        let result = parse_redirect_fragment(&request.query);
                        request
                            .respond(
                                if result.is_ok() { "200 OK" } else { "400 Bad Request" },
                                result_page(result.is_ok()),
                            )
                            .await;
                        return result;
                    }
                    other => {
                        debug!(path = other, "ignoring loopback request");
                        request.respond("404 Not Found", "").await;
                    }
                }
            }
        };

        match tokio::time::timeout(self.config.callback_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!("timed out waiting for the browser redirect");
                Err(abandoned(self.config.callback_timeout))
            }
        }
    }
}

impl Authorizer for ImplicitGrantAuthorizer {
    fn authorize<'a>(
        &'a self,
        interactive: bool,
        _refresh_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<TokenGrant, AuthError>> {
        Box::pin(async move {
            if !interactive {
                // Implicit grants have no silent renewal path.
                return Err(AuthError::Required);
            }
            self.run_flow().await
        })
    }
}

pub(crate) fn random_state() -> String {
    let mut rng = rand::rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.random()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}
