//! Minimal loopback HTTP listener for OAuth redirects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::AuthError;

pub(crate) struct LoopbackServer {
    listener: TcpListener,
    port: u16,
}

impl LoopbackServer {
    /// Binds the first free port in the inclusive range.
    pub(crate) async fn bind(port_range: (u16, u16)) -> Result<Self, AuthError> {
        for port in port_range.0..=port_range.1 {
            if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
                debug!(port, "bound OAuth loopback listener");
                return Ok(Self { listener, port });
            }
        }
        Err(AuthError::Transient(format!(
            "no free loopback port in {}-{}",
            port_range.0, port_range.1
        )))
    }

    pub(crate) fn redirect_uri(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    /// Accepts connections until one carries a parseable `GET` request line.
    pub(crate) async fn next_request(&self) -> LoopbackRequest {
        loop {
            let Ok((stream, _)) = self.listener.accept().await else {
                continue;
            };
            if let Some(request) = LoopbackRequest::read(stream).await {
                return request;
            }
        }
    }
}

pub(crate) struct LoopbackRequest {
    stream: TcpStream,
    pub(crate) path: String,
    pub(crate) query: String,
}

impl LoopbackRequest {
    async fn read(stream: TcpStream) -> Option<Self> {
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line).await.ok()?;

        // GET /callback?code=...&state=... HTTP/1.1
        let mut parts = request_line.split_whitespace();
        if parts.next()? != "GET" {
            return None;
        }
        let target = parts.next()?;
        let (path, query) = target.split_once('?').unwrap_or((target, ""));

        // Drain headers so closing the socket does not reset the connection.
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) if line.trim().is_empty() => break,
                Ok(_) => {}
            }
        }

        Some(Self {
            path: path.to_string(),
            query: query.to_string(),
            stream: reader.into_inner(),
        })
    }

    pub(crate) fn params(&self) -> HashMap<String, String> {
        parse_params(&self.query)
    }

    pub(crate) async fn respond(mut self, status: &str, html: &str) {
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{html}",
            html.len()
        );
        let _ = self.stream.write_all(response.as_bytes()).await;
        let _ = self.stream.flush().await;
    }
}

pub(crate) fn parse_params(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

pub(crate) fn result_page(ok: bool) -> &'static str {
    if ok {
        "<html><body><h1>Signed in</h1><p>You can close this window.</p></body></html>"
    } else {
        "<html><body><h1>Sign-in failed</h1><p>You can close this window.</p></body></html>"
    }
}

/// The user never completed the consent page within `waited`.
pub(crate) fn abandoned(waited: Duration) -> AuthError {
    AuthError::Denied(format!("sign-in was not completed within {waited:?}"))
}

/// Launches the consent page. Swappable so tests can play the browser.
pub type BrowserOpener = Arc<dyn Fn(&str) + Send + Sync>;

pub fn system_browser() -> BrowserOpener {
    Arc::new(open_browser)
}

/// Opens `url` in the user's browser, logging it for manual use if that fails.
fn open_browser(url: &str) {
    if let Err(e) = open::that(url) {
        tracing::warn!(error = %e, %url, "failed to open browser; open the URL manually");
    }
}
