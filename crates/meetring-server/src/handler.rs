//! Maps control requests onto the engine.

use std::{future::Future, pin::Pin};

use meetring_protocol::{ErrorCode, Request, Response};
use tracing::{Span, debug, info, warn};

use crate::engine::Engine;
use crate::error::{ServerError, ServerResult, auth_error_response, fetch_error_response};
use crate::socket::Connection;

#[derive(Clone)]
pub struct RequestHandler {
    engine: Engine,
}

impl RequestHandler {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Handles a single request. Failures come back as [`Response::Error`].
    #[tracing::instrument(skip(self), fields(request_type = request.action(), duration_ms))]
    pub async fn handle(&self, request: &Request) -> Response {
        let start = std::time::Instant::now();

        let response = match request {
            Request::Ping => Response::Pong,
            Request::RefreshMeetings => match self.engine.poll_cycle().await {
                Ok(report) => Response::meetings(report.events, report.warnings),
                Err(e) => Response::Error {
                    error: fetch_error_response(&e),
                },
            },
            Request::CheckAuth => match self.engine.auth_status().await {
                Ok(status) => Response::Auth { status },
                Err(e) => Response::Error {
                    error: auth_error_response(&e),
                },
            },
            Request::SignIn => {
                info!("interactive sign-in requested");
                match self.engine.sign_in().await {
                    Ok(status) => Response::Auth { status },
                    Err(e) => Response::Error {
                        error: auth_error_response(&e),
                    },
                }
            }
            Request::SignOut => match self.engine.sign_out().await {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error {
                    error: auth_error_response(&e),
                },
            },
            Request::GetStatusUpdate => match self.engine.status().await {
                Ok(status) => Response::Status { status },
                Err(e) => internal_error(&e),
            },
            Request::GetUpcomingMeetings => match self.engine.upcoming().await {
                Ok(meetings) => Response::meetings(meetings, Vec::new()),
                Err(e) => internal_error(&e),
            },
        };

        let duration = start.elapsed();
        if tracing::enabled!(tracing::Level::DEBUG) {
            Span::current().record("duration_ms", duration.as_millis());
            debug!(
                success = response.is_success(),
                duration_ms = duration.as_millis(),
                "request handled"
            );
        }
        response
    }

    /// Serves requests on `conn` until the client hangs up.
    pub async fn handle_connection(&self, mut conn: Connection) -> ServerResult<()> {
        loop {
            match conn.read_request().await {
                Ok(Some(envelope)) => {
                    let response = self.handle(&envelope.payload).await;
                    conn.respond(&envelope.request_id, response).await?;
                }
                Ok(None) => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "error reading request");
                    return Err(e);
                }
            }
        }
    }
}

fn internal_error(err: &ServerError) -> Response {
    warn!(error = %err, "request failed");
    Response::error(ErrorCode::InternalError, err.to_string())
}

/// Builds the per-connection callback for [`SocketServer::run`](crate::SocketServer::run).
pub fn make_connection_handler(
    engine: Engine,
) -> impl Fn(Connection) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static {
    move |conn| {
        let handler = RequestHandler::new(engine.clone());
        Box::pin(async move {
            if let Err(e) = handler.handle_connection(conn).await
                && !matches!(e, ServerError::Shutdown)
            {
                warn!(error = %e, "connection handler error");
            }
        })
    }
}
