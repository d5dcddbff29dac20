//! Unix socket client for the meetring daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::{debug, warn};
use uuid::Uuid;

use meetring_protocol::{Envelope, Request, Response, read_frame, write_frame};

use crate::error::{ClientError, ClientResult};

pub struct SocketClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl SocketClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Same socket, different bound on the whole exchange.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self::new(self.socket_path.clone(), timeout)
    }

    /// Sends `request` on a fresh connection and waits for its response.
    ///
    /// An error response from the daemon becomes [`ClientError::Remote`].
    pub async fn send(&self, request: Request) -> ClientResult<Response> {
        let request_id = Uuid::new_v4().to_string();
        debug!(
            socket = %self.socket_path.display(),
            %request_id,
            action = request.action(),
            "sending request"
        );

        let envelope = tokio::time::timeout(self.timeout, self.exchange(&request_id, request))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!(
                    "no answer from the daemon within {}s",
                    self.timeout.as_secs()
                ))
            })??;

        if envelope.request_id != request_id {
            warn!(
                expected = %request_id,
                received = %envelope.request_id,
                "response request_id mismatch"
            );
        }
        match envelope.payload {
            Response::Error { error } => Err(ClientError::Remote(error)),
            other => Ok(other),
        }
    }

    async fn exchange(&self, request_id: &str, request: Request) -> ClientResult<Envelope<Response>> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            ClientError::Connection(format!(
                "failed to connect to {} ({}); is `meetring daemon` running?",
                self.socket_path.display(),
                e
            ))
        })?;
        write_frame(&mut stream, &Envelope::request(request_id, request)).await?;
        read_frame(&mut stream)
            .await?
            .ok_or_else(|| ClientError::Protocol("daemon closed the connection".into()))
    }

    /// Whether a daemon answers on the socket.
    pub async fn ping(&self) -> bool {
        matches!(self.send(Request::Ping).await, Ok(Response::Pong))
    }
}
