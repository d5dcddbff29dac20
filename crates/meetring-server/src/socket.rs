//! Unix socket listener for the control protocol.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use meetring_protocol::{Envelope, PROTOCOL_VERSION, Request, Response, read_frame, write_frame};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

pub struct SocketServer {
    config: ServerConfig,
    listener: UnixListener,
    connection_semaphore: Arc<Semaphore>,
}

impl SocketServer {
    /// Binds the configured socket path.
    ///
    /// An existing file at that path is removed only when nothing answers on
    /// it and `cleanup_stale_socket` is set.
    pub async fn new(config: ServerConfig) -> ServerResult<Self> {
        let socket_path = &config.socket_path;

        if let Some(parent) = socket_path.parent()
            && !parent.exists()
        {
            return Err(ServerError::socket_path_invalid(
                parent.to_string_lossy().to_string(),
            ));
        }

        if socket_path.exists() {
            let live = UnixStream::connect(socket_path).await.is_ok();
            if live || !config.cleanup_stale_socket {
                return Err(ServerError::socket_in_use(
                    socket_path.to_string_lossy().to_string(),
                ));
            }
            info!(path = %socket_path.display(), "removing stale socket");
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        restrict_permissions(socket_path)?;
        info!(path = %socket_path.display(), "socket server listening");

        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));
        Ok(Self {
            config,
            listener,
            connection_semaphore,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Waits for a connection slot, then for a client.
    pub async fn accept(&self) -> ServerResult<Connection> {
        let permit = self
            .connection_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Shutdown)?;
        let (stream, _addr) = self.listener.accept().await?;
        debug!("accepted connection");

        Ok(Connection {
            stream,
            timeout: self.config.connection_timeout,
            _permit: permit,
        })
    }

    /// Accepts forever, spawning `handler` per connection.
    pub async fn run<F, Fut>(&self, handler: F) -> ServerResult<()>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.accept().await {
                Ok(connection) => {
                    tokio::spawn(handler(connection));
                }
                Err(ServerError::Shutdown) => return Ok(()),
                Err(e) => error!(error = %e, "failed to accept connection"),
            }
        }
    }

    pub async fn run_until_shutdown<F, Fut, S>(&self, handler: F, shutdown: S) -> ServerResult<()>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run(handler) => result,
            _ = shutdown => {
                info!("socket server stopping");
                Ok(())
            }
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        let path = &self.config.socket_path;
        if !path.exists() {
            return;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed socket file"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove socket file"),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// One client connection; holds a connection slot until dropped.
pub struct Connection {
    stream: UnixStream,
    timeout: std::time::Duration,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    /// Returns `Ok(None)` when the client closed the connection cleanly.
    pub async fn read_request(&mut self) -> ServerResult<Option<Envelope<Request>>> {
        let envelope: Option<Envelope<Request>> =
            tokio::time::timeout(self.timeout, read_frame(&mut self.stream))
                .await
                .map_err(|_| ServerError::timeout("read request"))??;

        if let Some(envelope) = &envelope
            && !envelope.is_compatible()
        {
            warn!(
                version = %envelope.protocol_version,
                expected = %PROTOCOL_VERSION,
                "incompatible protocol version"
            );
        }
        Ok(envelope)
    }

    pub async fn write_response(&mut self, envelope: &Envelope<Response>) -> ServerResult<()> {
        tokio::time::timeout(self.timeout, write_frame(&mut self.stream, envelope))
            .await
            .map_err(|_| ServerError::timeout("write response"))??;
        Ok(())
    }

    pub async fn respond(
        &mut self,
        request_id: impl Into<String>,
        response: Response,
    ) -> ServerResult<()> {
        let envelope = Envelope::response(request_id, response);
        self.write_response(&envelope).await
    }
}
