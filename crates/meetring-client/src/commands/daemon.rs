//! `meetring daemon`: runs the engine in the foreground.
//!
//! The socket is bound before the store is opened; with another daemon
//! running, startup fails without touching any state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use meetring_core::{KeyValueStore, system_clock};
use meetring_providers::{
    Authorizer, EventFetcher, GoogleCalendarClient, ImplicitGrantAuthorizer, PkceAuthorizer,
    SessionManager, http_client,
};
use meetring_server::{
    DesktopPresenter, Engine, EngineParts, FileStore, LocalTimerService, ServerConfig,
    SignalHandler, SocketServer, make_connection_handler,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{AuthFlow, ClientConfig};
use crate::error::{ClientError, ClientResult};

/// Fired alarms waiting for the engine; the driver blocks when it is full.
const WAKE_QUEUE: usize = 32;

pub async fn run(config: &ClientConfig, socket_path: PathBuf) -> ClientResult<()> {
    config.validate().map_err(ClientError::Config)?;

    let server = SocketServer::new(ServerConfig::new(&socket_path)).await?;

    let store_path = config.store_path();
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&store_path));
    let clock = system_clock();
    let timers = LocalTimerService::load(store.clone(), clock.clone()).await?;

    let http = http_client(config.fetch.http_timeout())
        .map_err(|e| ClientError::Daemon(format!("failed to build HTTP client: {e}")))?;
    let oauth = config.google.oauth_config().map_err(ClientError::Config)?;
    let authorizer: Arc<dyn Authorizer> = match config.google.flow {
        AuthFlow::Implicit => Arc::new(ImplicitGrantAuthorizer::new(oauth)),
        AuthFlow::Pkce => Arc::new(PkceAuthorizer::new(oauth, http.clone())),
    };
    let session = SessionManager::with_clock(
        store.clone(),
        timers.clone(),
        authorizer,
        config.session.to_session_config(),
        clock.clone(),
    );
    let calendar = GoogleCalendarClient::new(http)
        .with_calendar_id(&config.google.calendar_id)
        .with_page_size(config.fetch.page_size);
    let fetcher = EventFetcher::new(
        session.clone(),
        Arc::new(calendar),
        config.fetch.to_fetch_config(),
    );

    let engine = Engine::new(
        EngineParts {
            store,
            timers: timers.clone(),
            session,
            fetcher,
            presenter: Arc::new(DesktopPresenter::new()),
            clock,
        },
        config.engine_config(),
    );

    let signals = SignalHandler::new();
    signals.spawn_listener();

    let (fired_tx, fired_rx) = mpsc::channel(WAKE_QUEUE);
    let driver = timers.spawn_driver(fired_tx, signals.shutdown());
    let wake_loop = {
        let engine = engine.clone();
        let shutdown = signals.shutdown();
        tokio::spawn(async move { engine.run(fired_rx, shutdown).await })
    };
    engine.start().await?;

    info!(
        socket = %socket_path.display(),
        store = %store_path.display(),
        "meetring daemon running"
    );
    server
        .run_until_shutdown(make_connection_handler(engine), signals.shutdown().wait())
        .await?;

    info!("shutting down");
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = driver.await;
        let _ = wake_loop.await;
    })
    .await;
    if drained.is_err() {
        warn!("background tasks did not stop in time");
    }
    Ok(())
}
