//! Daemon: durable store, alarm timers, alert dispatch and IPC.
//!
//! The [`Engine`] ties a [`SessionManager`](meetring_providers::SessionManager)
//! and an [`EventFetcher`](meetring_providers::EventFetcher) to the
//! scheduling side:
//! - [`DedupTracker`]: which events already alerted, persisted
//! - [`AlarmScheduler`]: one durable alarm per imminent meeting
//! - [`NotificationDispatcher`]: fired alarm to window and notification
//! - [`LocalTimerService`]: alarms that survive restarts
//! - [`SocketServer`] and [`RequestHandler`]: the control socket
//!
//! # Example
//!
//! ```rust,no_run
//! use meetring_server::{FileStore, ServerConfig, SocketServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let _store = FileStore::new("/tmp/meetring-state.json");
//!     let _server = SocketServer::new(ServerConfig::default()).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod dedup;
mod dispatcher;
mod engine;
mod error;
mod handler;
mod present;
mod scheduler;
mod signals;
mod socket;
mod store;
mod timers;

#[cfg(test)]
mod testing;

pub use config::{ServerConfig, default_socket_path};
pub use dedup::{DedupTracker, ProcessedEntry};
pub use dispatcher::{DispatchConfig, DispatchOutcome, NotificationDispatcher};
pub use engine::{Engine, EngineConfig, EngineParts, PollReport};
pub use error::{
    DispatchError, ServerError, ServerResult, auth_error_code, auth_error_response,
    fetch_error_code, fetch_error_response,
};
pub use handler::{RequestHandler, make_connection_handler};
pub use present::{AlertNotification, DesktopPresenter, NotificationAction, PresentError, Presenter};
pub use scheduler::{AlarmConfig, AlarmDecision, AlarmScheduler};
pub use signals::{ShutdownSignal, SignalHandler};
pub use socket::{Connection, SocketServer};
pub use store::FileStore;
pub use timers::LocalTimerService;
