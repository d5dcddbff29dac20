//! meetring CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use meetring_core::{TracingConfig, init_tracing};
use tracing::Level;

use meetring_client::cli::{Cli, Command, ConfigAction};
use meetring_client::commands;
use meetring_client::config::ClientConfig;
use meetring_client::{ClientResult, SocketClient};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = ClientConfig::load(cli.config.as_deref());

    let mut tracing_config = match (&cli.command, cli.debug) {
        (Some(Command::Daemon), true) => TracingConfig::daemon().with_level(Level::DEBUG),
        (Some(Command::Daemon), false) => TracingConfig::daemon(),
        (_, true) => TracingConfig::cli_debug(),
        (_, false) => TracingConfig::cli(),
    };
    if let Ok(config) = &config
        && let Ok(Some(format)) = config.logging.output_format()
    {
        tracing_config = tracing_config.with_format(format);
    }
    if let Err(e) = init_tracing(tracing_config) {
        eprintln!("warning: logging disabled: {}", e);
    }

    let result = match config {
        Ok(config) => run(cli, config).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            if e.needs_sign_in() {
                eprintln!("hint: run `meetring sign-in`");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: ClientConfig) -> ClientResult<()> {
    let socket_path = config.socket_path(cli.socket_path.as_deref());
    let client = SocketClient::new(socket_path.clone(), config.request_timeout(cli.timeout));
    // a refresh waits on the calendar API, possibly for several pages
    let refresh_client = client.with_timeout(
        config
            .request_timeout(cli.timeout)
            .max(config.fetch.http_timeout() * 2),
    );

    match cli.command {
        Some(Command::Daemon) => commands::daemon::run(&config, socket_path).await,
        Some(Command::SignIn) => commands::session::sign_in(&client).await,
        Some(Command::SignOut) => commands::session::sign_out(&client).await,
        Some(Command::Status { json }) => commands::session::status(&client, json).await,
        None => commands::session::status(&client, false).await,
        Some(Command::Meetings { json }) => commands::meetings::list(&client, json).await,
        Some(Command::Refresh { json }) => commands::meetings::refresh(&refresh_client, json).await,
        Some(Command::Config { action }) => match action {
            ConfigAction::Path => commands::config::path(&config),
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Validate => commands::config::validate(&config),
        },
    }
}
