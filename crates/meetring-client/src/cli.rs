//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// meetring - rings before your meetings start
#[derive(Debug, Parser)]
#[command(name = "meetring")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "MEETRING_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Path to the daemon socket
    #[arg(long, env = "MEETRING_SOCKET")]
    pub socket_path: Option<PathBuf>,

    /// Request timeout in seconds (overrides `[server] timeout`)
    #[arg(long)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Daemon,

    /// Sign in to Google Calendar through the browser
    SignIn,

    /// Forget the stored credential and upcoming meetings
    SignOut,

    /// Show session and polling status (default)
    Status {
        /// Print the raw status as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the upcoming meetings the daemon knows about
    Meetings {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Poll the calendar now and list the result
    Refresh {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show the configuration file path
    Path,

    /// Print the effective configuration
    Dump,

    /// Check the configuration without starting anything
    Validate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::try_parse_from(["meetring", "--timeout", "9", "meetings", "--json"]).unwrap();
        assert_eq!(cli.timeout, Some(9));
        assert!(matches!(cli.command, Some(Command::Meetings { json: true })));

        let cli = Cli::try_parse_from(["meetring", "sign-in"]).unwrap();
        assert!(matches!(cli.command, Some(Command::SignIn)));

        let cli = Cli::try_parse_from(["meetring", "config", "dump"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Config {
                action: ConfigAction::Dump
            })
        ));
    }
}
