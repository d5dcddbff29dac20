//! Subcommand implementations.

pub mod config;
pub mod daemon;
pub mod meetings;
pub mod session;
