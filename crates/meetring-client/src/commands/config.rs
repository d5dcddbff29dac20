//! Configuration commands.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

pub fn dump(config: &ClientConfig) -> ClientResult<()> {
    let rendered = toml::to_string_pretty(config)
        .map_err(|e| ClientError::Config(format!("failed to serialize config: {}", e)))?;
    println!("# config.toml ({})", ClientConfig::default_path().display());
    println!("{}", rendered);
    Ok(())
}

pub fn validate(config: &ClientConfig) -> ClientResult<()> {
    config.validate().map_err(ClientError::Config)?;
    println!("Configuration is valid.");
    Ok(())
}

pub fn path(config: &ClientConfig) -> ClientResult<()> {
    println!("config: {}", ClientConfig::default_path().display());
    println!("store:  {}", config.store_path().display());
    Ok(())
}
