//! Client and daemon configuration.
//!
//! Everything lives in one `config.toml`, by default
//! `~/.config/meetring/config.toml`. Every section is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use meetring_core::TracingOutputFormat;
use meetring_providers::oauth::CALENDAR_READONLY_SCOPE;
use meetring_providers::{BackoffPolicy, FetchConfig, OAuthConfig, SessionConfig};
use meetring_server::{AlarmConfig, DispatchConfig, EngineConfig};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub google: GoogleSettings,
    pub session: SessionSettings,
    pub fetch: FetchSettings,
    pub alerts: AlertSettings,
    pub engine: EngineSettings,
    pub store: StoreSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlow {
    /// Browser consent for every token; no refresh token.
    #[default]
    Implicit,
    /// Authorization code with PKCE; refreshes silently.
    Pkce,
}

/// `client_id` and `client_secret` accept `env::` and `pass::` references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleSettings {
    pub client_id: Option<String>,
    /// Only used by the PKCE flow.
    pub client_secret: Option<String>,
    pub calendar_id: String,
    pub flow: AuthFlow,
    pub scopes: Vec<String>,
}

impl Default for GoogleSettings {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            calendar_id: "primary".to_string(),
            flow: AuthFlow::default(),
            scopes: vec![CALENDAR_READONLY_SCOPE.to_string()],
        }
    }
}

impl GoogleSettings {
    pub fn oauth_config(&self) -> Result<OAuthConfig, String> {
        let raw_id = self.client_id.as_deref().ok_or_else(|| {
            format!(
                "Google client_id is not configured. Add to {}:\n  \
                 [google]\n  \
                 client_id = \"YOUR_ID.apps.googleusercontent.com\"",
                ClientConfig::default_path().display()
            )
        })?;
        let client_id = crate::secret::resolve(raw_id)
            .map_err(|e| format!("failed to resolve client_id: {e}"))?;
        let mut config = OAuthConfig::new(client_id).with_scopes(self.scopes.clone());

        match (self.flow, self.client_secret.as_deref()) {
            (AuthFlow::Pkce, None) => {
                return Err("the pkce flow needs [google] client_secret".to_string());
            }
            (AuthFlow::Pkce, Some(raw)) => {
                let secret = crate::secret::resolve(raw)
                    .map_err(|e| format!("failed to resolve client_secret: {e}"))?;
                config = config.with_client_secret(secret);
            }
            (AuthFlow::Implicit, _) => {}
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub expiry_margin_secs: i64,
    pub refresh_cooldown_secs: i64,
    pub wait_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            expiry_margin_secs: 300,
            refresh_cooldown_secs: 30,
            wait_timeout_secs: 30,
            max_attempts: 3,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_expiry_margin(chrono::Duration::seconds(self.expiry_margin_secs))
            .with_refresh_cooldown(chrono::Duration::seconds(self.refresh_cooldown_secs))
            .with_wait_timeout(Duration::from_secs(self.wait_timeout_secs))
            .with_max_attempts(self.max_attempts)
            .with_backoff(BackoffPolicy {
                initial: Duration::from_millis(self.backoff_initial_ms),
                max: Duration::from_millis(self.backoff_max_ms),
                multiplier: self.backoff_multiplier,
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub page_cap: usize,
    pub page_size: u32,
    pub lookahead_hours: i64,
    pub http_timeout_secs: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_cap: 5,
            page_size: 250,
            lookahead_hours: 12,
            http_timeout_secs: 30,
        }
    }
}

impl FetchSettings {
    pub fn to_fetch_config(&self) -> FetchConfig {
        FetchConfig::default().with_page_cap(self.page_cap)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub lead_offset_secs: i64,
    pub max_late_secs: i64,
    pub dispatch_timeout_secs: u64,
    /// Page rendering the ringing window. Without it only the notification shows.
    pub popup_url: Option<String>,
    pub processed_retention_days: i64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            lead_offset_secs: 30,
            max_late_secs: 300,
            dispatch_timeout_secs: 30,
            popup_url: None,
            processed_retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub poll_interval_secs: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub socket_path: Option<PathBuf>,
    /// Request timeout in seconds.
    pub timeout: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            timeout: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `pretty`, `compact` or `json`; each command has its own default.
    pub format: Option<String>,
}

impl LoggingSettings {
    pub fn output_format(&self) -> Result<Option<TracingOutputFormat>, String> {
        self.format.as_deref().map(str::parse::<TracingOutputFormat>).transpose()
    }
}

impl ClientConfig {
    /// Loads `path`, or the default file when `path` is `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> ClientResult<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            ClientError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meetring")
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meetring")
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("store.json"))
    }

    /// Socket path: the explicit override, then `[server] socket_path`, then the default.
    pub fn socket_path(&self, cli_override: Option<&Path>) -> PathBuf {
        cli_override
            .map(Path::to_path_buf)
            .or_else(|| self.server.socket_path.clone())
            .unwrap_or_else(meetring_server::default_socket_path)
    }

    pub fn request_timeout(&self, cli_override: Option<u64>) -> Duration {
        Duration::from_secs(cli_override.unwrap_or(self.server.timeout))
    }

    pub fn engine_config(&self) -> EngineConfig {
        let alerts = &self.alerts;
        let mut dispatch = DispatchConfig::default()
            .with_timeout(Duration::from_secs(alerts.dispatch_timeout_secs));
        if let Some(url) = &alerts.popup_url {
            dispatch = dispatch.with_popup_url(url.clone());
        }
        EngineConfig::default()
            .with_poll_interval(chrono::Duration::seconds(self.engine.poll_interval_secs))
            .with_lookahead(chrono::Duration::hours(self.fetch.lookahead_hours))
            .with_processed_retention(chrono::Duration::days(alerts.processed_retention_days))
            .with_alarms(
                AlarmConfig::default()
                    .with_lead_offset(chrono::Duration::seconds(alerts.lead_offset_secs))
                    .with_max_late(chrono::Duration::seconds(alerts.max_late_secs)),
            )
            .with_dispatch(dispatch)
    }

    /// Checks what the daemon would reject at startup.
    pub fn validate(&self) -> Result<(), String> {
        self.google.oauth_config()?;
        if self.engine.poll_interval_secs <= 0 {
            return Err("engine.poll_interval_secs must be positive".to_string());
        }
        if self.fetch.lookahead_hours <= 0 {
            return Err("fetch.lookahead_hours must be positive".to_string());
        }
        if self.session.backoff_multiplier < 1.0 {
            return Err("session.backoff_multiplier must be at least 1.0".to_string());
        }
        self.logging.output_format()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_documented_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config.google.calendar_id, "primary");
        assert_eq!(config.google.flow, AuthFlow::Implicit);
        assert_eq!(config.session.max_attempts, 3);
        assert_eq!(config.fetch.page_cap, 5);
        assert_eq!(config.alerts.lead_offset_secs, 30);
        assert_eq!(config.engine.poll_interval_secs, 60);
        assert_eq!(config.server.timeout, 5);

        let engine = config.engine_config();
        assert_eq!(engine.poll_interval, chrono::Duration::seconds(60));
        assert_eq!(engine.lookahead, chrono::Duration::hours(12));
        assert_eq!(engine.alarms.max_late, chrono::Duration::minutes(5));
        assert!(engine.dispatch.popup_url.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
[google]
client_id = "abc.apps.googleusercontent.com"
client_secret = "shh"
flow = "pkce"

[session]
max_attempts = 5
backoff_initial_ms = 200

[alerts]
popup_url = "https://meetring.app/ring"
lead_offset_secs = 60

[engine]
poll_interval_secs = 120
"#,
        )
        .unwrap();

        let session = config.session.to_session_config();
        assert_eq!(session.max_attempts, 5);
        assert_eq!(session.backoff.initial, Duration::from_millis(200));

        let engine = config.engine_config();
        assert_eq!(engine.poll_interval, chrono::Duration::minutes(2));
        assert_eq!(engine.alarms.lead_offset, chrono::Duration::minutes(1));
        assert_eq!(
            engine.dispatch.popup_url.as_deref(),
            Some("https://meetring.app/ring")
        );

        let oauth = config.google.oauth_config().unwrap();
        assert_eq!(oauth.client_id, "abc.apps.googleusercontent.com");
        assert_eq!(oauth.client_secret.as_deref(), Some("shh"));
        config.validate().unwrap();
    }

    #[test]
    fn validation_catches_missing_credentials() {
        let config = ClientConfig::default();
        assert!(config.validate().unwrap_err().contains("client_id"));

        let pkce: ClientConfig = toml::from_str(
            "[google]\nclient_id = \"abc\"\nflow = \"pkce\"\n",
        )
        .unwrap();
        assert!(pkce.validate().unwrap_err().contains("client_secret"));
    }

    #[test]
    fn bad_log_format_is_rejected() {
        let config: ClientConfig = toml::from_str(
            "[google]\nclient_id = \"abc\"\n[logging]\nformat = \"xml\"\n",
        )
        .unwrap();
        assert!(config.validate().unwrap_err().contains("xml"));
    }

    #[test]
    fn explicit_socket_path_wins() {
        let mut config = ClientConfig::default();
        config.server.socket_path = Some(PathBuf::from("/run/configured.sock"));
        assert_eq!(
            config.socket_path(Some(Path::new("/tmp/flag.sock"))),
            PathBuf::from("/tmp/flag.sock")
        );
        assert_eq!(config.socket_path(None), PathBuf::from("/run/configured.sock"));
        assert_eq!(config.request_timeout(Some(9)), Duration::from_secs(9));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClientConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[store]\npath = \"/var/lib/meetring/store.json\"\n").unwrap();
        let config = ClientConfig::load(Some(&path)).unwrap();
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/meetring/store.json"));
    }
}
