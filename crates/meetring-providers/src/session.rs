//! OAuth credential lifecycle.
//!
//! [`SessionManager`] keeps one usable access token available:
//!
//! - a cached token is returned while it is more than `expiry_margin` from expiry
//! - refreshes are single-flight within the process and guarded across
//!   processes by the persisted `auth_in_progress` flag
//! - a refresh attempted within `refresh_cooldown` of the previous one never
//!   reaches the network
//! - transient failures back off exponentially; `max_attempts` consecutive
//!   failures sign the session out
//!
//! Every field of [`Session`] lives in the store, so a restarted process
//! resumes exactly where the previous one stopped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::Shared;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use meetring_core::store::{self, keys};
use meetring_core::{
    AlarmSpec, BoxFuture, Clock, KeyValueStore, StoreError, StoreResult, TOKEN_REFRESH_ALARM,
    TimerService, system_clock,
};

use crate::error::AuthError;
use crate::oauth::{Authorizer, TokenGrant};

/// Exponential backoff between retried refresh attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `attempt`-th consecutive failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// A token closer than this to expiry is refreshed before use.
    pub expiry_margin: chrono::Duration,
    pub refresh_cooldown: chrono::Duration,
    /// Upper bound on waiting for someone else's refresh.
    pub wait_timeout: Duration,
    /// Store polling interval while another process holds the refresh flag.
    pub flag_poll_interval: Duration,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_margin: chrono::Duration::minutes(5),
            refresh_cooldown: chrono::Duration::seconds(30),
            wait_timeout: Duration::from_secs(30),
            flag_poll_interval: Duration::from_millis(250),
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_expiry_margin(mut self, margin: chrono::Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    pub fn with_refresh_cooldown(mut self, cooldown: chrono::Duration) -> Self {
        self.refresh_cooldown = cooldown;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Snapshot of the persisted credential and its refresh bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_in_progress: bool,
    pub last_refresh_attempt: Option<DateTime<Utc>>,
    pub refresh_attempt_count: u32,
    pub authenticating: bool,
}

const SESSION_KEYS: [&str; 6] = [
    keys::OAUTH_TOKEN,
    keys::TOKEN_EXPIRY,
    keys::AUTH_IN_PROGRESS,
    keys::LAST_REFRESH_ATTEMPT,
    keys::REFRESH_ATTEMPT_COUNT,
    keys::AUTHENTICATING,
];

fn take<T: DeserializeOwned>(values: &mut HashMap<String, Value>, key: &str) -> StoreResult<Option<T>> {
    match values.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::corrupt(key, e)),
    }
}

impl Session {
    pub async fn load(store: &dyn KeyValueStore) -> StoreResult<Self> {
        let mut values = store.get(&SESSION_KEYS).await?;
        Ok(Self {
            access_token: take::<String>(&mut values, keys::OAUTH_TOKEN)?.filter(|t| !t.is_empty()),
            expires_at: take(&mut values, keys::TOKEN_EXPIRY)?,
            refresh_in_progress: take(&mut values, keys::AUTH_IN_PROGRESS)?.unwrap_or(false),
            last_refresh_attempt: take(&mut values, keys::LAST_REFRESH_ATTEMPT)?,
            refresh_attempt_count: take(&mut values, keys::REFRESH_ATTEMPT_COUNT)?.unwrap_or(0),
            authenticating: take(&mut values, keys::AUTHENTICATING)?.unwrap_or(false),
        })
    }

    pub fn is_signed_in(&self) -> bool {
        self.access_token.is_some()
    }

    /// The token, if it stays valid for longer than `margin`. No recorded expiry counts as stale.
    pub fn fresh_token(&self, now: DateTime<Utc>, margin: chrono::Duration) -> Option<&str> {
        match (&self.access_token, self.expires_at) {
            (Some(token), Some(expires_at)) if expires_at - now > margin => Some(token),
            _ => None,
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
        self.last_refresh_attempt
            .is_some_and(|at| now - at < cooldown)
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String, AuthError>>>;

#[derive(Clone)]
struct Flight {
    result: SharedRefresh,
    interactive: bool,
}

struct SessionInner {
    store: Arc<dyn KeyValueStore>,
    timers: Arc<dyn TimerService>,
    authorizer: Arc<dyn Authorizer>,
    config: SessionConfig,
    clock: Clock,
    in_flight: Mutex<Option<Flight>>,
}

/// Owner of the OAuth credential. Clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        timers: Arc<dyn TimerService>,
        authorizer: Arc<dyn Authorizer>,
        config: SessionConfig,
    ) -> Self {
        Self::with_clock(store, timers, authorizer, config, system_clock())
    }

    pub fn with_clock(
        store: Arc<dyn KeyValueStore>,
        timers: Arc<dyn TimerService>,
        authorizer: Arc<dyn Authorizer>,
        config: SessionConfig,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                store,
                timers,
                authorizer,
                config,
                clock,
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub async fn session(&self) -> Result<Session, AuthError> {
        Ok(Session::load(self.inner.store.as_ref()).await?)
    }

    /// Returns a usable access token, refreshing when the cached one is near expiry.
    pub async fn get_token(&self, interactive: bool) -> Result<String, AuthError> {
        let session = self.session().await?;
        let now = (self.inner.clock)();
        if let Some(token) = session.fresh_token(now, self.inner.config.expiry_margin) {
            return Ok(token.to_string());
        }
        if !session.is_signed_in() && !interactive {
            debug!("no credential and not interactive");
            return Err(AuthError::Required);
        }
        self.refresh(interactive).await
    }

    /// Refreshes the credential, joining any refresh already in flight.
    ///
    /// The caller that starts a refresh waits for it unconditionally; callers
    /// that join one give up after `wait_timeout`.
    pub async fn refresh(&self, interactive: bool) -> Result<String, AuthError> {
        self.join_or_start(interactive).await.0
    }

    /// Returns the flight's result and whether that flight was interactive.
    async fn join_or_start(&self, interactive: bool) -> (Result<String, AuthError>, bool) {
        let (flight, joined) = {
            let mut slot = self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(flight) => (flight.clone(), true),
                None => {
                    let flight = Flight {
                        result: self.start_refresh(interactive),
                        interactive,
                    };
                    *slot = Some(flight.clone());
                    (flight, false)
                }
            }
        };

        if !joined {
            return (flight.result.await, flight.interactive);
        }

        debug!(flight_interactive = flight.interactive, "joining in-flight token refresh");
        let waited = self.inner.config.wait_timeout;
        let result = tokio::time::timeout(waited, flight.result)
            .await
            .unwrap_or(Err(AuthError::WaitTimeout { waited }));
        (result, flight.interactive)
    }

    fn start_refresh(&self, interactive: bool) -> SharedRefresh {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.run_refresh(interactive).await;
            inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            result
        });
        let flight: BoxFuture<'static, Result<String, AuthError>> = Box::pin(async move {
            task.await
                .unwrap_or_else(|e| Err(AuthError::Transient(format!("refresh task failed: {e}"))))
        });
        flight.shared()
    }

    /// User-initiated sign-in: forgets cooldown bookkeeping and consents interactively.
    ///
    /// A background refresh already in flight is joined first. When it yields
    /// no token, consent is asked for in a flight of its own.
    pub async fn sign_in(&self) -> Result<String, AuthError> {
        self.reset_cooldown().await?;
        info!("interactive sign-in requested");
        let (result, flight_interactive) = self.join_or_start(true).await;
        if result.is_ok() || flight_interactive {
            return result;
        }

        debug!("background refresh yielded no token; asking for consent");
        self.reset_cooldown().await?;
        self.join_or_start(true).await.0
    }

    async fn reset_cooldown(&self) -> Result<(), AuthError> {
        self.inner
            .store
            .remove(&[keys::LAST_REFRESH_ATTEMPT, keys::REFRESH_ATTEMPT_COUNT])
            .await?;
        Ok(())
    }

    /// Clears the credential and its refresh-ahead wake. Idempotent.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.inner.sign_out().await
    }
}

impl SessionInner {
    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    async fn run_refresh(&self, interactive: bool) -> Result<String, AuthError> {
        if let Some(token) = self.wait_for_foreign_refresh().await? {
            return Ok(token);
        }

        let session = Session::load(self.store.as_ref()).await?;
        if session.in_cooldown(self.now(), self.config.refresh_cooldown) {
            return match session.access_token {
                Some(token) => {
                    debug!("refresh within cooldown; reusing current token");
                    Ok(token)
                }
                None => Err(AuthError::RefreshCooldownActive),
            };
        }

        let result = self.attempt_refresh(interactive, session.refresh_attempt_count).await;

        let cleared = HashMap::from([
            (keys::AUTH_IN_PROGRESS.to_string(), Value::Bool(false)),
            (keys::AUTHENTICATING.to_string(), Value::Bool(false)),
        ]);
        if let Err(e) = self.store.set(cleared).await {
            warn!(error = %e, "failed to clear refresh flag");
        }
        result
    }

    /// Waits out a refresh held by another process.
    ///
    /// Returns the token that process produced, or `None` when this process
    /// should refresh itself.
    async fn wait_for_foreign_refresh(&self) -> Result<Option<String>, AuthError> {
        let started = tokio::time::Instant::now();
        let stale_after = chrono::Duration::from_std(self.config.wait_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let mut waited = false;

        loop {
            let session = Session::load(self.store.as_ref()).await?;
            let now = self.now();
            if !session.refresh_in_progress {
                if waited {
                    return Ok(session
                        .fresh_token(now, self.config.expiry_margin)
                        .map(str::to_string));
                }
                return Ok(None);
            }
            if session
                .last_refresh_attempt
                .is_none_or(|at| now - at > stale_after)
            {
                warn!("taking over stale refresh flag");
                return Ok(None);
            }
            if started.elapsed() >= self.config.wait_timeout {
                return Err(AuthError::WaitTimeout {
                    waited: self.config.wait_timeout,
                });
            }
            waited = true;
            tokio::time::sleep(self.config.flag_poll_interval).await;
        }
    }

    async fn attempt_refresh(&self, interactive: bool, mut count: u32) -> Result<String, AuthError> {
        let refresh_token: Option<String> = store::read(self.store.as_ref(), keys::REFRESH_TOKEN).await?;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let now = self.now();
            self.store
                .set(HashMap::from([
                    (keys::AUTH_IN_PROGRESS.to_string(), Value::Bool(true)),
                    (keys::AUTHENTICATING.to_string(), Value::Bool(interactive)),
                    (keys::LAST_REFRESH_ATTEMPT.to_string(), json!(now)),
                ]))
                .await?;

            info!(attempt, interactive, "refreshing access token");
            let err = match self
                .authorizer
                .authorize(interactive, refresh_token.as_deref())
                .await
            {
                Ok(grant) => return self.commit(grant, now).await,
                Err(err) => err,
            };

            count += 1;
            store::write(self.store.as_ref(), keys::REFRESH_ATTEMPT_COUNT, &count).await?;
            warn!(attempt, count, error = %err, "token refresh failed");

            if matches!(err, AuthError::Required) && refresh_token.is_some() {
                debug!("dropping rejected refresh token");
                self.store.remove(&[keys::REFRESH_TOKEN]).await?;
            }
            if count >= self.config.max_attempts {
                warn!(attempts = count, "refresh attempts exhausted; signing out");
                self.sign_out().await?;
                return Err(AuthError::Exhausted { attempts: count });
            }
            // a retry would open a second consent prompt
            if interactive || !err.is_retryable() {
                return Err(err);
            }

            let delay = self.config.backoff.delay(attempt);
            info!(?delay, "backing off before retrying refresh");
            tokio::time::sleep(delay).await;
        }
    }

    async fn commit(&self, grant: TokenGrant, now: DateTime<Utc>) -> Result<String, AuthError> {
        let expires_at = grant
            .expires_in
            .map(|secs| now + chrono::Duration::seconds(secs));

        let mut entries = HashMap::from([
            (keys::OAUTH_TOKEN.to_string(), Value::String(grant.access_token.clone())),
            (keys::REFRESH_ATTEMPT_COUNT.to_string(), Value::from(0)),
        ]);
        if let Some(at) = expires_at {
            entries.insert(keys::TOKEN_EXPIRY.to_string(), json!(at));
        }
        if let Some(refresh_token) = &grant.refresh_token {
            entries.insert(keys::REFRESH_TOKEN.to_string(), Value::String(refresh_token.clone()));
        }
        self.store.set(entries).await?;
        if expires_at.is_none() {
            self.store.remove(&[keys::TOKEN_EXPIRY]).await?;
        }

        self.schedule_refresh_ahead(expires_at, now).await;
        info!(expires_at = ?expires_at, "access token refreshed");
        Ok(grant.access_token)
    }

    async fn schedule_refresh_ahead(&self, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        let fire_at = expires_at
            .map(|at| at - self.config.expiry_margin)
            .filter(|at| *at > now);
        let result = match fire_at {
            Some(at) => self
                .timers
                .create(TOKEN_REFRESH_ALARM, AlarmSpec::At(at))
                .await
                .map(|_| debug!(fire_at = %at, "scheduled refresh-ahead wake")),
            None => self.timers.clear(TOKEN_REFRESH_ALARM).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to update refresh-ahead wake");
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.store
            .remove(&[
                keys::OAUTH_TOKEN,
                keys::TOKEN_EXPIRY,
                keys::AUTH_IN_PROGRESS,
                keys::AUTHENTICATING,
                keys::LAST_REFRESH_ATTEMPT,
                keys::REFRESH_ATTEMPT_COUNT,
                keys::REFRESH_TOKEN,
            ])
            .await?;
        self.timers.clear(TOKEN_REFRESH_ALARM).await?;
        info!("signed out");
        Ok(())
    }
}
