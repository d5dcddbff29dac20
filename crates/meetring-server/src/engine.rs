//! Poll cycle and wake routing.
//!
//! Every wake (poll tick, token refresh, meeting alarm, IPC request) is
//! handled from persisted state, so the daemon may be restarted between any
//! two of them.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use meetring_core::store::{self, keys};
use meetring_core::{
    AlarmSpec, CalendarEvent, Clock, KeyValueStore, POLL_ALARM, Settings, TimeWindow,
    TimerService, Wake, collapse,
};
use meetring_protocol::{AuthStatus, ErrorResponse, StatusUpdate};
use meetring_providers::{AuthError, EventFetcher, FetchError, SessionManager};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::dedup::DedupTracker;
use crate::dispatcher::{DispatchConfig, NotificationDispatcher};
use crate::error::{ServerResult, auth_error_response, fetch_error_response};
use crate::present::Presenter;
use crate::scheduler::{AlarmConfig, AlarmDecision, AlarmScheduler};
use crate::signals::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    /// Length of the fetch window starting at "now".
    pub lookahead: Duration,
    /// How long processed-event entries outlive their event's start.
    pub processed_retention: Duration,
    pub alarms: AlarmConfig,
    pub dispatch: DispatchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::seconds(60),
            lookahead: Duration::hours(12),
            processed_retention: Duration::days(7),
            alarms: AlarmConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lookahead(mut self, lookahead: Duration) -> Self {
        self.lookahead = lookahead;
        self
    }

    pub fn with_processed_retention(mut self, retention: Duration) -> Self {
        self.processed_retention = retention;
        self
    }

    pub fn with_alarms(mut self, alarms: AlarmConfig) -> Self {
        self.alarms = alarms;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }
}

/// Result of one fetch-filter-collapse-schedule pass.
#[derive(Debug, Clone)]
pub struct PollReport {
    pub events: Vec<CalendarEvent>,
    pub warnings: Vec<String>,
    pub decisions: Vec<(String, AlarmDecision)>,
}

/// External collaborators the engine is assembled from.
pub struct EngineParts {
    pub store: Arc<dyn KeyValueStore>,
    pub timers: Arc<dyn TimerService>,
    pub session: SessionManager,
    pub fetcher: EventFetcher,
    pub presenter: Arc<dyn Presenter>,
    pub clock: Clock,
}

struct EngineInner {
    store: Arc<dyn KeyValueStore>,
    timers: Arc<dyn TimerService>,
    session: SessionManager,
    fetcher: EventFetcher,
    dedup: Arc<DedupTracker>,
    scheduler: AlarmScheduler,
    dispatcher: Arc<NotificationDispatcher>,
    clock: Clock,
    config: EngineConfig,
    started_at: DateTime<Utc>,
    /// Warnings from the latest poll; informational only.
    warnings: Mutex<Vec<String>>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(parts: EngineParts, config: EngineConfig) -> Self {
        let EngineParts {
            store,
            timers,
            session,
            fetcher,
            presenter,
            clock,
        } = parts;
        let dedup = Arc::new(DedupTracker::new(store.clone()));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            store.clone(),
            dedup.clone(),
            presenter,
            config
                .dispatch
                .clone()
                .with_alarm_offset(config.alarms.lead_offset),
            clock.clone(),
        ));
        let scheduler = AlarmScheduler::new(
            timers.clone(),
            dedup.clone(),
            dispatcher.clone(),
            config.alarms.clone(),
        );
        let started_at = clock();
        Self {
            inner: Arc::new(EngineInner {
                store,
                timers,
                session,
                fetcher,
                dedup,
                scheduler,
                dispatcher,
                clock,
                config,
                started_at,
                warnings: Mutex::new(Vec::new()),
            }),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.inner.clock)()
    }

    /// Arms the periodic poll alarm; its first tick is immediate.
    pub async fn start(&self) -> ServerResult<()> {
        let spec = AlarmSpec::Every {
            period: self.inner.config.poll_interval,
            first: self.now(),
        };
        self.inner.timers.create(POLL_ALARM, spec).await?;
        info!(
            interval_secs = self.inner.config.poll_interval.num_seconds(),
            "calendar polling armed"
        );
        Ok(())
    }

    /// Handles fired alarm names until shutdown or until the timer driver goes away.
    pub async fn run(&self, mut fired: mpsc::Receiver<String>, shutdown: ShutdownSignal) {
        let shutdown = shutdown.wait();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                name = fired.recv() => match name {
                    Some(name) => self.handle_wake(&name).await,
                    None => break,
                },
            }
        }
        debug!("wake loop stopped");
    }

    /// Routes one fired alarm. Failures are logged and recorded, never propagated.
    #[instrument(skip(self))]
    pub async fn handle_wake(&self, name: &str) {
        match Wake::parse(name) {
            Wake::Poll => {
                if let Err(e) = self.poll_cycle().await {
                    warn!(error = %e, "poll cycle failed");
                }
            }
            Wake::TokenRefresh => match self.inner.session.get_token(false).await {
                Ok(_) => debug!("token refreshed ahead of expiry"),
                Err(e) => {
                    warn!(error = %e, "refresh-ahead failed");
                    self.record_error(auth_error_response(&e)).await;
                }
            },
            Wake::Meeting(event_id) => {
                if let Err(e) = self.inner.dispatcher.dispatch(&event_id).await {
                    warn!(%event_id, error = %e, "meeting dispatch failed");
                }
            }
            Wake::Unknown(name) => warn!(%name, "ignoring unknown alarm"),
        }
    }

    /// One complete poll: fetch, collapse, persist the snapshot, then arm alarms.
    #[instrument(skip(self))]
    pub async fn poll_cycle(&self) -> Result<PollReport, FetchError> {
        let inner = &self.inner;
        let now = self.now();
        let window = TimeWindow::lookahead(now, inner.config.lookahead);

        let outcome = match inner.fetcher.fetch_upcoming(window).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_error(fetch_error_response(&e)).await;
                return Err(e);
            }
        };
        let warnings: Vec<String> = outcome.warnings.iter().map(ToString::to_string).collect();
        let events = collapse(outcome.events);

        store::write(inner.store.as_ref(), keys::UPCOMING_EVENTS, &events).await?;
        store::write(inner.store.as_ref(), keys::LAST_POLL, &now).await?;
        inner.store.remove(&[keys::LAST_ERROR]).await?;
        *inner.warnings.lock().unwrap_or_else(PoisonError::into_inner) = warnings.clone();

        if let Err(e) = inner
            .dedup
            .prune(now, inner.config.processed_retention)
            .await
        {
            warn!(error = %e, "could not prune processed events");
        }

        let settings = Settings::load(inner.store.as_ref()).await?;
        let mut decisions = Vec::with_capacity(events.len());
        for event in &events {
            match inner.scheduler.ensure_alarm(event, settings.lead(), now).await {
                Ok(decision) => decisions.push((event.id.clone(), decision)),
                Err(e) => warn!(event_id = %event.id, error = %e, "could not arm meeting alarm"),
            }
        }

        info!(
            upcoming = events.len(),
            warnings = warnings.len(),
            "poll cycle complete"
        );
        Ok(PollReport {
            events,
            warnings,
            decisions,
        })
    }

    async fn record_error(&self, error: ErrorResponse) {
        if let Err(e) = store::write(self.inner.store.as_ref(), keys::LAST_ERROR, &error).await {
            warn!(error = %e, "could not record last error");
        }
    }

    /// Interactive sign-in, followed by a background poll.
    pub async fn sign_in(&self) -> Result<AuthStatus, AuthError> {
        self.inner.session.sign_in().await?;
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.poll_cycle().await {
                warn!(error = %e, "post sign-in poll failed");
            }
        });
        self.auth_status().await
    }

    /// Signs out and drops the snapshot so pending meeting alarms fall through.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.inner.session.sign_out().await?;
        self.inner
            .store
            .remove(&[keys::UPCOMING_EVENTS, keys::LAST_ERROR])
            .await?;
        Ok(())
    }

    pub async fn auth_status(&self) -> Result<AuthStatus, AuthError> {
        let session = self.inner.session.session().await?;
        Ok(AuthStatus {
            signed_in: session.is_signed_in(),
            authenticating: session.authenticating,
            expires_at: session.expires_at,
        })
    }

    /// The persisted snapshot, without fetching.
    pub async fn upcoming(&self) -> ServerResult<Vec<CalendarEvent>> {
        Ok(
            store::read(self.inner.store.as_ref(), keys::UPCOMING_EVENTS)
                .await?
                .unwrap_or_default(),
        )
    }

    pub async fn status(&self) -> ServerResult<StatusUpdate> {
        let store = self.inner.store.as_ref();
        let now = self.now();
        let warnings = self
            .inner
            .warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let auth = self.auth_status().await.unwrap_or_else(|e| {
            warn!(error = %e, "could not read session");
            AuthStatus::default()
        });
        let upcoming = self.upcoming().await?;
        let next_meeting = upcoming
            .iter()
            .filter(|e| e.end_time > now)
            .min_by_key(|e| e.start_time)
            .cloned();

        Ok(StatusUpdate {
            auth,
            uptime_seconds: (now - self.inner.started_at).num_seconds().max(0) as u64,
            last_poll: store::read(store, keys::LAST_POLL).await?,
            last_error: store::read(store, keys::LAST_ERROR).await?,
            warnings,
            upcoming_count: upcoming.len(),
            next_meeting,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EngineFixture, api_item};
    use chrono::TimeZone;
    use meetring_core::meeting_alarm_name;
    use meetring_protocol::ErrorCode;
    use serde_json::json;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    fn occurrence(id: &str, series: &str, start: DateTime<Utc>) -> serde_json::Value {
        let mut item = api_item(id, start);
        item["recurringEventId"] = json!(series);
        item
    }

    #[tokio::test]
    async fn poll_keeps_the_next_occurrence_and_arms_it() {
        let h = EngineFixture::signed_in(at(8, 27)).await;
        h.calendar.set_items(vec![
            occurrence("S123_0900", "S123", at(9, 0)),
            occurrence("S123_0930", "S123", at(9, 30)),
            occurrence("S123_0830", "S123", at(8, 30)),
        ]);

        let report = h.engine.poll_cycle().await.unwrap();

        let ids: Vec<&str> = report.events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["S123_0830"]);
        let snapshot = h.engine.upcoming().await.unwrap();
        assert_eq!(snapshot, report.events);

        let alarms = h.timers.alarms().await;
        assert_eq!(alarms.len(), 1);
        let alarm = alarms.get(&meeting_alarm_name("S123_0830")).unwrap();
        assert_eq!(alarm.fire_at, at(8, 30) - Duration::seconds(30));
    }

    #[tokio::test]
    async fn fetch_failure_is_recorded_until_the_next_success() {
        let h = EngineFixture::signed_in(at(8, 0)).await;
        h.calendar
            .fail_with(FetchError::Quota("rate limited".to_string()));

        let err = h.engine.poll_cycle().await.unwrap_err();
        assert_eq!(err, FetchError::Quota("rate limited".to_string()));
        let status = h.engine.status().await.unwrap();
        assert_eq!(status.last_error.unwrap().code, ErrorCode::Quota);
        assert_eq!(status.last_poll, None);

        *h.calendar.failure.lock().unwrap() = None;
        h.calendar.set_items(vec![api_item("a", at(10, 0))]);
        h.engine.poll_cycle().await.unwrap();

        let status = h.engine.status().await.unwrap();
        assert!(status.last_error.is_none());
        assert_eq!(status.last_poll, Some(at(8, 0)));
        assert_eq!(status.upcoming_count, 1);
    }

    #[tokio::test]
    async fn meeting_wake_alerts_once_across_restarts() {
        let h = EngineFixture::signed_in(at(8, 29)).await;
        h.calendar.set_items(vec![api_item("standup", at(8, 40))]);
        h.engine.poll_cycle().await.unwrap();
        h.clock.set(at(8, 39));

        let name = meeting_alarm_name("standup");
        h.engine.handle_wake(&name).await;
        h.engine.handle_wake(&name).await;
        assert_eq!(h.presenter.notified_ids(), vec!["standup"]);

        // a fresh engine over the same store, as after a daemon restart
        let restarted = h.restart();
        restarted.handle_wake(&name).await;
        restarted.poll_cycle().await.unwrap();
        assert_eq!(h.presenter.notified_ids(), vec!["standup"]);
    }

    #[tokio::test]
    async fn start_arms_an_immediate_periodic_poll() {
        let h = EngineFixture::signed_in(at(8, 0)).await;
        h.engine.start().await.unwrap();

        let alarms = h.timers.alarms().await;
        let poll = alarms.get(POLL_ALARM).unwrap();
        assert_eq!(poll.fire_at, at(8, 0));
        assert_eq!(h.timers.take_due(at(8, 0)).await, vec![POLL_ALARM.to_string()]);

        let next = h.timers.alarms().await;
        assert_eq!(next.get(POLL_ALARM).unwrap().fire_at, at(8, 1));
    }

    #[tokio::test]
    async fn sign_out_drops_the_snapshot() {
        let h = EngineFixture::signed_in(at(8, 29)).await;
        h.calendar.set_items(vec![api_item("standup", at(8, 40))]);
        h.engine.poll_cycle().await.unwrap();

        h.engine.sign_out().await.unwrap();

        assert!(h.engine.upcoming().await.unwrap().is_empty());
        assert!(!h.engine.auth_status().await.unwrap().signed_in);
        h.clock.set(at(8, 39));
        h.engine.handle_wake(&meeting_alarm_name("standup")).await;
        assert!(h.presenter.notified_ids().is_empty());
    }

    #[tokio::test]
    async fn status_points_at_the_next_unfinished_meeting() {
        let h = EngineFixture::signed_in(at(9, 10)).await;
        h.calendar.set_items(vec![
            api_item("running", at(9, 0)),
            api_item("later", at(11, 0)),
            api_item("soon", at(10, 0)),
        ]);
        h.engine.poll_cycle().await.unwrap();
        h.clock.set(at(9, 45));

        let status = h.engine.status().await.unwrap();
        assert!(status.auth.signed_in);
        assert_eq!(status.upcoming_count, 3);
        assert_eq!(status.next_meeting.unwrap().id, "soon");
        assert_eq!(status.uptime_seconds, 35 * 60);
    }

    #[tokio::test]
    async fn poll_prunes_old_processed_entries() {
        let h = EngineFixture::signed_in(at(8, 0)).await;
        store::write(
            &h.store,
            keys::PROCESSED_EVENT_IDS,
            &json!([
                {"id": "ancient", "start_time": at(8, 0) - Duration::days(30)},
                "legacy-id",
            ]),
        )
        .await
        .unwrap();

        h.engine.poll_cycle().await.unwrap();

        let kept = h.engine.inner.dedup.entries().await.unwrap();
        let ids: Vec<&str> = kept.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["legacy-id"]);
    }

    #[tokio::test]
    async fn unknown_wakes_change_nothing() {
        let h = EngineFixture::signed_in(at(8, 0)).await;
        let before = h.store.dump().await;
        h.engine.handle_wake("someone_elses_alarm").await;
        assert_eq!(h.store.dump().await, before);
        assert_eq!(h.calendar.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
