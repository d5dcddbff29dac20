//! Turns a fired meeting alarm into a user-facing alert, at most once per event.

use std::sync::Arc;
use std::time::Duration;

use meetring_core::store::{self, keys};
use meetring_core::{CalendarEvent, Clock, KeyValueStore, Settings, StoreError};
use tracing::{debug, error, info, instrument, warn};

use crate::dedup::DedupTracker;
use crate::error::DispatchError;
use crate::present::{AlertNotification, Presenter};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Bound on one whole dispatch, store reads and presentation included.
    pub timeout: Duration,
    /// Page that renders the ringing window; receives the event as `?meeting=<json>`.
    pub popup_url: Option<String>,
    /// How long before start meeting alarms fire. The engine copies it from
    /// [`AlarmConfig::lead_offset`](crate::AlarmConfig::lead_offset).
    pub alarm_offset: chrono::Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            popup_url: None,
            alarm_offset: chrono::Duration::seconds(30),
        }
    }
}

impl DispatchConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_popup_url(mut self, url: impl Into<String>) -> Self {
        self.popup_url = Some(url.into());
        self
    }

    pub fn with_alarm_offset(mut self, offset: chrono::Duration) -> Self {
        self.alarm_offset = offset;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The event left the upcoming snapshot (cancelled or collapsed away).
    NotInSnapshot,
    /// The event now starts later than the alarm was armed for; left
    /// unprocessed for the next poll to re-arm.
    NotDue,
    AlreadyProcessed,
    /// At least one path succeeded.
    Presented { window: bool, notification: bool },
}

pub struct NotificationDispatcher {
    store: Arc<dyn KeyValueStore>,
    dedup: Arc<DedupTracker>,
    presenter: Arc<dyn Presenter>,
    config: DispatchConfig,
    clock: Clock,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        dedup: Arc<DedupTracker>,
        presenter: Arc<dyn Presenter>,
        config: DispatchConfig,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            dedup,
            presenter,
            config,
            clock,
        }
    }

    /// Alerts the user to `event_id` unless it is gone or was already alerted.
    ///
    /// State is re-read from the store on every call.
    #[instrument(skip(self))]
    pub async fn dispatch(&self, event_id: &str) -> Result<DispatchOutcome, DispatchError> {
        match tokio::time::timeout(self.config.timeout, self.run(event_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.config.timeout, "dispatch timed out");
                Err(DispatchError::Timeout {
                    after: self.config.timeout,
                })
            }
        }
    }

    async fn run(&self, event_id: &str) -> Result<DispatchOutcome, DispatchError> {
        let snapshot: Vec<CalendarEvent> =
            store::read(self.store.as_ref(), keys::UPCOMING_EVENTS)
                .await?
                .unwrap_or_default();
        let Some(event) = snapshot.into_iter().find(|e| e.id == event_id) else {
            debug!("event no longer upcoming");
            return Ok(DispatchOutcome::NotInSnapshot);
        };
        let settings = Settings::load(self.store.as_ref()).await?;

        let now = (self.clock)();
        let until_start = event.start_time - now;
        if until_start > settings.lead().max(self.config.alarm_offset) {
            debug!(until_start_secs = until_start.num_seconds(), "meeting moved later; not due yet");
            return Ok(DispatchOutcome::NotDue);
        }

        if !self.dedup.mark_processed(&event, now).await? {
            debug!("event already alerted");
            return Ok(DispatchOutcome::AlreadyProcessed);
        }
        self.present(&event, &settings).await
    }

    async fn present(
        &self,
        event: &CalendarEvent,
        settings: &Settings,
    ) -> Result<DispatchOutcome, DispatchError> {
        let window = match self.window_url(event, settings)? {
            Some(url) => Some(self.presenter.create_window(&url).await),
            None => None,
        };
        let alert = AlertNotification::for_event(event);
        let notification = self.presenter.create_notification(&alert).await;

        if let Some(Err(e)) = &window {
            warn!(error = %e, "window presentation failed");
        }
        if let Err(e) = &notification {
            warn!(error = %e, "notification failed");
        }

        let window_ok = matches!(window, Some(Ok(())));
        let notification_ok = notification.is_ok();
        if let (false, Err(notification)) = (window_ok, notification) {
            let window = match window {
                Some(Err(e)) => e.to_string(),
                _ => "no window configured".to_string(),
            };
            error!(%window, %notification, "could not alert the user");
            return Err(DispatchError::PresentationFailed {
                window,
                notification: notification.to_string(),
            });
        }

        let outcome = DispatchOutcome::Presented {
            window: window_ok,
            notification: notification_ok,
        };
        info!(title = %event.title, ?outcome, "meeting alert presented");
        Ok(outcome)
    }

    fn window_url(
        &self,
        event: &CalendarEvent,
        settings: &Settings,
    ) -> Result<Option<String>, DispatchError> {
        if settings.auto_join {
            return Ok(event.conference_link.clone());
        }
        let Some(base) = &self.config.popup_url else {
            return Ok(None);
        };
        let payload = serde_json::to_string(event).map_err(StoreError::from)?;
        let separator = if base.contains('?') { '&' } else { '?' };
        Ok(Some(format!(
            "{base}{separator}meeting={}",
            urlencoding::encode(&payload)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingPresenter, meeting, put_snapshot};
    use chrono::{DateTime, TimeZone, Utc};
    use meetring_core::{ManualClock, MemoryStore};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct Harness {
        store: MemoryStore,
        presenter: Arc<RecordingPresenter>,
        dispatcher: NotificationDispatcher,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()
    }

    fn harness(config: DispatchConfig) -> Harness {
        let store = MemoryStore::new();
        let shared: Arc<dyn KeyValueStore> = Arc::new(store.clone());
        let presenter = Arc::new(RecordingPresenter::default());
        let dispatcher = NotificationDispatcher::new(
            shared.clone(),
            Arc::new(DedupTracker::new(shared)),
            presenter.clone(),
            config,
            ManualClock::new(now()).clock(),
        );
        Harness {
            store,
            presenter,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn presents_once_then_is_a_noop() {
        let h = harness(DispatchConfig::default().with_popup_url("https://meetring.app/ring"));
        put_snapshot(&h.store, &[meeting("evt1", now())]).await;

        let first = h.dispatcher.dispatch("evt1").await.unwrap();
        assert_eq!(
            first,
            DispatchOutcome::Presented {
                window: true,
                notification: true
            }
        );
        for _ in 0..3 {
            assert_eq!(
                h.dispatcher.dispatch("evt1").await.unwrap(),
                DispatchOutcome::AlreadyProcessed
            );
        }
        assert_eq!(h.presenter.notified_ids(), vec!["evt1"]);
        assert_eq!(h.presenter.windows().len(), 1);
    }

    #[tokio::test]
    async fn window_url_carries_the_encoded_event() {
        let h = harness(DispatchConfig::default().with_popup_url("https://meetring.app/ring"));
        let event = meeting("evt1", now());
        put_snapshot(&h.store, std::slice::from_ref(&event)).await;

        h.dispatcher.dispatch("evt1").await.unwrap();

        let url = h.presenter.windows().remove(0);
        let encoded = url
            .strip_prefix("https://meetring.app/ring?meeting=")
            .unwrap();
        let decoded = urlencoding::decode(encoded).unwrap();
        let payload: CalendarEvent = serde_json::from_str(&decoded).unwrap();
        assert_eq!(payload, event);
    }

    #[tokio::test]
    async fn auto_join_opens_the_meeting_link() {
        let h = harness(DispatchConfig::default().with_popup_url("https://meetring.app/ring"));
        put_snapshot(&h.store, &[meeting("evt1", now())]).await;
        store::write(&h.store, keys::SETTINGS, &json!({"auto_join": true}))
            .await
            .unwrap();

        h.dispatcher.dispatch("evt1").await.unwrap();
        assert_eq!(
            h.presenter.windows(),
            vec!["https://meet.google.com/evt1-abcd-efg"]
        );
    }

    #[tokio::test]
    async fn event_missing_from_snapshot_is_silently_skipped() {
        let h = harness(DispatchConfig::default());
        put_snapshot(&h.store, &[meeting("other", now())]).await;

        let outcome = h.dispatcher.dispatch("cancelled").await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NotInSnapshot);
        assert!(h.presenter.notified_ids().is_empty());
        assert!(!h.store.dump().await.contains_key(keys::PROCESSED_EVENT_IDS));
    }

    #[tokio::test]
    async fn meeting_moved_later_does_not_ring_early() {
        let h = harness(DispatchConfig::default());
        put_snapshot(&h.store, &[meeting("evt1", now() + chrono::Duration::minutes(30))]).await;

        let outcome = h.dispatcher.dispatch("evt1").await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NotDue);
        assert!(h.presenter.notified_ids().is_empty());
        assert!(!h.store.dump().await.contains_key(keys::PROCESSED_EVENT_IDS));
    }

    #[tokio::test]
    async fn alarm_offset_beyond_a_zero_lead_still_rings() {
        let h = harness(DispatchConfig::default());
        put_snapshot(&h.store, &[meeting("evt1", now() + chrono::Duration::seconds(30))]).await;
        store::write(&h.store, keys::SETTINGS, &json!({"notification_lead_minutes": 0}))
            .await
            .unwrap();

        assert!(matches!(
            h.dispatcher.dispatch("evt1").await.unwrap(),
            DispatchOutcome::Presented { .. }
        ));
    }

    #[tokio::test]
    async fn window_failure_falls_back_to_notification() {
        let h = harness(DispatchConfig::default().with_popup_url("https://meetring.app/ring"));
        h.presenter.fail_windows.store(true, Ordering::SeqCst);
        put_snapshot(&h.store, &[meeting("evt1", now())]).await;

        let outcome = h.dispatcher.dispatch("evt1").await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Presented {
                window: false,
                notification: true
            }
        );
    }

    #[tokio::test]
    async fn both_paths_failing_is_an_error_but_stays_processed() {
        let h = harness(DispatchConfig::default().with_popup_url("https://meetring.app/ring"));
        h.presenter.fail_windows.store(true, Ordering::SeqCst);
        h.presenter.fail_notifications.store(true, Ordering::SeqCst);
        put_snapshot(&h.store, &[meeting("evt1", now())]).await;

        let err = h.dispatcher.dispatch("evt1").await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::PresentationFailed {
                window: "no display".to_string(),
                notification: "notification daemon unavailable".to_string(),
            }
        );
        assert_eq!(
            h.dispatcher.dispatch("evt1").await.unwrap(),
            DispatchOutcome::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn notification_alone_suffices_without_a_popup() {
        let h = harness(DispatchConfig::default());
        put_snapshot(&h.store, &[meeting("evt1", now())]).await;

        let outcome = h.dispatcher.dispatch("evt1").await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Presented {
                window: false,
                notification: true
            }
        );
        assert!(h.presenter.windows().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_presentation_times_out() {
        let h = harness(
            DispatchConfig::default()
                .with_popup_url("https://meetring.app/ring")
                .with_timeout(Duration::from_secs(30)),
        );
        *h.presenter.delay.lock().unwrap() = Duration::from_secs(60);
        put_snapshot(&h.store, &[meeting("evt1", now())]).await;

        let err = h.dispatcher.dispatch("evt1").await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::Timeout {
                after: Duration::from_secs(30)
            }
        );
        assert!(h.presenter.notified_ids().is_empty());
        assert_eq!(
            h.dispatcher.dispatch("evt1").await.unwrap(),
            DispatchOutcome::AlreadyProcessed
        );
    }
}
