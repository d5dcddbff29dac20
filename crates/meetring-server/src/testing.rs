//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use meetring_core::store::{self, keys};
use meetring_core::{
    BoxFuture, CalendarEvent, KeyValueStore, ManualClock, MemoryStore, MemoryTimerService,
    TimeWindow, TimerService,
};
use meetring_providers::{
    AuthError, Authorizer, CalendarApi, EventFetcher, EventPage, FetchConfig, FetchError,
    SessionConfig, SessionManager, TokenGrant,
};
use serde_json::{Value, json};

use crate::engine::{Engine, EngineConfig, EngineParts};
use crate::present::{AlertNotification, PresentError, Presenter};

/// Records every presentation; either path can be made to fail.
#[derive(Default)]
pub(crate) struct RecordingPresenter {
    pub(crate) windows: Mutex<Vec<String>>,
    pub(crate) notifications: Mutex<Vec<AlertNotification>>,
    pub(crate) fail_windows: AtomicBool,
    pub(crate) fail_notifications: AtomicBool,
    pub(crate) delay: Mutex<Duration>,
}

impl RecordingPresenter {
    pub(crate) fn windows(&self) -> Vec<String> {
        self.windows.lock().unwrap().clone()
    }

    pub(crate) fn notified_ids(&self) -> Vec<String> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.id.clone())
            .collect()
    }
}

impl Presenter for RecordingPresenter {
    fn create_window<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), PresentError>> {
        Box::pin(async move {
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail_windows.load(Ordering::SeqCst) {
                return Err(PresentError("no display".to_string()));
            }
            self.windows.lock().unwrap().push(url.to_string());
            Ok(())
        })
    }

    fn create_notification<'a>(
        &'a self,
        notification: &'a AlertNotification,
    ) -> BoxFuture<'a, Result<(), PresentError>> {
        Box::pin(async move {
            if self.fail_notifications.load(Ordering::SeqCst) {
                return Err(PresentError("notification daemon unavailable".to_string()));
            }
            self.notifications.lock().unwrap().push(notification.clone());
            Ok(())
        })
    }
}

/// Hands out the same token forever.
pub(crate) struct StaticAuthorizer;

impl Authorizer for StaticAuthorizer {
    fn authorize<'a>(
        &'a self,
        _interactive: bool,
        _refresh_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<TokenGrant, AuthError>> {
        Box::pin(async { Ok(TokenGrant::new("ya29.test", Some(3600))) })
    }
}

/// Serves one page of raw API items, or a scripted failure.
#[derive(Default)]
pub(crate) struct FakeCalendar {
    pub(crate) items: Mutex<Vec<Value>>,
    pub(crate) failure: Mutex<Option<FetchError>>,
    pub(crate) calls: AtomicUsize,
}

impl FakeCalendar {
    pub(crate) fn set_items(&self, items: Vec<Value>) {
        *self.items.lock().unwrap() = items;
    }

    pub(crate) fn fail_with(&self, error: FetchError) {
        *self.failure.lock().unwrap() = Some(error);
    }
}

impl CalendarApi for FakeCalendar {
    fn list_events_page<'a>(
        &'a self,
        _token: &'a str,
        _window: TimeWindow,
        _page_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<EventPage, FetchError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.failure.lock().unwrap().clone() {
                return Err(error);
            }
            Ok(EventPage {
                items: self.items.lock().unwrap().clone(),
                next_page_token: None,
            })
        })
    }
}

/// A Google Calendar API item with a Meet link.
pub(crate) fn api_item(id: &str, start: DateTime<Utc>) -> Value {
    json!({
        "id": id,
        "summary": format!("Meeting {id}"),
        "status": "confirmed",
        "start": {"dateTime": start.to_rfc3339()},
        "end": {"dateTime": (start + chrono::Duration::minutes(30)).to_rfc3339()},
        "hangoutLink": format!("https://meet.google.com/{id}-abcd-efg"),
    })
}

pub(crate) fn meeting(id: &str, start: DateTime<Utc>) -> CalendarEvent {
    CalendarEvent::new(
        id,
        format!("Meeting {id}"),
        start,
        start + chrono::Duration::minutes(30),
    )
    .with_conference_link(format!("https://meet.google.com/{id}-abcd-efg"))
}

pub(crate) async fn put_snapshot(store: &dyn KeyValueStore, events: &[CalendarEvent]) {
    store::write(store, keys::UPCOMING_EVENTS, events).await.unwrap();
}

/// An engine over in-memory collaborators, already holding a token valid for an hour.
pub(crate) struct EngineFixture {
    pub(crate) store: MemoryStore,
    pub(crate) timers: MemoryTimerService,
    pub(crate) calendar: Arc<FakeCalendar>,
    pub(crate) presenter: Arc<RecordingPresenter>,
    pub(crate) clock: ManualClock,
    pub(crate) engine: Engine,
}

impl EngineFixture {
    pub(crate) async fn signed_in(now: DateTime<Utc>) -> Self {
        let store = MemoryStore::new();
        store
            .set(HashMap::from([
                (keys::OAUTH_TOKEN.to_string(), json!("ya29.cached")),
                (
                    keys::TOKEN_EXPIRY.to_string(),
                    json!(now + chrono::Duration::hours(1)),
                ),
            ]))
            .await
            .unwrap();
        let timers = MemoryTimerService::new();
        let calendar = Arc::new(FakeCalendar::default());
        let presenter = Arc::new(RecordingPresenter::default());
        let clock = ManualClock::new(now);
        let engine = build_engine(&store, &timers, &calendar, &presenter, &clock);
        Self {
            store,
            timers,
            calendar,
            presenter,
            clock,
            engine,
        }
    }

    /// A second engine over the same state, as after a daemon restart.
    pub(crate) fn restart(&self) -> Engine {
        build_engine(
            &self.store,
            &self.timers,
            &self.calendar,
            &self.presenter,
            &self.clock,
        )
    }
}

fn build_engine(
    store: &MemoryStore,
    timers: &MemoryTimerService,
    calendar: &Arc<FakeCalendar>,
    presenter: &Arc<RecordingPresenter>,
    clock: &ManualClock,
) -> Engine {
    let shared: Arc<dyn KeyValueStore> = Arc::new(store.clone());
    let timer_service: Arc<dyn TimerService> = Arc::new(timers.clone());
    let session = SessionManager::with_clock(
        shared.clone(),
        timer_service.clone(),
        Arc::new(StaticAuthorizer),
        SessionConfig::default(),
        clock.clock(),
    );
    let fetcher = EventFetcher::new(session.clone(), calendar.clone(), FetchConfig::default());
    Engine::new(
        EngineParts {
            store: shared,
            timers: timer_service,
            session,
            fetcher,
            presenter: presenter.clone(),
            clock: clock.clock(),
        },
        EngineConfig::default(),
    )
}
