//! Paginated, filtered retrieval of upcoming events.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use futures_util::future::Shared;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use meetring_core::{BoxFuture, CalendarEvent, TimeWindow};

use crate::calendar::{CalendarApi, parse_event};
use crate::error::{FetchError, FetchWarning};
use crate::session::SessionManager;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Hard cap on pages per fetch; results past it are left for the next poll.
    pub page_cap: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { page_cap: 5 }
    }
}

impl FetchConfig {
    pub fn with_page_cap(mut self, page_cap: usize) -> Self {
        self.page_cap = page_cap.max(1);
        self
    }
}

/// Eligible events in fetch order, plus anything that made them partial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub events: Vec<CalendarEvent>,
    pub warnings: Vec<FetchWarning>,
}

impl FetchOutcome {
    pub fn is_partial(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, FetchWarning::PaginationCapped { .. }))
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<FetchOutcome, FetchError>>>;

struct FetcherInner {
    session: SessionManager,
    api: Arc<dyn CalendarApi>,
    config: FetchConfig,
    in_flight: Mutex<Option<SharedFetch>>,
}

#[derive(Clone)]
pub struct EventFetcher {
    inner: Arc<FetcherInner>,
}

impl EventFetcher {
    pub fn new(session: SessionManager, api: Arc<dyn CalendarApi>, config: FetchConfig) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                session,
                api,
                config,
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Fetches events starting in `window` that the user should be alerted to.
    ///
    /// A call made while another fetch is running returns that fetch's result.
    pub async fn fetch_upcoming(&self, window: TimeWindow) -> Result<FetchOutcome, FetchError> {
        let flight = {
            let mut slot = self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(flight) => {
                    debug!("joining in-flight fetch");
                    flight.clone()
                }
                None => {
                    let flight = self.start_fetch(window);
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    fn start_fetch(&self, window: TimeWindow) -> SharedFetch {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.run_fetch(window).await;
            inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            result
        });
        let flight: BoxFuture<'static, Result<FetchOutcome, FetchError>> = Box::pin(async move {
            task.await
                .unwrap_or_else(|e| Err(FetchError::Network(format!("fetch task failed: {e}"))))
        });
        flight.shared()
    }
}

impl FetcherInner {
    #[instrument(skip(self))]
    async fn run_fetch(&self, window: TimeWindow) -> Result<FetchOutcome, FetchError> {
        let token = self.session.get_token(false).await?;

        let (items, capped) = match self.fetch_pages(&token, window).await {
            Err(FetchError::Unauthorized) => {
                info!("calendar rejected the token; refreshing once and restarting");
                let token = self.session.refresh(false).await?;
                self.fetch_pages(&token, window).await?
            }
            other => other?,
        };

        let mut outcome = FetchOutcome::default();
        if capped {
            outcome.warnings.push(FetchWarning::PaginationCapped {
                pages: self.config.page_cap,
            });
        }

        let mut skipped = 0;
        for item in &items {
            match parse_event(item) {
                Ok(Some(event)) if event.is_declined() => {
                    debug!(event_id = %event.id, "dropping declined event");
                }
                Ok(Some(event)) if !event.has_conference_link() => {
                    debug!(event_id = %event.id, "dropping event without a join link");
                }
                Ok(Some(event)) => outcome.events.push(event),
                Ok(None) => {}
                Err(reason) => {
                    skipped += 1;
                    let id = item.get("id").and_then(Value::as_str).unwrap_or("<none>");
                    warn!(event_id = id, %reason, "skipping malformed event");
                }
            }
        }
        if skipped > 0 {
            outcome.warnings.push(FetchWarning::Malformed { skipped });
        }

        info!(
            fetched = items.len(),
            eligible = outcome.events.len(),
            partial = capped,
            "fetch complete"
        );
        Ok(outcome)
    }

    /// All items across pages in page order, and whether the cap cut it short.
    async fn fetch_pages(
        &self,
        token: &str,
        window: TimeWindow,
    ) -> Result<(Vec<Value>, bool), FetchError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 1..=self.config.page_cap {
            let result = self
                .api
                .list_events_page(token, window, cursor.as_deref())
                .await?;
            items.extend(result.items);
            match result.next_page_token {
                Some(next) => cursor = Some(next),
                None => return Ok((items, false)),
            }
            debug!(page, "following page cursor");
        }

        warn!(
            pages = self.config.page_cap,
            "page cap reached with more results pending; returning partial results"
        );
        Ok((items, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use meetring_core::store::keys;
    use meetring_core::{KeyValueStore, MemoryStore, MemoryTimerService};

    use crate::calendar::EventPage;
    use crate::oauth::TokenGrant;
    use crate::session::SessionConfig;
    use crate::testing::ScriptedAuthorizer;

    #[derive(Default)]
    struct FakeCalendar {
        responses: Mutex<VecDeque<Result<EventPage, FetchError>>>,
        /// Once the script is exhausted, keep returning full pages with a cursor.
        endless: bool,
        delay: Duration,
        calls: Mutex<Vec<(String, Option<String>)>>,
    }

    impl FakeCalendar {
        fn scripted(responses: Vec<Result<EventPage, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                ..Self::default()
            })
        }

        fn calls(&self) -> Vec<(String, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CalendarApi for FakeCalendar {
        fn list_events_page<'a>(
            &'a self,
            token: &'a str,
            _window: TimeWindow,
            page_token: Option<&'a str>,
        ) -> BoxFuture<'a, Result<EventPage, FetchError>> {
            Box::pin(async move {
                let n = {
                    let mut calls = self.calls.lock().unwrap();
                    calls.push((token.to_string(), page_token.map(str::to_string)));
                    calls.len()
                };
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let next = self.responses.lock().unwrap().pop_front();
                match next {
                    Some(response) => response,
                    None if self.endless => Ok(page(&[&format!("e{n}a"), &format!("e{n}b")], Some("more"))),
                    None => Ok(EventPage::default()),
                }
            })
        }
    }

    fn item(id: &str) -> Value {
        json!({
            "id": id,
            "summary": id,
            "start": {"dateTime": "2025-03-10T10:00:00Z"},
            "end": {"dateTime": "2025-03-10T10:30:00Z"},
            "hangoutLink": "https://meet.google.com/abc-defg-hij"
        })
    }

    fn page(ids: &[&str], next: Option<&str>) -> EventPage {
        EventPage {
            items: ids.iter().map(|id| item(id)).collect(),
            next_page_token: next.map(str::to_string),
        }
    }

    fn window() -> TimeWindow {
        TimeWindow::lookahead(
            Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap(),
            chrono::Duration::hours(12),
        )
    }

    async fn fetcher_with(
        api: Arc<FakeCalendar>,
        authorizer: Arc<ScriptedAuthorizer>,
        signed_in: bool,
    ) -> EventFetcher {
        let store = MemoryStore::new();
        if signed_in {
            store
                .set(HashMap::from([
                    (keys::OAUTH_TOKEN.to_string(), json!("tok")),
                    (keys::TOKEN_EXPIRY.to_string(), json!(Utc::now() + chrono::Duration::hours(1))),
                ]))
                .await
                .unwrap();
        }
        let session = SessionManager::new(
            Arc::new(store),
            Arc::new(MemoryTimerService::new()),
            authorizer,
            SessionConfig::default(),
        );
        EventFetcher::new(session, api, FetchConfig::default())
    }

    async fn fetcher(api: Arc<FakeCalendar>) -> EventFetcher {
        fetcher_with(api, ScriptedAuthorizer::new(vec![]), true).await
    }

    fn ids(outcome: &FetchOutcome) -> Vec<&str> {
        outcome.events.iter().map(|e| e.id.as_str()).collect()
    }

    mod pagination {
        use super::*;

        #[tokio::test]
        async fn pages_are_concatenated_in_order() {
            let api = FakeCalendar::scripted(vec![
                Ok(page(&["a", "b"], Some("p2"))),
                Ok(page(&["c"], Some("p3"))),
                Ok(page(&["d"], None)),
            ]);
            let outcome = fetcher(api.clone()).await.fetch_upcoming(window()).await.unwrap();

            assert_eq!(ids(&outcome), ["a", "b", "c", "d"]);
            assert!(outcome.warnings.is_empty());
            let cursors: Vec<_> = api.calls().into_iter().map(|(_, c)| c).collect();
            assert_eq!(cursors, [None, Some("p2".to_string()), Some("p3".to_string())]);
        }

        #[tokio::test]
        async fn stops_at_page_cap_with_warning() {
            let api = Arc::new(FakeCalendar {
                endless: true,
                ..FakeCalendar::default()
            });
            let outcome = fetcher(api.clone()).await.fetch_upcoming(window()).await.unwrap();

            assert_eq!(api.calls().len(), 5);
            assert_eq!(outcome.events.len(), 10);
            assert_eq!(outcome.warnings, [FetchWarning::PaginationCapped { pages: 5 }]);
            assert!(outcome.is_partial());
        }
    }

    mod filtering {
        use super::*;

        #[tokio::test]
        async fn declined_linkless_and_malformed_are_dropped() {
            let mut declined = item("declined");
            declined["attendees"] = json!([{"email": "me@x.com", "self": true, "responseStatus": "declined"}]);
            let mut accepted_other = item("other-declined");
            accepted_other["attendees"] = json!([{"email": "you@x.com", "responseStatus": "declined"}]);
            let mut linkless = item("linkless");
            linkless.as_object_mut().unwrap().remove("hangoutLink");
            let mut malformed = item("broken");
            malformed["start"] = json!({"dateTime": "garbage"});

            let api = FakeCalendar::scripted(vec![Ok(EventPage {
                items: vec![item("keep"), declined, accepted_other, linkless, malformed],
                next_page_token: None,
            })]);
            let outcome = fetcher(api).await.fetch_upcoming(window()).await.unwrap();

            assert_eq!(ids(&outcome), ["keep", "other-declined"]);
            assert_eq!(outcome.warnings, [FetchWarning::Malformed { skipped: 1 }]);
            assert!(!outcome.is_partial());
        }
    }

    mod auth {
        use super::*;

        #[tokio::test]
        async fn signed_out_is_unauthorized_without_requests() {
            let api = FakeCalendar::scripted(vec![]);
            let fetcher = fetcher_with(api.clone(), ScriptedAuthorizer::new(vec![]), false).await;

            assert_eq!(fetcher.fetch_upcoming(window()).await, Err(FetchError::Unauthorized));
            assert!(api.calls().is_empty());
        }

        #[tokio::test]
        async fn mid_pagination_401_restarts_from_first_page() {
            let api = FakeCalendar::scripted(vec![
                Ok(page(&["a"], Some("p2"))),
                Err(FetchError::Unauthorized),
                Ok(page(&["a"], Some("p2"))),
                Ok(page(&["b"], None)),
            ]);
            let authorizer = ScriptedAuthorizer::new(vec![Ok(TokenGrant::new("tok2", Some(3600)))]);
            let fetcher = fetcher_with(api.clone(), authorizer.clone(), true).await;

            let outcome = fetcher.fetch_upcoming(window()).await.unwrap();
            assert_eq!(ids(&outcome), ["a", "b"]);
            assert_eq!(authorizer.calls(), 1);
            assert_eq!(
                api.calls(),
                [
                    ("tok".to_string(), None),
                    ("tok".to_string(), Some("p2".to_string())),
                    ("tok2".to_string(), None),
                    ("tok2".to_string(), Some("p2".to_string())),
                ]
            );
        }

        #[tokio::test]
        async fn second_401_propagates() {
            let api = FakeCalendar::scripted(vec![
                Err(FetchError::Unauthorized),
                Err(FetchError::Unauthorized),
                Ok(page(&["never"], None)),
            ]);
            let authorizer = ScriptedAuthorizer::new(vec![Ok(TokenGrant::new("tok2", Some(3600)))]);
            let fetcher = fetcher_with(api.clone(), authorizer, true).await;

            assert_eq!(fetcher.fetch_upcoming(window()).await, Err(FetchError::Unauthorized));
            assert_eq!(api.calls().len(), 2);
        }

        #[tokio::test]
        async fn network_errors_are_not_retried() {
            let api = FakeCalendar::scripted(vec![Err(FetchError::Network("reset".into()))]);
            let fetcher = fetcher(api.clone()).await;

            assert!(matches!(
                fetcher.fetch_upcoming(window()).await,
                Err(FetchError::Network(_))
            ));
            assert_eq!(api.calls().len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fetches_share_one_request() {
        let api = Arc::new(FakeCalendar {
            responses: Mutex::new(VecDeque::from([Ok(page(&["a"], None))])),
            delay: Duration::from_secs(1),
            ..FakeCalendar::default()
        });
        let fetcher = fetcher(api.clone()).await;

        let (first, second) = tokio::join!(
            fetcher.fetch_upcoming(window()),
            fetcher.fetch_upcoming(window())
        );
        assert_eq!(first, second);
        assert_eq!(ids(&first.unwrap()), ["a"]);
        assert_eq!(api.calls().len(), 1);
    }
}
