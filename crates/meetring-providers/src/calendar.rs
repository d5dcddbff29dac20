//! Google Calendar v3 events API.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use meetring_core::{Attendee, BoxFuture, CalendarEvent, ResponseStatus, TimeWindow, detect_link, find_video_link};

use crate::error::FetchError;

pub const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";

/// One page of `events.list`.
///
/// Items stay as raw JSON so one malformed record cannot fail the page.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Calendar HTTP API collaborator.
pub trait CalendarApi: Send + Sync {
    /// Fetches one page of events starting in `window`.
    fn list_events_page<'a>(
        &'a self,
        token: &'a str,
        window: TimeWindow,
        page_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<EventPage, FetchError>>;
}

#[derive(Debug, Clone)]
pub struct GoogleCalendarClient {
    http: reqwest::Client,
    base_url: String,
    calendar_id: String,
    page_size: u32,
}

impl GoogleCalendarClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: CALENDAR_API_BASE.to_string(),
            calendar_id: "primary".to_string(),
            page_size: 250,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_calendar_id(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = calendar_id.into();
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, 2500);
        self
    }

    async fn fetch_page(
        &self,
        token: &str,
        window: TimeWindow,
        page_token: Option<&str>,
    ) -> Result<EventPage, FetchError> {
        let url = format!(
            "{}/calendars/{}/events",
            self.base_url,
            urlencoding::encode(&self.calendar_id)
        );
        let (time_min, time_max) = window.query_bounds();

        let mut request = self.http.get(&url).bearer_auth(token).query(&[
            ("timeMin", time_min),
            ("timeMax", time_max),
            ("singleEvents", "true".to_string()),
            ("orderBy", "startTime".to_string()),
            ("maxResults", self.page_size.to_string()),
        ]);
        if let Some(page_token) = page_token {
            request = request.query(&[("pageToken", page_token)]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Network("request timed out".to_string())
            } else {
                FetchError::Network(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(FetchError::Unauthorized);
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }

        let page: EventPage = serde_json::from_str(&body)
            .map_err(|e| FetchError::Network(format!("failed to parse event list: {e}")))?;
        debug!(items = page.items.len(), more = page.next_page_token.is_some(), "fetched event page");
        Ok(page)
    }
}

fn classify_failure(status: reqwest::StatusCode, body: &str) -> FetchError {
    let detail = format!("calendar API returned {status}");
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || body.to_ascii_lowercase().contains("quota") {
        FetchError::Quota(detail)
    } else {
        FetchError::Network(detail)
    }
}

impl CalendarApi for GoogleCalendarClient {
    fn list_events_page<'a>(
        &'a self,
        token: &'a str,
        window: TimeWindow,
        page_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<EventPage, FetchError>> {
        Box::pin(self.fetch_page(token, window, page_token))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEvent {
    id: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    start: Option<ApiEventTime>,
    end: Option<ApiEventTime>,
    status: Option<String>,
    recurring_event_id: Option<String>,
    hangout_link: Option<String>,
    #[serde(default)]
    attendees: Vec<ApiAttendee>,
    conference_data: Option<ApiConferenceData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEventTime {
    date: Option<String>,
    date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiAttendee {
    email: Option<String>,
    #[serde(rename = "self", default)]
    is_self: bool,
    response_status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiConferenceData {
    #[serde(default)]
    entry_points: Vec<ApiEntryPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEntryPoint {
    entry_point_type: String,
    uri: Option<String>,
}

fn parse_time(time: &ApiEventTime, which: &str) -> Result<DateTime<Utc>, String> {
    let raw = time
        .date_time
        .as_deref()
        .ok_or_else(|| format!("{which} has no dateTime"))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("unparseable {which} {raw:?}: {e}"))
}

impl ApiEvent {
    /// Join link by precedence: conference entry point, Meet link, then any
    /// conference URL found in the location or description.
    fn conference_link(&self) -> Option<String> {
        let entry_point = self.conference_data.as_ref().and_then(|cd| {
            cd.entry_points
                .iter()
                .filter(|ep| ep.entry_point_type == "video")
                .find_map(|ep| ep.uri.as_deref())
        });
        if let Some(uri) = entry_point.or(self.hangout_link.as_deref()) {
            return Some(detect_link(uri).url);
        }

        let texts: Vec<&str> = [self.location.as_deref(), self.description.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        find_video_link(&texts).map(|link| link.url)
    }
}

/// Converts one raw `events.list` item.
///
/// `Ok(None)` means the item is legitimately ineligible (cancelled or
/// all-day); `Err` means it is malformed.
pub fn parse_event(item: &Value) -> Result<Option<CalendarEvent>, String> {
    let event: ApiEvent = serde_json::from_value(item.clone()).map_err(|e| e.to_string())?;

    if event.status.as_deref() == Some("cancelled") {
        return Ok(None);
    }
    let id = event
        .id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or("event has no id")?;
    let start = event.start.as_ref().ok_or("event has no start")?;
    if start.date_time.is_none() && start.date.is_some() {
        return Ok(None);
    }
    let start_time = parse_time(start, "start")?;
    let end_time = match &event.end {
        Some(end) => parse_time(end, "end")?,
        None => return Err("event has no end".to_string()),
    };

    let mut parsed = CalendarEvent::new(
        id,
        event.summary.clone().unwrap_or_default(),
        start_time,
        end_time,
    );
    parsed.conference_link = event.conference_link();
    parsed.recurring_series_id = event.recurring_event_id;
    parsed.location = event.location;
    parsed.description = event.description;
    parsed.attendees = event
        .attendees
        .into_iter()
        .filter_map(|a| {
            let status = a
                .response_status
                .as_deref()
                .map(ResponseStatus::from_api)
                .unwrap_or_default();
            let attendee = Attendee::new(a.email?, status);
            Some(if a.is_self { attendee.myself() } else { attendee })
        })
        .collect();

    Ok(Some(parsed))
}
