//! Calendar event types.
//!
//! - [`CalendarEvent`]: one fetched occurrence, the unit the poll cycle works on
//! - [`Attendee`]: a guest entry with the user's own response marked by `is_self`
//! - [`EventLink`] / [`LinkKind`]: a detected video-conference join link

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The response status for an event attendee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Accepted,
    Declined,
    Tentative,
    NeedsAction,
    #[default]
    Unknown,
}

impl ResponseStatus {
    /// Parses the Google Calendar wire value (`needsAction`, `accepted`, ...).
    pub fn from_api(value: &str) -> Self {
        match value {
            "accepted" => Self::Accepted,
            "declined" => Self::Declined,
            "tentative" => Self::Tentative,
            "needsAction" => Self::NeedsAction,
            _ => Self::Unknown,
        }
    }
}

/// An event guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    pub address: String,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub response_status: ResponseStatus,
}

impl Attendee {
    pub fn new(address: impl Into<String>, response_status: ResponseStatus) -> Self {
        Self {
            address: address.into(),
            is_self: false,
            response_status,
        }
    }

    /// Marks this attendee as the signed-in user.
    pub fn myself(mut self) -> Self {
        self.is_self = true;
        self
    }
}

/// Video-conference services the link detector recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    GoogleMeet,
    Zoom,
    ZoomGov,
    Teams,
    Jitsi,
    Webex,
    Whereby,
    Chime,
    /// A URL that is not a known conferencing service.
    Other,
}

impl LinkKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::GoogleMeet => "Google Meet",
            Self::Zoom => "Zoom",
            Self::ZoomGov => "Zoom (Gov)",
            Self::Teams => "Microsoft Teams",
            Self::Jitsi => "Jitsi",
            Self::Webex => "Cisco Webex",
            Self::Whereby => "Whereby",
            Self::Chime => "Amazon Chime",
            Self::Other => "Link",
        }
    }

    pub fn is_video_conference(&self) -> bool {
        !matches!(self, Self::Other)
    }
}

/// A detected join link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLink {
    pub kind: LinkKind,
    /// Normalized URL (tracking parameters stripped where the service allows).
    pub url: String,
    pub meeting_id: Option<String>,
    pub passcode: Option<String>,
}

impl EventLink {
    pub fn new(kind: LinkKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            meeting_id: None,
            passcode: None,
        }
    }

    pub fn with_meeting_id(mut self, meeting_id: Option<String>) -> Self {
        self.meeting_id = meeting_id;
        self
    }

    pub fn with_passcode(mut self, passcode: Option<String>) -> Self {
        self.passcode = passcode;
        self
    }
}

/// A single fetched calendar occurrence.
///
/// `id` is unique per occurrence; all occurrences of a recurring series
/// share `recurring_series_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_series_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conference_link: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<Attendee>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CalendarEvent {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            recurring_series_id: None,
            start_time,
            end_time,
            title: title.into(),
            conference_link: None,
            attendees: Vec::new(),
            location: None,
            description: None,
        }
    }

    pub fn with_series(mut self, series_id: impl Into<String>) -> Self {
        self.recurring_series_id = Some(series_id.into());
        self
    }

    pub fn with_conference_link(mut self, url: impl Into<String>) -> Self {
        self.conference_link = Some(url.into());
        self
    }

    pub fn with_attendee(mut self, attendee: Attendee) -> Self {
        self.attendees.push(attendee);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The user's own response, if the user appears in the guest list.
    pub fn self_response(&self) -> Option<ResponseStatus> {
        self.attendees
            .iter()
            .find(|a| a.is_self)
            .map(|a| a.response_status)
    }

    /// True only when the user explicitly declined; no self entry counts as accepted.
    pub fn is_declined(&self) -> bool {
        self.self_response() == Some(ResponseStatus::Declined)
    }

    pub fn has_conference_link(&self) -> bool {
        self.conference_link.as_deref().is_some_and(|l| !l.is_empty())
    }

    /// Whole seconds until start; negative once the event has started.
    pub fn seconds_until_start(&self, now: DateTime<Utc>) -> i64 {
        (self.start_time - now).num_seconds()
    }

    pub fn minutes_until_start(&self, now: DateTime<Utc>) -> i64 {
        (self.start_time - now).num_minutes()
    }
}
