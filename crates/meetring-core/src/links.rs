//! Join-link detection for calendar events.
//!
//! Calendar entries carry their conference link in several places (structured
//! conference data, the location line, free-form HTML descriptions). This
//! module finds URLs in those texts, unwraps Outlook SafeLinks, classifies
//! the conferencing service and normalizes the URL.
//!
//! ```
//! use meetring_core::links::find_video_link;
//!
//! let link = find_video_link(&["Room 4", "Join https://zoom.us/j/123456789?pwd=abc"]);
//! assert_eq!(link.unwrap().url, "https://zoom.us/j/123456789?pwd=abc");
//! ```

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::event::{EventLink, LinkKind};

fn pattern(re: &str) -> Regex {
    Regex::new(re).unwrap_or_else(|e| panic!("invalid link pattern {re}: {e}"))
}

static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| pattern(r#"https?://[^\s<>"'\)\]]+"#));

/// SafeLinks carry the original URL in the `url` query parameter.
static SAFELINK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"https?://[^/]*safelinks\.protection\.outlook\.com/?\?[^?]*url=([^&]+)")
});

/// Service table, checked in order. ZoomGov precedes Zoom.
static SERVICES: LazyLock<Vec<(LinkKind, Regex)>> = LazyLock::new(|| {
    vec![
        (LinkKind::ZoomGov, pattern(r"^https?://([^/]*\.)?zoomgov\.com/")),
        (LinkKind::Zoom, pattern(r"^https?://([^/]*\.)?zoom\.us/")),
        (LinkKind::GoogleMeet, pattern(r"^https?://meet\.google\.com/")),
        (
            LinkKind::Teams,
            pattern(r"^https?://teams\.(microsoft\.com|live\.com)/"),
        ),
        (LinkKind::Jitsi, pattern(r"^https?://meet\.jit\.si/")),
        (LinkKind::Webex, pattern(r"^https?://([^/]*\.)?webex\.com/")),
        (LinkKind::Whereby, pattern(r"^https?://whereby\.com/")),
        (LinkKind::Chime, pattern(r"^https?://chime\.aws/")),
    ]
});

/// Stateless link detector.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkDetector;

impl LinkDetector {
    pub fn new() -> Self {
        Self
    }

    /// Returns the raw URLs in `text`, in order of appearance.
    pub fn extract_urls(&self, text: &str) -> Vec<String> {
        URL_REGEX
            .find_iter(text)
            .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string())
            .collect()
    }

    /// Classifies and normalizes a single URL.
    pub fn detect(&self, url: &str) -> EventLink {
        let unwrapped = unwrap_safelink(url);
        let kind = SERVICES
            .iter()
            .find(|(_, re)| re.is_match(&unwrapped))
            .map(|(kind, _)| *kind)
            .unwrap_or(LinkKind::Other);

        match kind {
            LinkKind::Zoom | LinkKind::ZoomGov => normalize_zoom(&unwrapped, kind),
            LinkKind::GoogleMeet => first_segment(&unwrapped, kind, "https://meet.google.com"),
            LinkKind::Jitsi => first_segment(&unwrapped, kind, "https://meet.jit.si"),
            // Teams and Webex links carry signed tokens in the query; keep them whole.
            _ => EventLink::new(kind, unwrapped.trim()),
        }
    }

    /// All links in `text`, deduplicated by normalized URL, conference links first.
    pub fn extract_from_text(&self, text: &str) -> Vec<EventLink> {
        let mut seen = HashSet::new();
        let mut links: Vec<EventLink> = self
            .extract_urls(text)
            .iter()
            .map(|url| self.detect(url))
            .filter(|link| seen.insert(link.url.clone()))
            .collect();
        links.sort_by_key(|l| !l.kind.is_video_conference());
        links
    }

    /// The first conference link across `texts`, searched in the given order.
    pub fn find_video_link(&self, texts: &[&str]) -> Option<EventLink> {
        texts.iter().find_map(|text| {
            self.extract_from_text(text)
                .into_iter()
                .find(|l| l.kind.is_video_conference())
        })
    }
}

pub fn detect_link(url: &str) -> EventLink {
    LinkDetector::new().detect(url)
}

pub fn find_video_link(texts: &[&str]) -> Option<EventLink> {
    LinkDetector::new().find_video_link(texts)
}

fn unwrap_safelink(url: &str) -> String {
    SAFELINK_REGEX
        .captures(url)
        .and_then(|caps| caps.get(1))
        .and_then(|encoded| urlencoding::decode(encoded.as_str()).ok())
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|| url.to_string())
}

/// Rebuilds Zoom links as `https://<host>/j/<id>[?pwd=<passcode>]`.
fn normalize_zoom(url: &str, kind: LinkKind) -> EventLink {
    let Ok(parsed) = Url::parse(url) else {
        return EventLink::new(kind, url);
    };

    let mut meeting_id = None;
    let mut passcode = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "pwd" | "passcode" => passcode = Some(value.into_owned()),
            "confno" => meeting_id = Some(value.into_owned()),
            _ => {}
        }
    }

    let segments: Vec<&str> = parsed.path().split('/').filter(|s| !s.is_empty()).collect();
    if meeting_id.is_none()
        && let [prefix, id, ..] = segments.as_slice()
        && matches!(*prefix, "j" | "my" | "w" | "wc")
    {
        meeting_id = Some((*id).to_string());
    }

    let host = if kind == LinkKind::ZoomGov { "zoomgov.com" } else { "zoom.us" };
    let normalized = match (&meeting_id, &passcode) {
        (Some(id), Some(pwd)) => format!("https://{host}/j/{id}?pwd={pwd}"),
        (Some(id), None) => format!("https://{host}/j/{id}"),
        (None, _) => url.to_string(),
    };

    EventLink::new(kind, normalized)
        .with_meeting_id(meeting_id)
        .with_passcode(passcode)
}

/// Services addressed by a single path segment (`/<room>`); the query is dropped.
fn first_segment(url: &str, kind: LinkKind, base: &str) -> EventLink {
    let Ok(parsed) = Url::parse(url) else {
        return EventLink::new(kind, url);
    };
    let Some(id) = parsed.path().split('/').find(|s| !s.is_empty()) else {
        return EventLink::new(kind, url);
    };
    EventLink::new(kind, format!("{base}/{id}")).with_meeting_id(Some(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod safelinks {
        use super::*;

        #[test]
        fn unwraps_safelink() {
            let safelink = "https://nam01.safelinks.protection.outlook.com/?url=https%3A%2F%2Fzoom.us%2Fj%2F123456789&data=abc123";
            assert_eq!(unwrap_safelink(safelink), "https://zoom.us/j/123456789");
        }

        #[test]
        fn leaves_plain_urls_alone() {
            let url = "https://zoom.us/j/123456789";
            assert_eq!(unwrap_safelink(url), url);
        }
    }

    mod zoom {
        use super::*;

        #[test]
        fn keeps_passcode_and_drops_tracking() {
            let link = detect_link("https://zoom.us/j/123?pwd=abc&utm_source=email");
            assert_eq!(link.kind, LinkKind::Zoom);
            assert_eq!(link.url, "https://zoom.us/j/123?pwd=abc");
            assert_eq!(link.meeting_id.as_deref(), Some("123"));
            assert_eq!(link.passcode.as_deref(), Some("abc"));
        }

        #[test]
        fn join_form_and_subdomain() {
            let link = detect_link("https://acme.zoom.us/join?confno=987654321");
            assert_eq!(link.url, "https://zoom.us/j/987654321");
        }

        #[test]
        fn zoomgov_is_not_plain_zoom() {
            let link = detect_link("https://agency.zoomgov.com/j/42");
            assert_eq!(link.kind, LinkKind::ZoomGov);
            assert_eq!(link.url, "https://zoomgov.com/j/42");
        }
    }

    mod services {
        use super::*;

        #[test]
        fn meet_query_is_stripped() {
            let link = detect_link("https://meet.google.com/abc-defg-hij?authuser=0");
            assert_eq!(link.kind, LinkKind::GoogleMeet);
            assert_eq!(link.url, "https://meet.google.com/abc-defg-hij");
        }

        #[test]
        fn teams_is_kept_intact() {
            let url = "https://teams.microsoft.com/l/meetup-join/19%3ameeting_abc@thread.v2/0?context=x";
            let link = detect_link(url);
            assert_eq!(link.kind, LinkKind::Teams);
            assert_eq!(link.url, url);
        }

        #[test]
        fn webex_and_jitsi() {
            assert_eq!(detect_link("https://acme.webex.com/meet/pr123").kind, LinkKind::Webex);
            let jitsi = detect_link("https://meet.jit.si/Room?config.x=1");
            assert_eq!(jitsi.url, "https://meet.jit.si/Room");
        }

        #[test]
        fn unknown_host_is_other() {
            assert_eq!(detect_link("https://docs.example.com/d/1").kind, LinkKind::Other);
            assert_eq!(detect_link("not-a-url").url, "not-a-url");
        }
    }

    mod find_video_link {
        use super::*;

        #[test]
        fn skips_non_conference_urls() {
            let text = "Agenda: https://docs.example.com/x then https://meet.google.com/abc-defg-hij";
            let link = super::super::find_video_link(&[text]).unwrap();
            assert_eq!(link.kind, LinkKind::GoogleMeet);
        }

        #[test]
        fn earlier_text_wins() {
            let link = super::super::find_video_link(&[
                "https://zoom.us/j/1",
                "https://meet.google.com/abc-defg-hij",
            ])
            .unwrap();
            assert_eq!(link.kind, LinkKind::Zoom);
        }

        #[test]
        fn html_description() {
            let text = r#"<p>Join: <a href="https://teams.live.com/meet/abc">here</a></p>"#;
            let link = super::super::find_video_link(&["", text]).unwrap();
            assert_eq!(link.kind, LinkKind::Teams);
            assert_eq!(link.url, "https://teams.live.com/meet/abc");
        }

        #[test]
        fn trailing_punctuation_is_trimmed() {
            let link = super::super::find_video_link(&["Call: https://meet.jit.si/Standup."]).unwrap();
            assert_eq!(link.url, "https://meet.jit.si/Standup");
        }

        #[test]
        fn none_without_conference_link() {
            assert!(super::super::find_video_link(&["Room 4", "https://example.com"]).is_none());
            assert!(super::super::find_video_link(&[]).is_none());
        }
    }

    #[test]
    fn extract_dedups_and_orders() {
        let text = "https://example.com/a https://zoom.us/j/1 https://zoom.us/j/1";
        let links = LinkDetector::new().extract_from_text(text);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].kind, LinkKind::Zoom);
    }
}
