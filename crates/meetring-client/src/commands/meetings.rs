//! Meeting listing commands.

use chrono::{DateTime, Local, Utc};
use meetring_core::CalendarEvent;
use meetring_protocol::{Request, Response};

use crate::commands::session::unexpected;
use crate::error::{ClientError, ClientResult};
use crate::socket::SocketClient;

/// Prints the daemon's snapshot without fetching.
pub async fn list(client: &SocketClient, json: bool) -> ClientResult<()> {
    print_meetings(client.send(Request::GetUpcomingMeetings).await?, json)
}

/// Runs a poll cycle on the daemon, then prints the result.
pub async fn refresh(client: &SocketClient, json: bool) -> ClientResult<()> {
    print_meetings(client.send(Request::RefreshMeetings).await?, json)
}

fn print_meetings(response: Response, json: bool) -> ClientResult<()> {
    let Response::Meetings { meetings, warnings } = response else {
        return Err(unexpected(&response));
    };
    if json {
        let rendered = serde_json::to_string_pretty(&meetings)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        println!("{}", rendered);
    } else {
        print!("{}", render_meetings(&meetings, Utc::now()));
    }
    for warning in warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}

pub fn render_meetings(meetings: &[CalendarEvent], now: DateTime<Utc>) -> String {
    if meetings.is_empty() {
        return "No upcoming meetings.\n".to_string();
    }
    let mut sorted: Vec<&CalendarEvent> = meetings.iter().collect();
    sorted.sort_by_key(|m| m.start_time);

    let mut out = String::new();
    for meeting in sorted {
        let start = meeting.start_time.with_timezone(&Local).format("%H:%M");
        let end = meeting.end_time.with_timezone(&Local).format("%H:%M");
        let marker = if meeting.start_time <= now && now < meeting.end_time {
            "*"
        } else {
            " "
        };
        out.push_str(&format!("{marker} {start}-{end}  {}", meeting.title));
        if let Some(link) = &meeting.conference_link {
            out.push_str(&format!("  {link}"));
        }
        out.push('\n');
    }
    out
}
