//! Session and status commands.

use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use meetring_protocol::{AuthStatus, Request, Response, StatusUpdate};

use crate::error::{ClientError, ClientResult};
use crate::socket::SocketClient;

/// Consent happens in the browser; the daemon waits up to five minutes for it.
const SIGN_IN_TIMEOUT: Duration = Duration::from_secs(330);

pub async fn sign_in(client: &SocketClient) -> ClientResult<()> {
    println!("Complete the sign-in in your browser...");
    match client.with_timeout(SIGN_IN_TIMEOUT).send(Request::SignIn).await? {
        Response::Auth { status } => {
            println!("{}", render_auth(&status));
            Ok(())
        }
        other => Err(unexpected(&other)),
    }
}

pub async fn sign_out(client: &SocketClient) -> ClientResult<()> {
    match client.send(Request::SignOut).await? {
        Response::Ok => {
            println!("Signed out.");
            Ok(())
        }
        other => Err(unexpected(&other)),
    }
}

pub async fn status(client: &SocketClient, json: bool) -> ClientResult<()> {
    let status = match client.send(Request::GetStatusUpdate).await? {
        Response::Status { status } => status,
        other => return Err(unexpected(&other)),
    };
    if json {
        let rendered = serde_json::to_string_pretty(&status)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        println!("{}", rendered);
    } else {
        print!("{}", render_status(&status, Utc::now()));
    }
    Ok(())
}

pub(crate) fn unexpected(response: &Response) -> ClientError {
    ClientError::UnexpectedResponse(format!("{response:?}"))
}

fn local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

pub fn render_auth(status: &AuthStatus) -> String {
    match (status.signed_in, status.expires_at) {
        (true, Some(expires)) => format!("Signed in (token valid until {}).", local(expires)),
        (true, None) => "Signed in.".to_string(),
        (false, _) if status.authenticating => "Sign-in in progress.".to_string(),
        (false, _) => "Not signed in; run `meetring sign-in`.".to_string(),
    }
}

pub fn render_status(status: &StatusUpdate, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    out.push_str(&format!("auth:      {}\n", render_auth(&status.auth)));
    out.push_str(&format!(
        "last poll: {}\n",
        status.last_poll.map(local).unwrap_or_else(|| "never".to_string())
    ));
    if let Some(error) = &status.last_error {
        out.push_str(&format!("error:     {}\n", error));
    }
    for warning in &status.warnings {
        out.push_str(&format!("warning:   {}\n", warning));
    }
    out.push_str(&format!("upcoming:  {}\n", status.upcoming_count));
    if let Some(next) = &status.next_meeting {
        let minutes = next.minutes_until_start(now);
        let when = if minutes > 0 {
            format!("in {minutes} min")
        } else {
            "now".to_string()
        };
        out.push_str(&format!("next:      {} ({})\n", next.title, when));
    }
    out.push_str(&format!("uptime:    {}s\n", status.uptime_seconds));
    out
}
