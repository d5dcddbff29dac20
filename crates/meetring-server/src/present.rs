//! Window and notification presentation.

use std::time::Duration;

use chrono::Local;
use meetring_core::{BoxFuture, CalendarEvent};
use notify_rust::Notification;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PresentError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationAction {
    pub id: String,
    pub label: String,
}

/// A system notification for one meeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertNotification {
    /// The event id.
    pub id: String,
    pub title: String,
    pub body: String,
    pub actions: Vec<NotificationAction>,
    /// Opened when the user picks the `join` action.
    pub join_url: Option<String>,
}

impl AlertNotification {
    pub const JOIN: &'static str = "join";
    pub const DISMISS: &'static str = "dismiss";

    pub fn for_event(event: &CalendarEvent) -> Self {
        let starts = event.start_time.with_timezone(&Local).format("%H:%M");
        let mut actions = Vec::new();
        if event.conference_link.is_some() {
            actions.push(NotificationAction {
                id: Self::JOIN.to_string(),
                label: "Join".to_string(),
            });
        }
        actions.push(NotificationAction {
            id: Self::DISMISS.to_string(),
            label: "Dismiss".to_string(),
        });
        Self {
            id: event.id.clone(),
            title: event.title.clone(),
            body: format!("Starts at {starts}"),
            actions,
            join_url: event.conference_link.clone(),
        }
    }
}

/// UI-facing collaborator the dispatcher alerts through.
pub trait Presenter: Send + Sync {
    /// Opens the ringing window, or the meeting itself.
    fn create_window<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), PresentError>>;

    fn create_notification<'a>(
        &'a self,
        notification: &'a AlertNotification,
    ) -> BoxFuture<'a, Result<(), PresentError>>;
}

/// Presents through the desktop: the default browser for windows and the
/// freedesktop / platform notification service for notifications.
#[derive(Debug, Clone)]
pub struct DesktopPresenter {
    app_name: String,
    timeout: Duration,
}

impl Default for DesktopPresenter {
    fn default() -> Self {
        Self {
            app_name: "meetring".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl DesktopPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Presenter for DesktopPresenter {
    fn create_window<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), PresentError>> {
        Box::pin(async move {
            let url = url.to_string();
            tokio::task::spawn_blocking(move || open::that(&url))
                .await
                .map_err(|e| PresentError(e.to_string()))?
                .map_err(|e| PresentError(format!("could not open window: {e}")))
        })
    }

    fn create_notification<'a>(
        &'a self,
        alert: &'a AlertNotification,
    ) -> BoxFuture<'a, Result<(), PresentError>> {
        Box::pin(async move {
            let mut notification = Notification::new();
            notification
                .appname(&self.app_name)
                .summary(&alert.title)
                .body(&alert.body)
                .timeout(self.timeout);
            for action in &alert.actions {
                notification.action(&action.id, &action.label);
            }
            #[cfg(target_os = "linux")]
            notification.urgency(notify_rust::Urgency::Critical);

            // The handle stays on the blocking thread; only the show result comes back.
            let (shown_tx, shown_rx) = tokio::sync::oneshot::channel();
            let join_url = alert.join_url.clone();
            tokio::task::spawn_blocking(move || match notification.show() {
                Ok(handle) => {
                    let _ = shown_tx.send(Ok(()));
                    wait_for_join(handle, join_url);
                }
                Err(e) => {
                    let _ = shown_tx.send(Err(PresentError(format!(
                        "could not show notification: {e}"
                    ))));
                }
            });
            shown_rx
                .await
                .map_err(|_| PresentError("notification task ended early".to_string()))??;
            info!(event_id = %alert.id, "notification shown");
            Ok(())
        })
    }
}

/// Blocks until the user acts on the notification; `join` opens the meeting.
#[cfg(target_os = "linux")]
fn wait_for_join(handle: notify_rust::NotificationHandle, join_url: Option<String>) {
    let Some(url) = join_url else {
        return;
    };
    handle.wait_for_action(|action| {
        debug!(action, "notification action");
        if action == AlertNotification::JOIN
            && let Err(e) = open::that(&url)
        {
            warn!(error = %e, "could not open meeting link");
        }
    });
}

#[cfg(not(target_os = "linux"))]
fn wait_for_join<H>(_handle: H, _join_url: Option<String>) {
    debug!("notification actions are not interactive on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn join_action_only_with_a_link() {
        let start = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();
        let plain = CalendarEvent::new("e1", "1:1", start, start + chrono::Duration::minutes(30));
        let alert = AlertNotification::for_event(&plain);
        let ids: Vec<&str> = alert.actions.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec![AlertNotification::DISMISS]);
        assert!(alert.body.starts_with("Starts at "));

        let linked = plain.with_conference_link("https://meet.google.com/abc-defg-hij");
        let alert = AlertNotification::for_event(&linked);
        let ids: Vec<&str> = alert.actions.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec![AlertNotification::JOIN, AlertNotification::DISMISS]);
        assert_eq!(alert.id, "e1");
        assert_eq!(alert.join_url.as_deref(), Some("https://meet.google.com/abc-defg-hij"));
    }
}
