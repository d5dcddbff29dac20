//! Core types: events, links, recurrence collapse, store and timer contracts.

use std::future::Future;
use std::pin::Pin;

pub mod collapse;
pub mod event;
pub mod links;
pub mod settings;
pub mod store;
pub mod time;
pub mod timer;
pub mod tracing;

/// Boxed future used by the object-safe async collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use collapse::collapse;
pub use event::{Attendee, CalendarEvent, EventLink, LinkKind, ResponseStatus};
pub use links::{LinkDetector, detect_link, find_video_link};
pub use settings::Settings;
pub use store::{KeyValueStore, MemoryStore, StoreError, StoreResult};
pub use time::{Clock, ManualClock, TimeWindow, system_clock};
pub use timer::{
    AlarmSpec, AlarmTable, MemoryTimerService, POLL_ALARM, ScheduledAlarm, TOKEN_REFRESH_ALARM,
    TimerError, TimerResult, TimerService, Wake, meeting_alarm_name,
};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
