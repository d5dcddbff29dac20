//! Scheduled-wake timer contract.
//!
//! Alarms are named and durable. Creating an alarm under an existing name
//! replaces it. When an alarm fires, its name is delivered to the engine,
//! which maps it back to a [`Wake`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::BoxFuture;
use crate::store::StoreError;

/// Name of the periodic calendar poll alarm.
pub const POLL_ALARM: &str = "calendar_poll";
/// Name of the refresh-ahead alarm for the OAuth token.
pub const TOKEN_REFRESH_ALARM: &str = "token_refresh";
const MEETING_PREFIX: &str = "meeting_";

/// Deterministic alarm name for a calendar event.
pub fn meeting_alarm_name(event_id: &str) -> String {
    format!("{MEETING_PREFIX}{event_id}")
}

pub type TimerResult<T> = Result<T, TimerError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("alarm period must be positive, got {0}s")]
    InvalidPeriod(i64),
}

/// When an alarm should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmSpec {
    At(DateTime<Utc>),
    /// Fires at `first`, then every `period`.
    Every {
        period: Duration,
        first: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAlarm {
    pub name: String,
    pub fire_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_secs: Option<i64>,
}

impl ScheduledAlarm {
    pub fn from_spec(name: impl Into<String>, spec: AlarmSpec) -> TimerResult<Self> {
        let name = name.into();
        match spec {
            AlarmSpec::At(fire_at) => Ok(Self {
                name,
                fire_at,
                period_secs: None,
            }),
            AlarmSpec::Every { period, first } => {
                let secs = period.num_seconds();
                if secs <= 0 {
                    return Err(TimerError::InvalidPeriod(secs));
                }
                Ok(Self {
                    name,
                    fire_at: first,
                    period_secs: Some(secs),
                })
            }
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fire_at <= now
    }
}

/// In-process alarm bookkeeping shared by the timer implementations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmTable {
    alarms: BTreeMap<String, ScheduledAlarm>,
}

impl AlarmTable {
    pub fn insert(&mut self, alarm: ScheduledAlarm) {
        self.alarms.insert(alarm.name.clone(), alarm);
    }

    pub fn get(&self, name: &str) -> Option<&ScheduledAlarm> {
        self.alarms.get(name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.alarms.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    /// Earliest pending fire time.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.alarms.values().map(|a| a.fire_at).min()
    }

    /// Removes one-shot alarms that are due and advances periodic ones past
    /// `now`. Returns the fired names, earliest first.
    ///
    /// A periodic alarm that missed several periods fires once.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .alarms
            .values()
            .filter(|a| a.is_due(now))
            .map(|a| (a.fire_at, a.name.clone()))
            .collect();
        due.sort();

        for (_, name) in &due {
            let Some(alarm) = self.alarms.get_mut(name) else {
                continue;
            };
            match alarm.period_secs {
                Some(secs) => {
                    let period = Duration::seconds(secs);
                    let missed = (now - alarm.fire_at).num_seconds() / secs + 1;
                    alarm.fire_at += period * missed as i32;
                }
                None => {
                    self.alarms.remove(name);
                }
            }
        }
        due.into_iter().map(|(_, name)| name).collect()
    }
}

/// Platform timer service.
pub trait TimerService: Send + Sync {
    /// Registers `name`, replacing any existing alarm of that name.
    fn create<'a>(
        &'a self,
        name: &'a str,
        spec: AlarmSpec,
    ) -> BoxFuture<'a, TimerResult<ScheduledAlarm>>;

    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, TimerResult<Option<ScheduledAlarm>>>;

    /// Returns whether an alarm was removed.
    fn clear<'a>(&'a self, name: &'a str) -> BoxFuture<'a, TimerResult<bool>>;
}

/// What a fired alarm asks the engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wake {
    Poll,
    TokenRefresh,
    Meeting(String),
    Unknown(String),
}

impl Wake {
    pub fn parse(name: &str) -> Self {
        match name {
            POLL_ALARM => Self::Poll,
            TOKEN_REFRESH_ALARM => Self::TokenRefresh,
            other => match other.strip_prefix(MEETING_PREFIX) {
                Some(id) if !id.is_empty() => Self::Meeting(id.to_string()),
                _ => Self::Unknown(other.to_string()),
            },
        }
    }
}

/// Timer service that only records alarms; tests fire them by hand.
#[derive(Debug, Clone, Default)]
pub struct MemoryTimerService {
    table: Arc<Mutex<AlarmTable>>,
}

impl MemoryTimerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alarms(&self) -> AlarmTable {
        self.table.lock().await.clone()
    }

    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<String> {
        self.table.lock().await.take_due(now)
    }
}

impl TimerService for MemoryTimerService {
    fn create<'a>(
        &'a self,
        name: &'a str,
        spec: AlarmSpec,
    ) -> BoxFuture<'a, TimerResult<ScheduledAlarm>> {
        Box::pin(async move {
            let alarm = ScheduledAlarm::from_spec(name, spec)?;
            self.table.lock().await.insert(alarm.clone());
            Ok(alarm)
        })
    }

    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, TimerResult<Option<ScheduledAlarm>>> {
        Box::pin(async move { Ok(self.table.lock().await.get(name).cloned()) })
    }

    fn clear<'a>(&'a self, name: &'a str) -> BoxFuture<'a, TimerResult<bool>> {
        Box::pin(async move { Ok(self.table.lock().await.remove(name)) })
    }
}
