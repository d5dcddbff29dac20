//! Arms one durable alarm per meeting that is about to start.
//!
//! Per event id the state moves from unscheduled to scheduled to fired. An
//! event whose fire time is already past goes straight to fired. A meeting
//! that moves has its alarm re-armed for the new start, or cleared when it
//! left the lead window; fired is final.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use meetring_core::{AlarmSpec, CalendarEvent, TimerService, meeting_alarm_name};
use tracing::{debug, info};

use crate::dedup::DedupTracker;
use crate::dispatcher::{DispatchOutcome, NotificationDispatcher};
use crate::error::ServerResult;

#[derive(Debug, Clone)]
pub struct AlarmConfig {
    /// How long before start the alarm fires.
    pub lead_offset: Duration,
    /// Events that started longer ago than this never ring.
    pub max_late: Duration,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            lead_offset: Duration::seconds(30),
            max_late: Duration::minutes(5),
        }
    }
}

impl AlarmConfig {
    pub fn with_lead_offset(mut self, offset: Duration) -> Self {
        self.lead_offset = offset;
        self
    }

    pub fn with_max_late(mut self, max_late: Duration) -> Self {
        self.max_late = max_late;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmDecision {
    AlreadyProcessed,
    /// Starts further out than the lead threshold; the next poll looks again.
    /// Any alarm armed for an earlier start time is cleared.
    TooEarly,
    /// Started more than `max_late` ago.
    Expired,
    AlreadyScheduled,
    Scheduled { fire_at: DateTime<Utc> },
    /// The start time changed since the alarm was armed.
    Rescheduled { fire_at: DateTime<Utc> },
    DispatchedImmediately(DispatchOutcome),
}

pub struct AlarmScheduler {
    timers: Arc<dyn TimerService>,
    dedup: Arc<DedupTracker>,
    dispatcher: Arc<NotificationDispatcher>,
    config: AlarmConfig,
}

impl AlarmScheduler {
    pub fn new(
        timers: Arc<dyn TimerService>,
        dedup: Arc<DedupTracker>,
        dispatcher: Arc<NotificationDispatcher>,
        config: AlarmConfig,
    ) -> Self {
        Self {
            timers,
            dedup,
            dispatcher,
            config,
        }
    }

    /// Makes sure `event` will alert, given the user's lead threshold `lead`.
    ///
    /// Idempotent: calling it again for the same event never adds a second
    /// alarm or a second alert.
    pub async fn ensure_alarm(
        &self,
        event: &CalendarEvent,
        lead: Duration,
        now: DateTime<Utc>,
    ) -> ServerResult<AlarmDecision> {
        if self.dedup.is_processed(&event.id).await? {
            return Ok(AlarmDecision::AlreadyProcessed);
        }

        let name = meeting_alarm_name(&event.id);
        let until_start = event.start_time - now;
        if until_start > lead {
            if self.timers.clear(&name).await? {
                info!(event_id = %event.id, "meeting moved out of the lead window; alarm cleared");
            }
            return Ok(AlarmDecision::TooEarly);
        }
        if -until_start > self.config.max_late {
            debug!(event_id = %event.id, "meeting started too long ago");
            self.timers.clear(&name).await?;
            return Ok(AlarmDecision::Expired);
        }

        let fire_at = event.start_time - self.config.lead_offset;
        let existing = self.timers.get(&name).await?;
        if existing.as_ref().is_some_and(|alarm| alarm.fire_at == fire_at) {
            return Ok(AlarmDecision::AlreadyScheduled);
        }

        if fire_at <= now {
            if existing.is_some() {
                self.timers.clear(&name).await?;
            }
            info!(event_id = %event.id, "fire time already passed; dispatching now");
            let outcome = self.dispatcher.dispatch(&event.id).await?;
            return Ok(AlarmDecision::DispatchedImmediately(outcome));
        }

        self.timers.create(&name, AlarmSpec::At(fire_at)).await?;
        match existing {
            Some(old) => {
                info!(event_id = %event.id, from = %old.fire_at, to = %fire_at, "meeting alarm re-armed");
                Ok(AlarmDecision::Rescheduled { fire_at })
            }
            None => {
                info!(event_id = %event.id, %fire_at, "meeting alarm scheduled");
                Ok(AlarmDecision::Scheduled { fire_at })
            }
        }
    }
}
