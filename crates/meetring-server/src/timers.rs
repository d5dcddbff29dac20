//! Durable [`TimerService`] backed by the store, plus the task that fires it.
//!
//! Alarms live under `scheduled_alarms`, so a daemon that was stopped while
//! an alarm came due fires it as soon as the driver starts again.

use std::sync::Arc;
use std::time::Duration;

use meetring_core::store::{self, keys};
use meetring_core::{
    AlarmSpec, AlarmTable, BoxFuture, Clock, KeyValueStore, ScheduledAlarm, TimerResult,
    TimerService,
};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::signals::ShutdownSignal;

/// Upper bound on one driver sleep so wall-clock jumps (suspend, NTP) are noticed.
const MAX_SLEEP: Duration = Duration::from_secs(60);

pub struct LocalTimerService {
    store: Arc<dyn KeyValueStore>,
    table: Mutex<AlarmTable>,
    changed: Notify,
    clock: Clock,
}

impl LocalTimerService {
    /// Loads the persisted alarm table.
    pub async fn load(store: Arc<dyn KeyValueStore>, clock: Clock) -> TimerResult<Arc<Self>> {
        let table: AlarmTable = store::read(store.as_ref(), keys::SCHEDULED_ALARMS)
            .await?
            .unwrap_or_default();
        if !table.is_empty() {
            info!(alarms = table.len(), "restored scheduled alarms");
        }
        Ok(Arc::new(Self {
            store,
            table: Mutex::new(table),
            changed: Notify::new(),
            clock,
        }))
    }

    async fn persist(&self, table: &AlarmTable) -> TimerResult<()> {
        store::write(self.store.as_ref(), keys::SCHEDULED_ALARMS, table).await?;
        Ok(())
    }

    pub async fn alarms(&self) -> AlarmTable {
        self.table.lock().await.clone()
    }

    /// Removes and returns every alarm due at the current clock time.
    ///
    /// The names are returned even when the updated table cannot be saved; a
    /// restart may then fire them a second time.
    pub async fn take_due(&self) -> Vec<String> {
        let now = (self.clock)();
        let mut table = self.table.lock().await;
        let fired = table.take_due(now);
        if !fired.is_empty()
            && let Err(e) = self.persist(&table).await
        {
            warn!(error = %e, fired = fired.len(), "could not persist fired alarms; delivering anyway");
        }
        fired
    }

    async fn next_sleep(&self) -> Option<Duration> {
        let next = self.table.lock().await.next_due()?;
        let wait = (next - (self.clock)()).to_std().unwrap_or(Duration::ZERO);
        Some(wait.min(MAX_SLEEP))
    }

    /// Spawns the task that delivers fired alarm names to `fired`.
    ///
    /// Stops on shutdown or when the receiver is dropped.
    pub fn spawn_driver(
        self: &Arc<Self>,
        fired: mpsc::Sender<String>,
        shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let timers = Arc::clone(self);
        tokio::spawn(async move {
            let shutdown = shutdown.wait();
            tokio::pin!(shutdown);

            loop {
                for name in timers.take_due().await {
                    debug!(alarm = %name, "alarm fired");
                    if fired.send(name).await.is_err() {
                        return;
                    }
                }

                let sleep = timers.next_sleep().await;
                tokio::select! {
                    _ = &mut shutdown => {
                        debug!("timer driver stopped");
                        return;
                    }
                    _ = timers.changed.notified() => {}
                    _ = async {
                        match sleep {
                            Some(wait) => tokio::time::sleep(wait).await,
                            None => std::future::pending().await,
                        }
                    } => {}
                }
            }
        })
    }
}

impl TimerService for LocalTimerService {
    fn create<'a>(
        &'a self,
        name: &'a str,
        spec: AlarmSpec,
    ) -> BoxFuture<'a, TimerResult<ScheduledAlarm>> {
        Box::pin(async move {
            let alarm = ScheduledAlarm::from_spec(name, spec)?;
            {
                let mut table = self.table.lock().await;
                table.insert(alarm.clone());
                self.persist(&table).await?;
            }
            debug!(alarm = %name, fire_at = %alarm.fire_at, "alarm created");
            self.changed.notify_one();
            Ok(alarm)
        })
    }

    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, TimerResult<Option<ScheduledAlarm>>> {
        Box::pin(async move { Ok(self.table.lock().await.get(name).cloned()) })
    }

    fn clear<'a>(&'a self, name: &'a str) -> BoxFuture<'a, TimerResult<bool>> {
        Box::pin(async move {
            let mut table = self.table.lock().await;
            let removed = table.remove(name);
            if removed {
                self.persist(&table).await?;
                self.changed.notify_one();
            }
            Ok(removed)
        })
    }
}
