//! User preferences persisted under the `settings` store key.
//!
//! The settings UI owns writes; the daemon only reads, once per poll cycle
//! and once per dispatch.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::store::{self, KeyValueStore, StoreResult, keys};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Minutes before start at which an alarm gets armed.
    pub notification_lead_minutes: u32,
    /// Open the conference link directly instead of the popup.
    pub auto_join: bool,
    pub alert_sound: String,
    pub first_run: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            notification_lead_minutes: 5,
            auto_join: false,
            alert_sound: "default".to_string(),
            first_run: true,
        }
    }
}

impl Settings {
    pub fn lead(&self) -> Duration {
        Duration::minutes(i64::from(self.notification_lead_minutes))
    }

    /// Reads settings, falling back to defaults when the key is absent or unreadable.
    pub async fn load(store: &dyn KeyValueStore) -> StoreResult<Self> {
        match store::read::<Settings>(store, keys::SETTINGS).await {
            Ok(settings) => Ok(settings.unwrap_or_default()),
            Err(store::StoreError::Corrupt { reason, .. }) => {
                tracing::warn!(%reason, "ignoring unreadable settings");
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }
}
