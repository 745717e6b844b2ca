//! Auto-advance timer
//!
//! Forces a level step after a period with no published change, so a session
//! never sits on one level indefinitely. Engaged sessions (headset worn) use
//! the shorter timeout.

use crate::shutdown::{spawn_periodic, ShutdownListener};
use crate::state::StateMachine;
use crate::types::{ConductorConfig, MeditationLevel, MAX_TIMEOUT_SECS};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvancePolicy {
    pub worn_after: chrono::Duration,
    pub idle_after: chrono::Duration,
}

impl AdvancePolicy {
    pub fn timeout(&self, headset_worn: bool) -> chrono::Duration {
        if headset_worn {
            self.worn_after
        } else {
            self.idle_after
        }
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    // Saturate; `ConductorConfig::validate` rejects anything above the cap.
    chrono::Duration::seconds(secs.min(MAX_TIMEOUT_SECS) as i64)
}

impl From<&ConductorConfig> for AdvancePolicy {
    fn from(config: &ConductorConfig) -> Self {
        Self {
            worn_after: seconds(config.auto_advance_worn_secs),
            idle_after: seconds(config.auto_advance_idle_secs),
        }
    }
}

impl Default for AdvancePolicy {
    fn default() -> Self {
        Self::from(&ConductorConfig::default())
    }
}

pub struct AutoAdvance {
    machine: StateMachine,
    policy: AdvancePolicy,
}

impl AutoAdvance {
    pub fn new(machine: StateMachine, policy: AdvancePolicy) -> Self {
        Self { machine, policy }
    }

    pub fn tick(&self, now: DateTime<Utc>) -> Option<MeditationLevel> {
        let worn = self.machine.state().headset_worn();
        self.machine.advance_if_idle(self.policy.timeout(worn), now)
    }

    pub fn spawn(self, period: Duration, shutdown: ShutdownListener) -> JoinHandle<()> {
        spawn_periodic("auto-advance", period, shutdown, move || {
            self.tick(Utc::now());
        })
    }
}
