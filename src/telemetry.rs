//! Periodic telemetry: publishes the raw vector with the current level stamped in.

use crate::bus::Publisher;
use crate::shutdown::{spawn_periodic, ShutdownListener};
use crate::state::SessionState;
use crate::types::TelemetryEvent;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct TelemetryEmitter {
    state: Arc<SessionState>,
    publisher: Arc<dyn Publisher>,
}

impl TelemetryEmitter {
    pub fn new(state: Arc<SessionState>, publisher: Arc<dyn Publisher>) -> Self {
        Self { state, publisher }
    }

    pub fn tick(&self, now: DateTime<Utc>) -> TelemetryEvent {
        let level = self.state.level();
        let event = TelemetryEvent {
            values: self.state.stamp_level(level),
            timestamp: now,
        };
        if let Err(e) = self.publisher.publish_telemetry(&event) {
            log::warn!("Failed to publish telemetry: {}", e);
        }
        event
    }

    pub fn spawn(self, period: Duration, shutdown: ShutdownListener) -> JoinHandle<()> {
        spawn_periodic("telemetry", period, shutdown, move || {
            self.tick(Utc::now());
        })
    }
}
