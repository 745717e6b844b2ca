//! Outbound bus adapters.
//!
//! The conductor only needs two fire-and-forget capabilities from its bus:
//! publishing a state change and publishing a telemetry vector. Delivery
//! failures are reported to the caller, which logs them and moves on.

use crate::error::PublishError;
use crate::types::{BusKind, ConductorConfig, StateEvent, TelemetryEvent};
use anyhow::{Context, Result};
use serde::Serialize;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const STATE_TOPIC: &str = "meditation";
pub const TELEMETRY_TOPIC: &str = "eegdata";

/// Outbound publish capability shared by every worker.
pub trait Publisher: Send + Sync {
    fn publish_state(&self, event: &StateEvent) -> Result<(), PublishError>;
    fn publish_telemetry(&self, event: &TelemetryEvent) -> Result<(), PublishError>;
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBus;

impl Publisher for LogBus {
    fn publish_state(&self, event: &StateEvent) -> Result<(), PublishError> {
        log::info!("[{}] level={} source={}", STATE_TOPIC, event.level, event.source);
        Ok(())
    }

    fn publish_telemetry(&self, event: &TelemetryEvent) -> Result<(), PublishError> {
        log::debug!("[{}] {:?}", TELEMETRY_TOPIC, event.values.as_slice());
        Ok(())
    }
}

/// In-process fan-out bus. Subscribers that fall behind lose the oldest events.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    state_tx: broadcast::Sender<StateEvent>,
    telemetry_tx: broadcast::Sender<TelemetryEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (state_tx, _) = broadcast::channel(capacity);
        let (telemetry_tx, _) = broadcast::channel(capacity);
        Self { state_tx, telemetry_tx }
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateEvent> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.telemetry_tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Publisher for BroadcastBus {
    fn publish_state(&self, event: &StateEvent) -> Result<(), PublishError> {
        // No subscribers is fine; the event is simply unobserved.
        let _ = self.state_tx.send(event.clone());
        Ok(())
    }

    fn publish_telemetry(&self, event: &TelemetryEvent) -> Result<(), PublishError> {
        let _ = self.telemetry_tx.send(event.clone());
        Ok(())
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    topic: &'a str,
    #[serde(flatten)]
    event: &'a T,
}

/// Sends every event as a single JSON datagram.
#[derive(Debug)]
pub struct UdpJsonBus {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpJsonBus {
    pub fn new(target: SocketAddr) -> Result<Self> {
        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).context("binding UDP bus socket")?;
        socket
            .set_nonblocking(true)
            .context("setting UDP bus socket non-blocking")?;
        log::info!("UDP JSON bus publishing to {target}");
        Ok(Self { socket, target })
    }

    fn send<T: Serialize>(&self, topic: &str, event: &T) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(&Envelope { topic, event })?;
        self.socket.send_to(&payload, self.target)?;
        Ok(())
    }
}

impl Publisher for UdpJsonBus {
    fn publish_state(&self, event: &StateEvent) -> Result<(), PublishError> {
        self.send(STATE_TOPIC, event)
    }

    fn publish_telemetry(&self, event: &TelemetryEvent) -> Result<(), PublishError> {
        self.send(TELEMETRY_TOPIC, event)
    }
}

/// Build the publisher selected by the configuration.
pub fn publisher_from_config(config: &ConductorConfig) -> Result<Arc<dyn Publisher>> {
    let publisher: Arc<dyn Publisher> = match config.bus {
        BusKind::Log => Arc::new(LogBus),
        BusKind::Udp => Arc::new(UdpJsonBus::new(config.bus_addr)?),
    };
    Ok(publisher)
}
