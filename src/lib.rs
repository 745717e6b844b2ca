//! # Meditation Conductor
//!
//! Streaming EEG band-power aggregator and adaptive meditation state machine.
//!
//! ## Architecture
//!
//! - **Ingest**: decodes OSC datagrams from the headset bridge into shared state
//! - **History**: fixed window of the derived alpha signal
//! - **Forecaster**: fits an ARMA model each minute and nudges the level up or down
//! - **State Machine**: the single authority over the level (1-5), shared by all sources
//! - **Manual Override**: keys `1`-`5` force a level
//! - **Auto-Advance**: steps the level after a period without changes
//! - **Telemetry**: publishes the raw band vector every second
//!
//! ## Example
//!
//! ```no_run
//! use meditation_conductor::{BroadcastBus, Conductor, ConductorConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bus = BroadcastBus::default();
//!     let mut states = bus.subscribe_state();
//!
//!     let conductor = Conductor::new(ConductorConfig::default(), Arc::new(bus))?;
//!     tokio::spawn(async move {
//!         while let Ok(event) = states.recv().await {
//!             println!("level {}", event.level);
//!         }
//!     });
//!
//!     conductor.run().await
//! }
//! ```

pub mod auto_advance;
pub mod bus;
pub mod error;
pub mod forecast;
pub mod history;
pub mod ingest;
pub mod manual_override;
pub mod osc;
pub mod shutdown;
pub mod state;
pub mod telemetry;
pub mod types;

pub use auto_advance::{AdvancePolicy, AutoAdvance};
pub use bus::{BroadcastBus, LogBus, Publisher, UdpJsonBus};
pub use error::{ConfigError, DecodeError, ForecastError, PublishError};
pub use forecast::{CycleReport, ForecastOutcome, ForecastSettings, Trend, TrendForecaster};
pub use manual_override::{ChannelInput, ControlInput, OverrideListener, StdinKeys};
pub use shutdown::{Shutdown, ShutdownListener};
pub use state::{SessionState, StateMachine};
pub use telemetry::TelemetryEmitter;
pub use types::*;

use anyhow::{Context, Result};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;

impl ControlInput for Box<dyn ControlInput> {
    fn poll(&mut self) -> Option<char> {
        (**self).poll()
    }
}

/// Owns the shared state and every worker.
pub struct Conductor {
    config: ConductorConfig,
    state: Arc<SessionState>,
    machine: StateMachine,
    publisher: Arc<dyn Publisher>,
    shutdown: Shutdown,
    input: Option<Box<dyn ControlInput>>,
    handles: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Conductor {
    pub fn new(config: ConductorConfig, publisher: Arc<dyn Publisher>) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        log::info!("═══════════════════════════════════════");
        log::info!("  Meditation Conductor");
        log::info!("═══════════════════════════════════════");
        log::info!("Listen address: {}", config.listen_addr);
        log::info!(
            "Forecast: every {}ms, ARMA{} over {} samples, horizon {}",
            config.forecast_period_ms,
            config.model_order,
            config.history_capacity,
            config.forecast_horizon
        );
        log::info!("Thresholds: +{} / {}", config.upper_threshold, config.lower_threshold);
        log::info!(
            "Auto-advance: {}s worn / {}s idle",
            config.auto_advance_worn_secs,
            config.auto_advance_idle_secs
        );

        let state = Arc::new(SessionState::new(config.history_capacity, Utc::now()));
        let machine = StateMachine::new(state.clone(), publisher.clone());

        Ok(Self {
            config,
            state,
            machine,
            publisher,
            shutdown: Shutdown::new(),
            input: None,
            handles: Vec::new(),
            local_addr: None,
        })
    }

    /// Enable the manual override worker with the given input.
    pub fn with_control_input(mut self, input: impl ControlInput) -> Self {
        self.input = Some(Box::new(input));
        self
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Address the band-power listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// A forecaster sharing this conductor's state, for on-demand cycles.
    pub fn forecaster(&self) -> TrendForecaster {
        TrendForecaster::new(self.machine.clone(), ForecastSettings::from(&self.config))
    }

    /// Announce the initial level, bind the listener and spawn every worker.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr {
            anyhow::bail!("conductor already started on {addr}");
        }
        log::info!("Starting Conductor...");

        self.machine.announce(Utc::now());

        let sock = ingest::bind(self.config.listen_addr).await?;
        let addr = sock.local_addr()?;
        self.handles
            .push(ingest::spawn_listener(sock, self.state.clone(), self.shutdown.listener()));

        self.handles
            .push(self.forecaster().spawn(self.config.forecast_period(), self.shutdown.listener()));

        self.handles.push(
            TelemetryEmitter::new(self.state.clone(), self.publisher.clone())
                .spawn(self.config.telemetry_period(), self.shutdown.listener()),
        );

        self.handles.push(
            AutoAdvance::new(self.machine.clone(), AdvancePolicy::from(&self.config))
                .spawn(self.config.auto_advance_period(), self.shutdown.listener()),
        );

        if let Some(input) = self.input.take() {
            self.handles.push(
                OverrideListener::new(self.machine.clone(), input)
                    .spawn(self.config.override_poll_period(), self.shutdown.listener()),
            );
        }

        log::info!("Conductor running with {} workers", self.handles.len());
        self.local_addr = Some(addr);
        Ok(addr)
    }

    pub fn shutdown_listener(&self) -> ShutdownListener {
        self.shutdown.listener()
    }

    /// Signal every worker to stop.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wait for every worker to exit.
    pub async fn join(&mut self) -> Result<()> {
        let handles = std::mem::take(&mut self.handles);
        for result in futures::future::join_all(handles).await {
            result.context("worker panicked")?;
        }
        Ok(())
    }

    /// Start, run until Ctrl+C, then shut down cooperatively.
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;

        signal::ctrl_c().await.context("waiting for Ctrl+C")?;
        log::info!("Shutdown signal received");

        self.shutdown();
        self.join().await?;
        log::info!("Conductor stopped");
        Ok(())
    }
}
