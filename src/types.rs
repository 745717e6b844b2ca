//! Meditation Conductor - core data types
//!
//! Readings decoded from the headset stream, the raw telemetry vector, the
//! meditation level, bus events and the process configuration.

use crate::error::ConfigError;
use crate::forecast::ArmaModel;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Channels per band-power reading (TP9, AF7, AF8, TP10).
pub const BAND_CHANNELS: usize = 4;
/// Slots occupied by the five bands at the front of the raw vector.
pub const BAND_SLOTS: usize = 20;
pub const BLINK_SLOT: usize = 20;
pub const STATE_SLOT: usize = 21;
pub const RAW_VECTOR_LEN: usize = 22;
/// Largest auto-advance timeout, in seconds, a wall-clock span can hold.
pub const MAX_TIMEOUT_SECS: u64 = i64::MAX as u64 / 1_000;

/// EEG frequency band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Alpha,
    Beta,
    Gamma,
    Delta,
    Theta,
}

impl Band {
    pub const ALL: [Band; 5] = [Band::Alpha, Band::Beta, Band::Gamma, Band::Delta, Band::Theta];

    /// First raw-vector slot owned by this band.
    pub fn slot_offset(self) -> usize {
        let index = match self {
            Band::Alpha => 0,
            Band::Beta => 1,
            Band::Gamma => 2,
            Band::Delta => 3,
            Band::Theta => 4,
        };
        index * BAND_CHANNELS
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Band::Alpha => "alpha",
            Band::Beta => "beta",
            Band::Gamma => "gamma",
            Band::Delta => "delta",
            Band::Theta => "theta",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded measurement from the headset stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Absolute band power, one magnitude per channel
    Band {
        band: Band,
        channels: [f64; BAND_CHANNELS],
    },
    /// Blink event; carries no payload
    Blink,
    /// Accelerometer sample; currently ignored
    Accelerometer,
}

impl Reading {
    /// Derived alpha scalar: mean of the two frontal channels.
    pub fn alpha_scalar(&self) -> Option<f64> {
        match self {
            Reading::Band { band: Band::Alpha, channels } => Some((channels[1] + channels[2]) / 2.0),
            _ => None,
        }
    }
}

/// The 22-slot telemetry vector: 4 slots per band, blink count, current level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RawVector([f64; RAW_VECTOR_LEN]);

impl Default for RawVector {
    fn default() -> Self {
        Self([0.0; RAW_VECTOR_LEN])
    }
}

impl RawVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_band(&mut self, band: Band, channels: &[f64; BAND_CHANNELS]) {
        let start = band.slot_offset();
        self.0[start..start + BAND_CHANNELS].copy_from_slice(channels);
    }

    pub fn band(&self, band: Band) -> [f64; BAND_CHANNELS] {
        let start = band.slot_offset();
        let mut out = [0.0; BAND_CHANNELS];
        out.copy_from_slice(&self.0[start..start + BAND_CHANNELS]);
        out
    }

    pub fn set_blink_count(&mut self, count: u64) {
        self.0[BLINK_SLOT] = count as f64;
    }

    pub fn blink_count(&self) -> f64 {
        self.0[BLINK_SLOT]
    }

    pub fn set_level(&mut self, level: MeditationLevel) {
        self.0[STATE_SLOT] = f64::from(level.get());
    }

    pub fn level_slot(&self) -> f64 {
        self.0[STATE_SLOT]
    }

    /// The headset counts as worn while any band slot is nonzero.
    pub fn headset_worn(&self) -> bool {
        self.0[..BAND_SLOTS].iter().any(|v| *v != 0.0)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// Meditation level, always within `1..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MeditationLevel(u8);

impl MeditationLevel {
    pub const MIN: MeditationLevel = MeditationLevel(1);
    pub const MAX: MeditationLevel = MeditationLevel(5);

    /// Exact constructor; `None` outside `1..=5`.
    pub fn new(value: i64) -> Option<Self> {
        if (1..=5).contains(&value) {
            Some(Self(value as u8))
        } else {
            None
        }
    }

    /// Clamp any integer into the valid range.
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(1, 5) as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn step_up(self) -> Self {
        Self::clamped(i64::from(self.0) + 1)
    }

    pub fn step_down(self) -> Self {
        Self::clamped(i64::from(self.0) - 1)
    }

    pub fn step(self, direction: Direction) -> Self {
        match direction {
            Direction::Up => self.step_up(),
            Direction::Down => self.step_down(),
        }
    }

    pub fn is_max(self) -> bool {
        self == Self::MAX
    }

    pub fn is_min(self) -> bool {
        self == Self::MIN
    }
}

impl Default for MeditationLevel {
    fn default() -> Self {
        Self::MIN
    }
}

impl fmt::Display for MeditationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction the next automatic advance will take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("upwards"),
            Direction::Down => f.write_str("downwards"),
        }
    }
}

/// Who asked for a level change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionSource {
    Startup,
    Forecast,
    Manual,
    AutoAdvance,
}

impl fmt::Display for TransitionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransitionSource::Startup => "startup",
            TransitionSource::Forecast => "forecast",
            TransitionSource::Manual => "manual",
            TransitionSource::AutoAdvance => "auto_advance",
        };
        f.write_str(s)
    }
}

/// Published whenever the meditation level is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateEvent {
    pub level: MeditationLevel,
    pub source: TransitionSource,
    pub timestamp: DateTime<Utc>,
}

/// Periodic snapshot of the raw vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub values: RawVector,
    pub timestamp: DateTime<Utc>,
}

/// ARMA model order `(p, d, q)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
}

impl Default for ModelOrder {
    fn default() -> Self {
        Self { p: 4, d: 0, q: 1 }
    }
}

impl fmt::Display for ModelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.p, self.d, self.q)
    }
}

/// Outbound bus implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    /// Write events to the log only
    #[default]
    Log,
    /// Send each event as a JSON datagram
    Udp,
}

/// Configuration for the conductor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Address the datagram listener binds to
    pub listen_addr: SocketAddr,
    pub forecast_period_ms: u64,
    pub telemetry_period_ms: u64,
    pub auto_advance_period_ms: u64,
    pub override_poll_period_ms: u64,
    /// Idle seconds before auto-advance while the headset is worn
    pub auto_advance_worn_secs: u64,
    /// Idle seconds before auto-advance while the headset is off
    pub auto_advance_idle_secs: u64,
    pub upper_threshold: f64,
    pub lower_threshold: f64,
    pub forecast_horizon: usize,
    pub history_capacity: usize,
    /// Percentile band `(low, high)` kept for the baseline mean
    pub trim_percentiles: (f64, f64),
    pub bus: BusKind,
    /// Destination of the UDP JSON bus
    pub bus_addr: SocketAddr,
    /// Poll stdin for `1`-`5` level overrides
    pub keyboard_override: bool,
    /// Kept last so it serializes as a trailing TOML table
    pub model_order: ModelOrder,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            forecast_period_ms: 60_000,
            telemetry_period_ms: 1_000,
            auto_advance_period_ms: 1_000,
            override_poll_period_ms: 50,
            auto_advance_worn_secs: 120,
            auto_advance_idle_secs: 600,
            upper_threshold: 0.01,
            lower_threshold: -0.03,
            model_order: ModelOrder::default(),
            forecast_horizon: 20,
            history_capacity: 300,
            trim_percentiles: (5.0, 95.0),
            bus: BusKind::Log,
            bus_addr: SocketAddr::from(([127, 0, 0, 1], 7001)),
            keyboard_override: true,
        }
    }
}

impl ConductorConfig {
    /// Load a TOML file; omitted fields keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let periods = [
            ("forecast_period_ms", self.forecast_period_ms),
            ("telemetry_period_ms", self.telemetry_period_ms),
            ("auto_advance_period_ms", self.auto_advance_period_ms),
            ("override_poll_period_ms", self.override_poll_period_ms),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(ConfigError::ZeroValue(name));
            }
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::ZeroValue("history_capacity"));
        }
        if self.forecast_horizon == 0 {
            return Err(ConfigError::ZeroValue("forecast_horizon"));
        }
        if !(self.lower_threshold < self.upper_threshold) {
            return Err(ConfigError::InvertedThresholds {
                lower: self.lower_threshold,
                upper: self.upper_threshold,
            });
        }
        let (low, high) = self.trim_percentiles;
        if !(0.0 <= low && low < high && high <= 100.0) {
            return Err(ConfigError::BadPercentiles { low, high });
        }
        if self.model_order.d != 0 {
            return Err(ConfigError::Differencing(self.model_order.d));
        }
        if self.model_order.p == 0 {
            return Err(ConfigError::NoAutoregression);
        }
        let need = ArmaModel::min_samples(self.model_order);
        if self.history_capacity < need {
            return Err(ConfigError::HistoryTooShort {
                capacity: self.history_capacity,
                need,
            });
        }
        let timeouts = [
            ("auto_advance_worn_secs", self.auto_advance_worn_secs),
            ("auto_advance_idle_secs", self.auto_advance_idle_secs),
        ];
        for (name, secs) in timeouts {
            if secs > MAX_TIMEOUT_SECS {
                return Err(ConfigError::TimeoutTooLarge { field: name, secs });
            }
        }
        Ok(())
    }

    pub fn forecast_period(&self) -> Duration {
        Duration::from_millis(self.forecast_period_ms)
    }

    pub fn telemetry_period(&self) -> Duration {
        Duration::from_millis(self.telemetry_period_ms)
    }

    pub fn auto_advance_period(&self) -> Duration {
        Duration::from_millis(self.auto_advance_period_ms)
    }

    pub fn override_poll_period(&self) -> Duration {
        Duration::from_millis(self.override_poll_period_ms)
    }
}
