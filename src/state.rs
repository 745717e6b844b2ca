//! Shared session state and the meditation state machine.
//!
//! Every worker holds an `Arc<SessionState>`; there are no process globals.
//! Each field has its own lock. Lock order when two are held at once:
//! `level` → `blink` → `raw`. The history lock is never held together with
//! another one.

use crate::bus::Publisher;
use crate::forecast::Trend;
use crate::history::HistoryBuffer;
use crate::types::{
    Band, Direction, MeditationLevel, RawVector, StateEvent, TransitionSource, BAND_CHANNELS,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// The authoritative level together with its bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelRecord {
    pub level: MeditationLevel,
    pub direction: Direction,
    pub last_published: DateTime<Utc>,
}

/// Process-wide state block shared by ingest and the periodic workers.
#[derive(Debug)]
pub struct SessionState {
    raw: RwLock<RawVector>,
    history: Mutex<HistoryBuffer>,
    blink_events: Mutex<u64>,
    level: Mutex<LevelRecord>,
}

impl SessionState {
    pub fn new(history_capacity: usize, now: DateTime<Utc>) -> Self {
        Self {
            raw: RwLock::new(RawVector::new()),
            history: Mutex::new(HistoryBuffer::new(history_capacity)),
            blink_events: Mutex::new(0),
            level: Mutex::new(LevelRecord {
                level: MeditationLevel::MIN,
                direction: Direction::Up,
                last_published: now,
            }),
        }
    }

    /// Append a derived alpha sample, evicting the oldest if full.
    pub fn push_alpha(&self, value: f64) {
        self.history.lock().push(value);
    }

    pub fn history_snapshot(&self) -> Vec<f64> {
        self.history.lock().snapshot()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn set_band(&self, band: Band, channels: &[f64; BAND_CHANNELS]) {
        self.raw.write().set_band(band, channels);
    }

    /// Count a blink and mirror the new count into the raw vector.
    pub fn increment_blink(&self) -> u64 {
        let mut blinks = self.blink_events.lock();
        *blinks += 1;
        self.raw.write().set_blink_count(*blinks);
        *blinks
    }

    pub fn reset_blink(&self) {
        *self.blink_events.lock() = 0;
    }

    pub fn blink_count(&self) -> u64 {
        *self.blink_events.lock()
    }

    pub fn raw_snapshot(&self) -> RawVector {
        *self.raw.read()
    }

    /// Write the level into its slot and return the full vector.
    pub fn stamp_level(&self, level: MeditationLevel) -> RawVector {
        let mut raw = self.raw.write();
        raw.set_level(level);
        *raw
    }

    pub fn headset_worn(&self) -> bool {
        self.raw.read().headset_worn()
    }

    pub fn level_record(&self) -> LevelRecord {
        *self.level.lock()
    }

    pub fn level(&self) -> MeditationLevel {
        self.level.lock().level
    }

    pub fn direction(&self) -> Direction {
        self.level.lock().direction
    }
}

/// Serializes every level change behind the `level` lock and publishes it.
///
/// The three transition sources (forecast, manual override, auto-advance) each
/// get an operation here that reads and writes the record in one critical
/// section, so at most one change is applied per request even when requests
/// race.
#[derive(Clone)]
pub struct StateMachine {
    state: Arc<SessionState>,
    publisher: Arc<dyn Publisher>,
}

impl StateMachine {
    pub fn new(state: Arc<SessionState>, publisher: Arc<dyn Publisher>) -> Self {
        Self { state, publisher }
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn level(&self) -> MeditationLevel {
        self.state.level()
    }

    /// Set the level (clamped into range), stamp the publish time, publish.
    pub fn set_level(&self, requested: i64, source: TransitionSource, now: DateTime<Utc>) -> MeditationLevel {
        let level = MeditationLevel::clamped(requested);
        let mut record = self.state.level.lock();
        self.commit(&mut record, level, source, now);
        level
    }

    /// Publish the current level as the startup announcement.
    pub fn announce(&self, now: DateTime<Utc>) -> MeditationLevel {
        let mut record = self.state.level.lock();
        let level = record.level;
        self.commit(&mut record, level, TransitionSource::Startup, now);
        level
    }

    /// Forecast-driven ±1 step. Records the direction even when the level is
    /// pinned at a boundary; publishes only when the level changes.
    pub fn apply_trend(&self, trend: Trend, now: DateTime<Utc>) -> Option<MeditationLevel> {
        let mut record = self.state.level.lock();
        let prior = record.level;
        let next = match trend {
            Trend::Rising => {
                record.direction = Direction::Up;
                prior.step_up()
            }
            Trend::Falling => {
                record.direction = Direction::Down;
                prior.step_down()
            }
            Trend::Flat => return None,
        };
        if next == prior {
            return None;
        }
        log::info!("Forecast trend {:?}: level {} -> {}", trend, prior, next);
        self.commit(&mut record, next, TransitionSource::Forecast, now);
        Some(next)
    }

    /// Absolute jump requested by the operator. Leaves the advance direction alone.
    pub fn override_level(&self, level: MeditationLevel, now: DateTime<Utc>) -> MeditationLevel {
        let mut record = self.state.level.lock();
        log::info!("Manual override: level {} -> {}", record.level, level);
        self.commit(&mut record, level, TransitionSource::Manual, now);
        level
    }

    /// Step once in the remembered direction if nothing was published for
    /// longer than `idle_limit`. At level 5 the direction flips down, at level
    /// 1 it flips up.
    pub fn advance_if_idle(&self, idle_limit: chrono::Duration, now: DateTime<Utc>) -> Option<MeditationLevel> {
        let mut record = self.state.level.lock();
        let idle = now - record.last_published;
        if idle <= idle_limit {
            return None;
        }

        if record.level.is_max() {
            record.direction = Direction::Down;
        } else if record.level.is_min() {
            record.direction = Direction::Up;
        }

        let prior = record.level;
        let next = prior.step(record.direction);
        log::info!(
            "Automatically advancing {} after {}s idle: level {} -> {}",
            record.direction,
            idle.num_seconds(),
            prior,
            next
        );
        self.commit(&mut record, next, TransitionSource::AutoAdvance, now);
        Some(next)
    }

    fn commit(&self, record: &mut LevelRecord, level: MeditationLevel, source: TransitionSource, now: DateTime<Utc>) {
        record.level = level;
        record.last_published = now;

        let event = StateEvent { level, source, timestamp: now };
        if let Err(e) = self.publisher.publish_state(&event) {
            log::warn!("Failed to publish level {} ({}): {}", level, source, e);
        }
    }
}
