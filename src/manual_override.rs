//! Manual override listener
//!
//! Polls an out-of-band control input without blocking and forces the level
//! when one of the keys `1`-`5` is pending.

use crate::shutdown::{spawn_periodic, ShutdownListener};
use crate::state::StateMachine;
use crate::types::MeditationLevel;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::io::Read;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Non-blocking source of control keys.
pub trait ControlInput: Send + 'static {
    /// Next pending key, if any. Must never block.
    fn poll(&mut self) -> Option<char>;
}

/// Map a key to the level it selects.
pub fn level_for_key(key: char) -> Option<MeditationLevel> {
    let digit = key.to_digit(10)?;
    MeditationLevel::new(i64::from(digit))
}

/// Keys delivered over a channel.
pub struct ChannelInput {
    rx: Receiver<char>,
}

impl ChannelInput {
    pub fn new(rx: Receiver<char>) -> Self {
        Self { rx }
    }

    /// Create an input together with the sender that feeds it.
    pub fn pair() -> (Sender<char>, Self) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (tx, Self::new(rx))
    }
}

impl ControlInput for ChannelInput {
    fn poll(&mut self) -> Option<char> {
        match self.rx.try_recv() {
            Ok(key) => Some(key),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Keys typed on stdin, read by a dedicated thread.
pub struct StdinKeys {
    inner: ChannelInput,
}

impl StdinKeys {
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, inner) = ChannelInput::pair();
        std::thread::Builder::new()
            .name("stdin-keys".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for byte in stdin.lock().bytes() {
                    let Ok(byte) = byte else { break };
                    let key = char::from(byte);
                    if key.is_ascii_whitespace() {
                        continue;
                    }
                    if tx.send(key).is_err() {
                        break;
                    }
                }
                log::debug!("stdin closed, keyboard override disabled");
            })?;
        Ok(Self { inner })
    }
}

impl ControlInput for StdinKeys {
    fn poll(&mut self) -> Option<char> {
        self.inner.poll()
    }
}

/// Periodic worker applying keyboard overrides.
pub struct OverrideListener<I: ControlInput> {
    machine: StateMachine,
    input: I,
}

impl<I: ControlInput> OverrideListener<I> {
    pub fn new(machine: StateMachine, input: I) -> Self {
        Self { machine, input }
    }

    /// Consume at most one pending key.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<MeditationLevel> {
        let key = self.input.poll()?;
        let Some(level) = level_for_key(key) else {
            log::debug!("Ignoring key {:?}", key);
            return None;
        };
        log::info!("Pressed key '{}'", key);
        Some(self.machine.override_level(level, now))
    }

    pub fn spawn(mut self, period: Duration, shutdown: ShutdownListener) -> JoinHandle<()> {
        spawn_periodic("override", period, shutdown, move || {
            self.tick(Utc::now());
        })
    }
}
