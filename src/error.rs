//! Typed errors for the conductor library.
//!
//! Orchestration code wraps these in `anyhow`; workers log them and keep
//! running.

use std::io;

/// Failure to decode an inbound datagram.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram truncated at byte {0}")]
    Truncated(usize),

    #[error("string at byte {0} is not valid utf-8 or not null-terminated")]
    InvalidString(usize),

    #[error("type tag string must start with ',' (got {0:?})")]
    MissingTypeTag(String),

    #[error("unsupported argument type '{0}'")]
    UnsupportedType(char),

    #[error("bundle contains no elements")]
    EmptyBundle,

    #[error("bundle element of {size} bytes overruns datagram at byte {offset}")]
    BadElementSize { size: usize, offset: usize },

    #[error("{address} expects {expected} numeric arguments, got {got}")]
    MissingArguments {
        address: String,
        expected: usize,
        got: usize,
    },
}

/// Reasons a trend forecast cycle could not produce a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ForecastError {
    #[error("insufficient history: have {have} samples, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("model equations are singular (series is constant or degenerate)")]
    Singular,

    #[error("model produced a non-finite value")]
    NonFinite,

    #[error("unsupported model order ({p}, {d}, {q})")]
    UnsupportedOrder { p: usize, d: usize, q: usize },
}

/// Failure to hand an event to the outbound bus.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("bus i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("bus channel closed")]
    Closed,
}

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("lower threshold {lower} must be below upper threshold {upper}")]
    InvertedThresholds { lower: f64, upper: f64 },

    #[error("trim percentiles ({low}, {high}) must satisfy 0 <= low < high <= 100")]
    BadPercentiles { low: f64, high: f64 },

    #[error("differencing order {0} is not supported (only d = 0)")]
    Differencing(usize),

    #[error("model order needs at least one autoregressive term")]
    NoAutoregression,

    #[error("history capacity {capacity} is below the {need} samples the model needs")]
    HistoryTooShort { capacity: usize, need: usize },

    #[error("{field} = {secs} exceeds the largest supported timeout")]
    TimeoutTooLarge { field: &'static str, secs: u64 },
}
