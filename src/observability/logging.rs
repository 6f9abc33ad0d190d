//! Structured logging.
//!
//! # Responsibilities
//! - Define the severities and mask the log sink understands
//! - Provide the pluggable `LogSink` injected into the selector
//! - Initialize the tracing subscriber for the binary
//!
//! # Design Decisions
//! - Loop and accepter events go through the sink so applications can
//!   capture them; internal diagnostics use `tracing` macros directly
//! - The default sink forwards to `tracing`

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::GensioError;

/// Log severities, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Fatal,
    Err,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Fatal,
        LogLevel::Err,
        LogLevel::Warning,
        LogLevel::Info,
        LogLevel::Debug,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Fatal => "fatal",
            LogLevel::Err => "err",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = GensioError;

    fn from_str(s: &str) -> Result<Self, GensioError> {
        LogLevel::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| GensioError::config(format!("unknown log level '{s}'")))
    }
}

/// Set of severities delivered to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogMask(u32);

impl LogMask {
    pub const NONE: LogMask = LogMask(0);

    pub fn all() -> Self {
        LogMask(LogLevel::ALL.iter().fold(0, |m, l| m | l.bit()))
    }

    pub fn from_bits(bits: u32) -> Self {
        LogMask(bits & Self::all().0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn with(self, level: LogLevel) -> Self {
        LogMask(self.0 | level.bit())
    }

    pub fn contains(self, level: LogLevel) -> bool {
        self.0 & level.bit() != 0
    }

    /// Build a mask from severity names such as `["err", "warning"]`.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, GensioError> {
        names.iter().try_fold(LogMask::NONE, |mask, name| {
            Ok(mask.with(name.as_ref().parse::<LogLevel>()?))
        })
    }
}

impl Default for LogMask {
    fn default() -> Self {
        LogMask::NONE
            .with(LogLevel::Fatal)
            .with(LogLevel::Err)
            .with(LogLevel::Warning)
    }
}

/// Receiver of (severity, message) pairs from the loop and accepters.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, msg: &str);
}

/// Default sink: forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Fatal | LogLevel::Err => tracing::error!(target: "gensio", "{msg}"),
            LogLevel::Warning => tracing::warn!(target: "gensio", "{msg}"),
            LogLevel::Info => tracing::info!(target: "gensio", "{msg}"),
            LogLevel::Debug => tracing::debug!(target: "gensio", "{msg}"),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_level` when set.
pub fn init_tracing(default_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gensio={default_level},gensiot={default_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
