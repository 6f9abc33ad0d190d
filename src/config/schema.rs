//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML files and
//! every field has a default, so an empty file is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct GensioConfig {
    /// Log sink and tracing settings.
    pub logging: LoggingConfig,

    /// Defaults applied when a spec string leaves a value out.
    pub defaults: DefaultsConfig,

    /// Fallback trust material for the ssl and certauth filters.
    pub tls: TlsDefaults,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Tracing level used by the binary (`RUST_LOG` overrides it).
    pub level: String,

    /// Severities delivered to the log sink.
    pub mask: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            mask: vec!["fatal".into(), "err".into(), "warning".into()],
        }
    }
}

/// Stream and transport defaults.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DefaultsConfig {
    pub open_timeout_ms: u64,
    pub close_timeout_ms: u64,
    /// Bytes buffered toward the application before link reads pause.
    pub read_buffer: usize,
    /// Bytes `write()` will queue before reporting a short write.
    pub write_buffer: usize,
    pub modem_poll_ms: u64,
    pub nodelay: bool,
    pub sctp_instreams: u32,
    pub sctp_ostreams: u32,
    pub udp_max_packet: usize,
    pub backlog: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 10_000,
            close_timeout_ms: 2_000,
            read_buffer: 64 * 1024,
            write_buffer: 64 * 1024,
            modem_poll_ms: 100,
            nodelay: false,
            sctp_instreams: 1,
            sctp_ostreams: 1,
            udp_max_packet: 65_507,
            backlog: 16,
        }
    }
}

impl DefaultsConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn modem_poll(&self) -> Duration {
        Duration::from_millis(self.modem_poll_ms)
    }
}

/// Paths used when a filter spec does not name its own files.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct TlsDefaults {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}
