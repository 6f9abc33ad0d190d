//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, stream counts, packet sizes)
//! - Check log severities and levels are known
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GensioConfig → Result<(), Vec<ValidationError>>

use std::fmt;

use crate::config::schema::GensioConfig;
use crate::observability::logging::LogLevel;

/// One failed check, naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

const TRACING_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

pub fn validate_config(config: &GensioConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let d = &config.defaults;

    if d.open_timeout_ms == 0 {
        errors.push(ValidationError::new("defaults.open_timeout_ms", "must be greater than 0"));
    }
    if d.close_timeout_ms == 0 {
        errors.push(ValidationError::new("defaults.close_timeout_ms", "must be greater than 0"));
    }
    if d.read_buffer == 0 {
        errors.push(ValidationError::new("defaults.read_buffer", "must be greater than 0"));
    }
    if d.write_buffer == 0 {
        errors.push(ValidationError::new("defaults.write_buffer", "must be greater than 0"));
    }
    if d.modem_poll_ms == 0 {
        errors.push(ValidationError::new("defaults.modem_poll_ms", "must be greater than 0"));
    }
    for (field, value) in [
        ("defaults.sctp_instreams", d.sctp_instreams),
        ("defaults.sctp_ostreams", d.sctp_ostreams),
    ] {
        if !(1..=65_535).contains(&value) {
            errors.push(ValidationError::new(field, format!("{value} is outside 1..=65535")));
        }
    }
    if d.udp_max_packet == 0 || d.udp_max_packet > 65_507 {
        errors.push(ValidationError::new(
            "defaults.udp_max_packet",
            format!("{} is outside 1..=65507", d.udp_max_packet),
        ));
    }

    for name in &config.logging.mask {
        if name.parse::<LogLevel>().is_err() {
            errors.push(ValidationError::new("logging.mask", format!("unknown severity '{name}'")));
        }
    }
    if !TRACING_LEVELS.contains(&config.logging.level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::new(
            "logging.level",
            format!("unknown level '{}'", config.logging.level),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&GensioConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = GensioConfig::default();
        config.defaults.open_timeout_ms = 0;
        config.defaults.sctp_ostreams = 0;
        config.defaults.udp_max_packet = 70_000;
        config.logging.mask.push("chatty".into());

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "defaults.open_timeout_ms",
                "defaults.sctp_ostreams",
                "defaults.udp_max_packet",
                "logging.mask",
            ]
        );
    }
}
