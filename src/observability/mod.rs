//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! loop and accepter events (panics, accept and handshake failures)
//!     → Selector::log (mask check)
//!     → LogSink (application supplied, TracingLogSink by default)
//!
//! internal diagnostics
//!     → tracing macros with structured fields
//!     → tracing-subscriber (EnvFilter, stderr)
//! ```

pub mod logging;
