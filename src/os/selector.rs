//! The shared service every stream and accepter runs against.
//!
//! The selector itself does no polling: readiness, timers and dispatch are
//! the tokio runtime's job. What it adds is the injected log sink, the
//! configured defaults, and the boundary that keeps a panicking callback
//! from taking the loop down.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::{DefaultsConfig, GensioConfig};
use crate::error::Result;
use crate::observability::logging::{LogLevel, LogMask, LogSink, TracingLogSink};
use crate::os::waiter::Waiter;

/// Cheaply clonable handle to the loop's shared services.
#[derive(Clone)]
pub struct Selector {
    inner: Arc<Inner>,
}

struct Inner {
    sink: Arc<dyn LogSink>,
    mask: AtomicU32,
    config: GensioConfig,
}

impl Selector {
    /// Default config, logging through `tracing`.
    pub fn new() -> Self {
        Self::build(GensioConfig::default(), Arc::new(TracingLogSink), LogMask::default())
    }

    /// Use `config` and deliver loop events to `sink`.
    pub fn with_config(config: GensioConfig, sink: Arc<dyn LogSink>) -> Result<Self> {
        let mask = LogMask::from_names(&config.logging.mask)?;
        Ok(Self::build(config, sink, mask))
    }

    pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
        Self::build(GensioConfig::default(), sink, LogMask::default())
    }

    fn build(config: GensioConfig, sink: Arc<dyn LogSink>, mask: LogMask) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                mask: AtomicU32::new(mask.bits()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &GensioConfig {
        &self.inner.config
    }

    pub fn defaults(&self) -> &DefaultsConfig {
        &self.inner.config.defaults
    }

    pub fn set_log_mask(&self, mask: LogMask) {
        self.inner.mask.store(mask.bits(), Ordering::Relaxed);
    }

    pub fn log_mask(&self) -> LogMask {
        LogMask::from_bits(self.inner.mask.load(Ordering::Relaxed))
    }

    /// Deliver a message to the sink if its severity is in the mask.
    pub fn log(&self, level: LogLevel, msg: impl AsRef<str>) {
        if self.log_mask().contains(level) {
            self.inner.sink.log(level, msg.as_ref());
        }
    }

    pub fn alloc_waiter(&self) -> Waiter {
        Waiter::new()
    }

    /// Run a user callback. A panic is logged and reported as `None` so the
    /// caller can tear down the connection it belongs to.
    pub(crate) fn guard<R>(&self, context: &dyn fmt::Display, f: impl FnOnce() -> R) -> Option<R> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(r) => Some(r),
            Err(payload) => {
                self.log(
                    LogLevel::Err,
                    format!("{context}: callback panicked: {}", panic_message(&payload)),
                );
                None
            }
        }
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("log_mask", &self.log_mask())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<(LogLevel, String)>>);

    impl LogSink for Capture {
        fn log(&self, level: LogLevel, msg: &str) {
            self.0.lock().unwrap().push((level, msg.to_string()));
        }
    }

    #[test]
    fn mask_filters_sink() {
        let sink = Arc::new(Capture::default());
        let sel = Selector::with_sink(sink.clone());
        sel.log(LogLevel::Info, "dropped");
        sel.log(LogLevel::Err, "kept");
        sel.set_log_mask(LogMask::default().with(LogLevel::Info));
        sel.log(LogLevel::Info, "now kept");

        let logged = sink.0.lock().unwrap();
        let msgs: Vec<_> = logged.iter().map(|(_, m)| m.as_str()).collect();
        assert_eq!(msgs, vec!["kept", "now kept"]);
    }

    #[test]
    fn guard_contains_panics() {
        let sink = Arc::new(Capture::default());
        let sel = Selector::with_sink(sink.clone());

        assert_eq!(sel.guard(&"conn-1", || 7), Some(7));
        let res: Option<()> = sel.guard(&"conn-2", || panic!("boom"));
        assert!(res.is_none());

        let logged = sink.0.lock().unwrap();
        assert_eq!(logged.len(), 1);
        assert!(logged[0].1.contains("conn-2"));
        assert!(logged[0].1.contains("boom"));
    }
}
