//! Transport layer subsystem.
//!
//! # Data Flow
//! ```text
//! connect(base spec) / accepter hand-off
//!     → tcp.rs | udp.rs | sctp.rs | serialdev.rs | stdio.rs | file.rs
//!     → Link { rx: Incoming, tx: Outgoing, ctl: LinkControl }
//!     → owned by one connection core
//!
//! reader task ──Incoming──▶ core ──Outgoing──▶ writer task
//! ```
//!
//! # Design Decisions
//! - Reader and writer run as separate tasks so a blocked write never
//!   stalls reads, and vice versa
//! - The bounded Incoming channel is the read backpressure point: when the
//!   core stops draining it, the reader stops pulling from the kernel
//! - Controls are synchronous and answered from shared socket state

pub mod file;
pub(crate) mod sock;
pub mod sctp;
pub mod serialdev;
pub mod stdio;
pub mod tcp;
pub mod udp;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::addr::{Args, BaseSpec, TransportKind};
use crate::control::ControlOp;
use crate::error::{GensioError, Result};
use crate::os::Selector;
use crate::serial::SerialOp;

/// Chunks in flight per direction between a link's tasks and its core.
pub(crate) const LINK_QUEUE: usize = 8;

/// Per-read buffer size for stream transports.
pub(crate) const READ_CHUNK: usize = 16 * 1024;

/// Per-chunk metadata for reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Aux {
    /// Out-of-band (urgent, or unordered for SCTP).
    pub oob: bool,
    /// Sub-stream index on multi-stream transports.
    pub stream: Option<u16>,
}

impl Aux {
    pub fn oob() -> Self {
        Self {
            oob: true,
            stream: None,
        }
    }

    pub fn stream(index: u16) -> Self {
        Self {
            oob: false,
            stream: Some(index),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Incoming {
    Data { data: Bytes, aux: Aux },
    /// Sampled modem lines, high nibble of [`crate::serial::ModemState`].
    Modem(u8),
    Closed,
    Error(GensioError),
}

#[derive(Debug)]
pub(crate) enum Outgoing {
    Data { data: Bytes, aux: Aux },
    /// Half-close: flush, then close the write side.
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LinkAttrs {
    pub reliable: bool,
    pub packet: bool,
    pub serial: bool,
    /// Most OOB bytes accepted per write; 0 means no OOB support.
    pub max_oob: usize,
    /// Negotiated (instreams, ostreams) for multi-stream transports.
    pub streams: Option<(u16, u16)>,
}

/// Synchronous control surface of a transport.
pub(crate) trait LinkControl: Send {
    fn control(&mut self, _get: bool, _op: ControlOp, _data: &str) -> Result<String> {
        Err(GensioError::NotSupported)
    }

    fn serial(&mut self, _op: SerialOp, _value: u32) -> Result<u32> {
        Err(GensioError::NotSupported)
    }

    /// Secondary channel sharing this link's lifetime (stdio stderr).
    fn open_channel(&mut self, _args: &Args) -> Result<Link> {
        Err(GensioError::NotSupported)
    }

    /// Called once after the tasks are stopped.
    fn on_close(&mut self) {}
}

/// A link's control surface, reachable from the stream handle while the
/// core owns the link itself.
pub(crate) type SharedControl = Arc<Mutex<Box<dyn LinkControl>>>;

pub(crate) fn with_control<R>(ctl: &SharedControl, f: impl FnOnce(&mut dyn LinkControl) -> R) -> R {
    let mut guard = ctl.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut **guard)
}

/// The ends handed to a transport's reader and writer tasks.
pub(crate) struct LinkEnds {
    pub incoming: mpsc::Sender<Incoming>,
    pub outgoing: mpsc::Receiver<Outgoing>,
}

/// An open transport, owned by exactly one connection core.
pub(crate) struct Link {
    pub kind: TransportKind,
    pub attrs: LinkAttrs,
    pub rx: mpsc::Receiver<Incoming>,
    pub tx: mpsc::Sender<Outgoing>,
    pub ctl: SharedControl,
    drain: Vec<JoinHandle<()>>,
    abort: Vec<JoinHandle<()>>,
}

impl Link {
    pub fn new(kind: TransportKind, attrs: LinkAttrs, ctl: Box<dyn LinkControl>) -> (Self, LinkEnds) {
        let (in_tx, in_rx) = mpsc::channel(LINK_QUEUE);
        let (out_tx, out_rx) = mpsc::channel(LINK_QUEUE);
        let link = Self {
            kind,
            attrs,
            rx: in_rx,
            tx: out_tx,
            ctl: Arc::new(Mutex::new(ctl)),
            drain: Vec::new(),
            abort: Vec::new(),
        };
        (
            link,
            LinkEnds {
                incoming: in_tx,
                outgoing: out_rx,
            },
        )
    }

    /// A task that is given the close grace period to finish (writers).
    pub fn drain_on_close(&mut self, task: JoinHandle<()>) {
        self.drain.push(task);
    }

    /// A task that is cancelled on close (readers, pollers).
    pub fn abort_on_close(&mut self, task: JoinHandle<()>) {
        self.abort.push(task);
    }

    /// Flush pending writes, then stop every task.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.tx.send(Outgoing::Shutdown).await;
        for task in self.drain.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                tracing::debug!(transport = %self.kind, "writer did not drain in time");
                abort.abort();
            }
        }
        for task in self.abort.drain(..) {
            task.abort();
        }
        with_control(&self.ctl, |ctl| ctl.on_close());
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in self.drain.iter().chain(self.abort.iter()) {
            task.abort();
        }
    }
}

/// Establish the client side of `base`.
///
/// `local` binds the socket before connecting (accepter-sourced streams).
pub(crate) async fn connect(
    base: &BaseSpec,
    selector: &Selector,
    local: Option<std::net::SocketAddr>,
) -> Result<Link> {
    match base.kind {
        TransportKind::Tcp => tcp::connect(base, selector, local).await,
        TransportKind::Udp => udp::connect(base, selector, local).await,
        TransportKind::Sctp => sctp::connect(base, selector, local).await,
        TransportKind::SerialDev => serialdev::open(base, selector),
        TransportKind::Stdio => stdio::spawn(base, selector),
        TransportKind::File => file::open(base, selector),
    }
}

/// Reject transport options the transport doesn't know, before any I/O.
pub(crate) fn check_args(base: &BaseSpec) -> Result<()> {
    let known: &[&str] = match base.kind {
        TransportKind::Tcp => tcp::OPTIONS,
        TransportKind::Udp => udp::OPTIONS,
        TransportKind::Sctp => sctp::OPTIONS,
        TransportKind::SerialDev => serialdev::OPTIONS,
        TransportKind::Stdio => stdio::OPTIONS,
        TransportKind::File => file::OPTIONS,
    };
    base.args.check_known(base.kind.name(), known)
}
