//! Passive side: listen on a transport and hand each inbound connection to
//! the application as an open [`Gensio`].
//!
//! # Data Flow
//! ```text
//! listen loop ──▶ Link ──▶ Gensio::accepted (server filters, precert hook)
//!                              │ open ok
//!                              ▼
//!                 AccepterEvent::new_connection(io)
//! ```
//!
//! # Design Decisions
//! - The listen loop holds only a `Weak` to the accepter, so dropping every
//!   handle stops it
//! - Accepted streams keep no reference back to the accepter; a drop guard
//!   from the [`ConnectionTracker`] is all they carry

mod sctp;
mod tcp;
mod udp;

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::addr::{Family, NetAddr, StackSpec, TransportKind};
use crate::control::ControlOp;
use crate::error::{GensioError, Result};
use crate::filter::{CertVerify, PrecertHook};
use crate::gensio::{lock, ConnectionTracker, Done, Event, Gensio, Plan};
use crate::net::Link;
use crate::observability::logging::LogLevel;
use crate::os::Selector;

/// Callbacks from an accepter.
pub trait AccepterEvent: Send + Sync {
    /// An inbound stream finished its handshakes. Read callbacks are off
    /// until the application enables them.
    fn new_connection(&self, io: Gensio);

    /// Called by TLS and certauth servers before the peer certificate is
    /// checked. `Err(NotSupported)` keeps the configured CA.
    fn precert_verify(&self, _cv: &mut CertVerify) -> Result<()> {
        Err(GensioError::NotSupported)
    }

    fn log(&self, _level: LogLevel, _msg: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccepterState {
    Created,
    Started,
    Stopped,
}

/// What the listen loop may do right now.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Gate {
    pub enabled: bool,
    pub stopped: bool,
}

/// Wait until accepting is allowed; `false` once the accepter stops.
pub(crate) async fn accepting(gate: &mut watch::Receiver<Gate>) -> bool {
    match gate.wait_for(|g| g.stopped || g.enabled).await {
        Ok(g) => !g.stopped,
        Err(_) => false,
    }
}

struct AccInner {
    state: AccepterState,
    local: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
    udp: Option<udp::Endpoint>,
}

pub(crate) struct AccShared {
    selector: Selector,
    plan: Arc<Plan>,
    handler: Arc<dyn AccepterEvent>,
    precert: PrecertHook,
    tracker: ConnectionTracker,
    gate: watch::Sender<Gate>,
    inner: Mutex<AccInner>,
}

impl AccShared {
    /// Report through the log sink and the application.
    fn report(&self, level: LogLevel, msg: String) {
        self.selector.log(level, &msg);
        let handler = &self.handler;
        let _ = self.selector.guard(&"accepter log", || handler.log(level, &msg));
    }

    /// Run the server side of a fresh link; the application gets it once open.
    fn serve(self: &Arc<Self>, link: Link, peer: SocketAddr) {
        let (tx, rx) = oneshot::channel();
        let done: Done = Box::new(move |res| {
            let _ = tx.send(res);
        });
        let io = match Gensio::accepted(
            &self.selector,
            Arc::clone(&self.plan),
            Some(Arc::clone(&self.precert)),
            &self.tracker,
            link,
            done,
        ) {
            Ok(io) => io,
            Err(e) => {
                self.report(LogLevel::Err, format!("{peer}: could not start connection: {e}"));
                return;
            }
        };
        let acc = Arc::clone(self);
        // holds the stream alive through its handshakes
        tokio::spawn(async move {
            match rx.await.unwrap_or(Err(GensioError::LocalClosed)) {
                Ok(()) => {
                    let id = io.id();
                    tracing::debug!(gensio = %id, %peer, "connection accepted");
                    let handler = Arc::clone(&acc.handler);
                    let _ = acc.selector.guard(&id, move || handler.new_connection(io));
                }
                Err(e) => acc.report(LogLevel::Err, format!("{peer}: connection setup failed: {e}")),
            }
        });
    }
}

/// A listener that creates server-side streams. Clones share one accepter.
#[derive(Clone)]
pub struct Accepter {
    shared: Arc<AccShared>,
}

impl Accepter {
    /// Parse `spec` and load the filter configuration. Nothing is bound
    /// until [`startup`](Self::startup).
    pub fn new(spec: &str, selector: &Selector, handler: Arc<dyn AccepterEvent>) -> Result<Self> {
        let plan = Arc::new(Plan::new(spec, selector)?);
        if !matches!(
            plan.base.kind,
            TransportKind::Tcp | TransportKind::Udp | TransportKind::Sctp
        ) {
            return Err(GensioError::config(format!(
                "cannot accept on {}",
                plan.base.kind.name()
            )));
        }
        let precert: PrecertHook = {
            let (handler, selector) = (Arc::clone(&handler), selector.clone());
            Arc::new(move |cv: &mut CertVerify| {
                selector
                    .guard(&"precert_verify", || handler.precert_verify(cv))
                    .unwrap_or_else(|| Err(GensioError::comm("precert_verify panicked")))
            })
        };
        let (gate, _) = watch::channel(Gate {
            enabled: true,
            stopped: false,
        });
        Ok(Self {
            shared: Arc::new(AccShared {
                selector: selector.clone(),
                plan,
                handler,
                precert,
                tracker: ConnectionTracker::new(),
                gate,
                inner: Mutex::new(AccInner {
                    state: AccepterState::Created,
                    local: None,
                    task: None,
                    udp: None,
                }),
            }),
        })
    }

    /// Bind and start accepting.
    pub async fn startup(&self) -> Result<()> {
        if lock(&self.shared.inner).state != AccepterState::Created {
            return Err(GensioError::NotReady);
        }
        let shared = &self.shared;
        let base = &shared.plan.base;
        let addrs = bind_addrs(&base.net_addr()?).await?;
        let weak = Arc::downgrade(shared);
        let gate = shared.gate.subscribe();

        let (local, task, endpoint) = match base.kind {
            TransportKind::Tcp => {
                let (listener, local) = tcp::listen(&addrs, shared.selector.defaults().backlog)?;
                let nodelay = base
                    .args
                    .bool("nodelay")?
                    .unwrap_or(shared.selector.defaults().nodelay);
                (local, tokio::spawn(tcp::run(listener, weak, gate, nodelay)), None)
            }
            TransportKind::Sctp => {
                let counts = crate::net::sctp::StreamCounts::from_spec(base, &shared.selector)?;
                let (fd, local) = sctp::listen(&addrs, counts, shared.selector.defaults().backlog)?;
                (local, tokio::spawn(sctp::run(fd, weak, gate)), None)
            }
            TransportKind::Udp => {
                let max_packet = crate::net::udp::max_packet(base, &shared.selector)?;
                let (endpoint, local) = udp::bind(&addrs, max_packet)?;
                let task = tokio::spawn(udp::run(endpoint.clone(), weak, gate));
                (local, task, Some(endpoint))
            }
            other => return Err(GensioError::config(format!("cannot accept on {}", other.name()))),
        };

        let mut inner = lock(&shared.inner);
        if inner.state != AccepterState::Created {
            task.abort();
            return Err(GensioError::NotReady);
        }
        inner.state = AccepterState::Started;
        inner.local = Some(local);
        inner.task = Some(task);
        inner.udp = endpoint;
        drop(inner);
        tracing::info!(address = %local, transport = base.kind.name(), "accepter started");
        Ok(())
    }

    /// Stop accepting and close the listening socket. Streams already
    /// handed out keep running; on udp they keep the shared socket open
    /// until the last one closes.
    pub async fn shutdown(&self) {
        let task = {
            let mut inner = lock(&self.shared.inner);
            if inner.state == AccepterState::Stopped {
                return;
            }
            inner.state = AccepterState::Stopped;
            inner.udp = None;
            inner.task.take()
        };
        self.shared.gate.send_modify(|g| g.stopped = true);
        if self.shared.plan.base.kind != TransportKind::Udp {
            if let Some(task) = task {
                let _ = task.await;
            }
        }
        tracing::info!("accepter stopped");
    }

    /// Pause or resume handing out new connections.
    pub fn set_accept_callback_enable(&self, enabled: bool) {
        self.shared.gate.send_modify(|g| g.enabled = enabled);
    }

    pub fn state(&self) -> AccepterState {
        lock(&self.shared.inner).state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.inner).local
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|a| a.port())
    }

    pub fn control(&self, get: bool, op: ControlOp, _data: &str) -> Result<String> {
        let local = self.local_addr().ok_or(GensioError::NotReady)?;
        match op {
            ControlOp::LPort if get => Ok(local.port().to_string()),
            ControlOp::LAddr if get => Ok(local.to_string()),
            _ => Err(GensioError::NotSupported),
        }
    }

    /// Accepted streams that have not finished closing.
    pub fn active_connections(&self) -> u64 {
        self.shared.tracker.active_count()
    }

    /// Resolve once every accepted stream has closed.
    pub async fn wait_idle(&self) {
        self.shared.tracker.wait_idle().await
    }

    /// A client stream that uses the accepter's own local address as its
    /// source. The transport must match the accepter's.
    pub fn str_to_gensio(&self, spec: &str, handler: Option<Arc<dyn Event>>) -> Result<Gensio> {
        let (local, endpoint) = {
            let inner = lock(&self.shared.inner);
            if inner.state != AccepterState::Started {
                return Err(GensioError::NotReady);
            }
            (inner.local.ok_or(GensioError::NotReady)?, inner.udp.clone())
        };
        let base = StackSpec::parse(spec)?.base;
        if base.kind != self.shared.plan.base.kind {
            return Err(GensioError::config(format!(
                "{} stream on a {} accepter",
                base.kind.name(),
                self.shared.plan.base.kind.name()
            )));
        }
        match endpoint {
            Some(endpoint) => {
                let connector = endpoint.connector(base.net_addr()?);
                Gensio::with_connector(spec, &self.shared.selector, handler, connector)
            }
            None => Gensio::with_local(spec, &self.shared.selector, handler, local),
        }
    }
}

impl fmt::Debug for Accepter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepter")
            .field("transport", &self.shared.plan.base.kind)
            .field("state", &self.state())
            .field("local", &self.local_addr())
            .finish_non_exhaustive()
    }
}

/// Listen addresses in preference order. Without a host, the wildcard
/// address of the requested family; IPv6 (dual-stack) first for either.
async fn bind_addrs(net: &NetAddr) -> Result<Vec<SocketAddr>> {
    if net.host.is_some() {
        return net.resolve().await;
    }
    let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, net.port));
    let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, net.port));
    Ok(match net.family {
        Family::Ipv4 => vec![v4],
        Family::Ipv6 => vec![v6],
        Family::Any => vec![v6, v4],
    })
}

/// Bind the first address that works.
pub(crate) fn bind_first<T>(
    addrs: &[SocketAddr],
    bind: impl Fn(&SocketAddr) -> std::io::Result<T>,
) -> Result<T> {
    let mut last = None;
    for addr in addrs {
        match bind(addr) {
            Ok(v) => return Ok(v),
            Err(e) => {
                tracing::debug!(%addr, error = %e, "bind attempt failed");
                last = Some(e);
            }
        }
    }
    let err = last.unwrap_or_else(|| std::io::ErrorKind::AddrNotAvailable.into());
    Err(GensioError::open("bind", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nobody;

    impl AccepterEvent for Nobody {
        fn new_connection(&self, _io: Gensio) {}
    }

    #[test]
    fn only_network_transports_accept() {
        let sel = Selector::new();
        assert!(Accepter::new("stdio,cat", &sel, Arc::new(Nobody)).is_err());
        assert!(Accepter::new("file(outfile=/tmp/x)", &sel, Arc::new(Nobody)).is_err());
        let acc = Accepter::new("telnet,tcp,0", &sel, Arc::new(Nobody)).unwrap();
        assert_eq!(acc.state(), AccepterState::Created);
        assert!(matches!(acc.control(true, ControlOp::LPort, ""), Err(GensioError::NotReady)));
        assert!(matches!(acc.str_to_gensio("tcp,localhost,1", None), Err(GensioError::NotReady)));
    }

    #[tokio::test]
    async fn startup_once_then_stop() {
        let sel = Selector::new();
        let acc = Accepter::new("tcp,localhost,0", &sel, Arc::new(Nobody)).unwrap();
        acc.startup().await.unwrap();
        assert!(acc.local_port().unwrap() > 0);
        assert_eq!(
            acc.control(true, ControlOp::LPort, "").unwrap(),
            acc.local_port().unwrap().to_string()
        );
        assert!(matches!(acc.startup().await, Err(GensioError::NotReady)));
        assert!(matches!(
            acc.str_to_gensio("udp,localhost,1", None),
            Err(GensioError::InvalidConfig(_))
        ));
        acc.shutdown().await;
        assert_eq!(acc.state(), AccepterState::Stopped);
        assert!(matches!(acc.startup().await, Err(GensioError::NotReady)));
    }

    #[tokio::test]
    async fn wildcard_prefers_dual_stack() {
        let net = NetAddr::parse(&["0".to_string()]).unwrap();
        let addrs = bind_addrs(&net).await.unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv6());
        let net = NetAddr::parse(&["ipv4".to_string(), "0".to_string()]).unwrap();
        assert_eq!(bind_addrs(&net).await.unwrap(), vec![SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))]);
    }
}
