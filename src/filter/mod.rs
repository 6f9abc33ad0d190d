//! Protocol filters stacked over a transport.
//!
//! # Data Flow
//! ```text
//! application ─ul_write─▶ layer 0 ─▶ … ─▶ layer n-1 ─down─▶ transport
//! application ◀──up──── layer 0 ◀─ … ◀─ layer n-1 ◀─ll_read─ transport
//! ```
//!
//! Filters are sans-IO: each call writes into a [`FilterIo`] and the
//! [`FilterStack`] routes those bytes to the neighbouring layers. Handshakes
//! run innermost first; a layer is set up once the layer under it is open.

pub mod certauth;
pub mod rfc2217;
pub mod telnet;
pub mod tls;
pub mod trace;
pub(crate) mod x509;

use std::fmt;
use std::sync::Arc;

use crate::addr::{FilterKind, FilterSpec};
use crate::control::ControlOp;
use crate::error::{GensioError, Result};
use crate::os::Selector;
use crate::serial::SerialOp;

/// Which side of the connection a stack plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// `mode=client|server` overrides the role implied by connect/accept.
    pub(crate) fn from_args(spec: &FilterSpec, default: Role) -> Result<Role> {
        match spec.args.value("mode") {
            None => Ok(default),
            Some(m) if m.eq_ignore_ascii_case("client") => Ok(Role::Client),
            Some(m) if m.eq_ignore_ascii_case("server") => Ok(Role::Server),
            Some(m) => Err(GensioError::config(format!("{}: bad mode '{m}'", spec.kind.name()))),
        }
    }
}

/// Out-of-band happenings a filter reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FilterEvent {
    /// Full modem state byte as sent by a telnet server.
    Modem(u8),
    LineState(u8),
    /// Server side: the client asked for a serial change.
    SerialRequest(SerialOp, u32),
    /// Client side: the server reported the value in effect.
    SerialAck(SerialOp, u32),
    Signature(String),
    Break,
    FlowState(bool),
}

/// Serial notifications the application pushes down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SerialNotify {
    ModemState(u8),
    LineState(u8),
    ModemMask(u8),
    FlowState(bool),
    Signature(String),
}

/// Per-call output of a filter.
#[derive(Debug, Default)]
pub(crate) struct FilterIo {
    /// Bytes for the layer above (or the application).
    pub up: Vec<u8>,
    /// Bytes for the layer below (or the transport).
    pub down: Vec<u8>,
    pub events: Vec<FilterEvent>,
    /// The layer saw an orderly end of its stream.
    pub eof: bool,
}

/// Access handed to the accepter's `precert_verify` hook.
///
/// The hook may replace the CA used to check the peer before verification
/// happens.
#[derive(Debug)]
pub struct CertVerify {
    layer: FilterKind,
    username: Option<String>,
    peer_cert: Option<Vec<u8>>,
    ca: Option<String>,
}

impl CertVerify {
    pub(crate) fn new(layer: FilterKind, ca: Option<String>) -> Self {
        Self {
            layer,
            username: None,
            peer_cert: None,
            ca,
        }
    }

    pub(crate) fn with_peer(mut self, username: Option<String>, peer_cert: Option<Vec<u8>>) -> Self {
        self.username = username;
        self.peer_cert = peer_cert;
        self
    }

    pub(crate) fn into_ca(self) -> Option<String> {
        self.ca
    }

    /// The filter layer doing the verification.
    pub fn layer(&self) -> FilterKind {
        self.layer
    }

    pub fn control(&mut self, get: bool, op: ControlOp, data: &str) -> Result<String> {
        match (op, get) {
            (ControlOp::CertAuth, false) => {
                tls::load_roots(data)?;
                self.ca = Some(data.to_string());
                Ok(String::new())
            }
            (ControlOp::CertAuth, true) => self.ca.clone().ok_or(GensioError::NotReady),
            (ControlOp::Username, true) => self.username.clone().ok_or(GensioError::NotReady),
            (ControlOp::GetPeerCertName, true) => match &self.peer_cert {
                Some(der) => x509::peer_cert_name(der, data),
                None => Err(GensioError::NotReady),
            },
            (ControlOp::Cert, true) => match &self.peer_cert {
                Some(der) => Ok(x509::to_pem(der)),
                None => Err(GensioError::NotReady),
            },
            _ => Err(GensioError::NotSupported),
        }
    }
}

/// Called by server-side authenticating filters before checking the peer.
pub(crate) type PrecertHook = Arc<dyn Fn(&mut CertVerify) -> Result<()> + Send + Sync>;

/// Run the hook; `NotSupported` keeps the static configuration.
pub(crate) fn run_precert(hook: Option<&PrecertHook>, cv: &mut CertVerify) -> Result<()> {
    match hook {
        None => Ok(()),
        Some(hook) => match hook(cv) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_supported() => Ok(()),
            Err(e) => Err(GensioError::comm(format!("certificate verify hook: {e}"))),
        },
    }
}

/// Per-connection facts the factories need.
#[derive(Clone)]
pub(crate) struct ConnCtx {
    pub role: Role,
    /// Host named by the base transport, for TLS server name checks.
    pub host: Option<String>,
    pub precert: Option<PrecertHook>,
}

impl fmt::Debug for ConnCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnCtx")
            .field("role", &self.role)
            .field("host", &self.host)
            .field("precert", &self.precert.is_some())
            .finish()
    }
}

pub(crate) trait Filter: Send {
    /// Start the handshake.
    fn setup(&mut self, _io: &mut FilterIo) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool;

    /// Bytes from the layer below.
    fn ll_read(&mut self, data: &[u8], io: &mut FilterIo) -> Result<()>;

    /// Bytes from the layer above.
    fn ul_write(&mut self, data: &[u8], io: &mut FilterIo) -> Result<()>;

    fn control(&mut self, _get: bool, _op: ControlOp, _data: &str, _io: &mut FilterIo) -> Result<String> {
        Err(GensioError::NotSupported)
    }

    /// Whether this layer carries serial control (telnet with RFC2217).
    fn is_serial(&self) -> bool {
        false
    }

    /// Client: send a request. Server: send the acknowledgment.
    fn serial_request(&mut self, _op: SerialOp, _value: u32, _io: &mut FilterIo) -> Result<()> {
        Err(GensioError::NotSupported)
    }

    fn serial_notify(&mut self, _notify: &SerialNotify, _io: &mut FilterIo) -> Result<()> {
        Err(GensioError::NotSupported)
    }

    /// Emit any closing trailer.
    fn close(&mut self, _io: &mut FilterIo) {}

    fn is_authenticated(&self) -> bool {
        false
    }

    fn is_encrypted(&self) -> bool {
        false
    }
}

/// Everything a stack operation produced for the core to act on.
#[derive(Debug, Default)]
pub(crate) struct StackOutput {
    pub up: Vec<u8>,
    pub down: Vec<u8>,
    pub events: Vec<FilterEvent>,
    pub eof: bool,
}

/// The layers of one connection, outermost first.
pub(crate) struct FilterStack {
    layers: Vec<Box<dyn Filter>>,
    /// Layers set up so far, counted from the bottom.
    started: usize,
    out: StackOutput,
}

impl FilterStack {
    pub fn new(layers: Vec<Box<dyn Filter>>) -> Self {
        Self {
            layers,
            started: 0,
            out: StackOutput::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.started == self.layers.len() && self.layers.iter().all(|l| l.is_open())
    }

    pub fn is_authenticated(&self) -> bool {
        self.layers.iter().any(|l| l.is_authenticated())
    }

    pub fn is_encrypted(&self) -> bool {
        self.layers.iter().any(|l| l.is_encrypted())
    }

    /// Drain everything produced since the last call.
    pub fn take_output(&mut self) -> StackOutput {
        std::mem::take(&mut self.out)
    }

    /// Begin the handshakes with the innermost layer.
    pub fn start(&mut self) -> Result<()> {
        let res = self.advance();
        self.handshake_err(res)
    }

    /// Transport data entering the innermost layer.
    pub fn from_below(&mut self, data: &[u8]) -> Result<()> {
        let res = match self.layers.len() {
            0 => {
                self.out.up.extend_from_slice(data);
                Ok(())
            }
            n => self.feed_up(n - 1, data),
        };
        self.handshake_err(res)
    }

    /// Application data entering the outermost layer.
    pub fn from_above(&mut self, data: &[u8]) -> Result<()> {
        self.feed_down(0, data)
    }

    pub fn control(&mut self, depth: usize, get: bool, op: ControlOp, data: &str) -> Result<String> {
        let layer = self
            .layers
            .get_mut(depth)
            .ok_or_else(|| GensioError::OutOfRange(format!("no filter at depth {depth}")))?;
        let mut io = FilterIo::default();
        let res = layer.control(get, op, data, &mut io);
        self.route(depth, io)?;
        res
    }

    pub fn serial_request(&mut self, op: SerialOp, value: u32) -> Result<()> {
        let idx = self.serial_layer()?;
        let mut io = FilterIo::default();
        let res = self.layers[idx].serial_request(op, value, &mut io);
        self.route(idx, io)?;
        res
    }

    pub fn serial_notify(&mut self, notify: &SerialNotify) -> Result<()> {
        let idx = self.serial_layer()?;
        let mut io = FilterIo::default();
        let res = self.layers[idx].serial_notify(notify, &mut io);
        self.route(idx, io)?;
        res
    }

    /// Let every layer emit its trailer, outermost first.
    pub fn close(&mut self) {
        for idx in 0..self.layers.len() {
            let mut io = FilterIo::default();
            self.layers[idx].close(&mut io);
            if let Err(e) = self.route(idx, io) {
                tracing::debug!(layer = idx, error = %e, "close trailer failed");
            }
        }
    }

    fn serial_layer(&self) -> Result<usize> {
        self.layers
            .iter()
            .position(|l| l.is_serial())
            .ok_or(GensioError::NotSupported)
    }

    fn handshake_err(&self, res: Result<()>) -> Result<()> {
        match res {
            Err(e) if !self.is_open() && !matches!(e, GensioError::CommError(_)) => {
                Err(GensioError::comm(e.to_string()))
            }
            other => other,
        }
    }

    /// Set up the next layer for as long as the one below it is open.
    fn advance(&mut self) -> Result<()> {
        let n = self.layers.len();
        while self.started < n {
            if self.started > 0 && !self.layers[n - self.started].is_open() {
                break;
            }
            let idx = n - 1 - self.started;
            self.started += 1;
            tracing::debug!(layer = idx, "filter setup");
            let mut io = FilterIo::default();
            let res = self.layers[idx].setup(&mut io);
            self.route(idx, io)?;
            res?;
        }
        Ok(())
    }

    fn feed_up(&mut self, idx: usize, data: &[u8]) -> Result<()> {
        let mut io = FilterIo::default();
        let res = self.layers[idx].ll_read(data, &mut io);
        // output (alerts included) is routed even when the layer failed
        let routed = self.route(idx, io);
        res.and(routed)
    }

    fn feed_down(&mut self, idx: usize, data: &[u8]) -> Result<()> {
        if idx == self.layers.len() {
            self.out.down.extend_from_slice(data);
            return Ok(());
        }
        let mut io = FilterIo::default();
        let res = self.layers[idx].ul_write(data, &mut io);
        let routed = self.route(idx, io);
        res.and(routed)
    }

    fn route(&mut self, idx: usize, io: FilterIo) -> Result<()> {
        if !io.down.is_empty() {
            self.feed_down(idx + 1, &io.down)?;
        }
        self.out.events.extend(io.events);
        self.advance()?;
        if !io.up.is_empty() {
            if idx == 0 {
                self.out.up.extend_from_slice(&io.up);
            } else {
                self.feed_up(idx - 1, &io.up)?;
            }
        }
        if io.eof {
            self.out.eof = true;
        }
        Ok(())
    }
}

/// Builds one filter per connection from a parsed layer; file-backed
/// material is loaded once.
#[derive(Clone)]
pub(crate) enum FilterFactory {
    Telnet(telnet::TelnetConfig),
    Tls(Arc<tls::TlsFactory>),
    CertAuth(Arc<certauth::CertAuthFactory>),
    Trace(Arc<trace::TraceFactory>),
}

impl FilterFactory {
    pub fn new(spec: &FilterSpec, selector: &Selector) -> Result<Self> {
        Ok(match spec.kind {
            FilterKind::Telnet => Self::Telnet(telnet::TelnetConfig::from_spec(spec)?),
            FilterKind::Ssl => Self::Tls(Arc::new(tls::TlsFactory::new(spec, selector)?)),
            FilterKind::CertAuth => Self::CertAuth(Arc::new(certauth::CertAuthFactory::new(spec, selector)?)),
            FilterKind::Trace => Self::Trace(Arc::new(trace::TraceFactory::new(spec)?)),
        })
    }

    pub fn build(&self, ctx: &ConnCtx) -> Result<Box<dyn Filter>> {
        Ok(match self {
            Self::Telnet(cfg) => Box::new(telnet::TelnetFilter::new(cfg, ctx)),
            Self::Tls(f) => Box::new(f.build(ctx)?),
            Self::CertAuth(f) => Box::new(f.build(ctx)?),
            Self::Trace(f) => Box::new(f.build()),
        })
    }

    /// Whether the built filter carries serial control.
    pub fn is_serial(&self) -> bool {
        matches!(self, Self::Telnet(cfg) if cfg.rfc2217)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Opens after seeing `ready` from below; frames writes as `[len]data`.
    struct Framer {
        open: bool,
    }

    impl Filter for Framer {
        fn setup(&mut self, io: &mut FilterIo) -> Result<()> {
            io.down.extend_from_slice(b"hi");
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn ll_read(&mut self, data: &[u8], io: &mut FilterIo) -> Result<()> {
            if !self.open {
                if data == b"ok" {
                    self.open = true;
                    return Ok(());
                }
                io.down.extend_from_slice(b"alert");
                return Err(GensioError::NotSupported);
            }
            io.up.extend_from_slice(&data[1..]);
            Ok(())
        }

        fn ul_write(&mut self, data: &[u8], io: &mut FilterIo) -> Result<()> {
            io.down.push(data.len() as u8);
            io.down.extend_from_slice(data);
            Ok(())
        }
    }

    fn framer() -> Box<dyn Filter> {
        Box::new(Framer { open: false })
    }

    #[test]
    fn handshake_runs_bottom_up() {
        let mut stack = FilterStack::new(vec![framer(), framer()]);
        stack.start().unwrap();
        // only the inner layer has started
        assert_eq!(stack.take_output().down, b"hi");
        stack.from_below(b"ok").unwrap();
        // the outer layer's hello is framed by the inner one
        assert_eq!(stack.take_output().down, b"\x02hi");
        assert!(!stack.is_open());
        stack.from_below(b"\x02ok").unwrap();
        assert!(stack.is_open());
    }

    #[test]
    fn data_passes_through_open_layers() {
        let mut stack = FilterStack::new(vec![framer()]);
        stack.start().unwrap();
        stack.from_below(b"ok").unwrap();
        stack.take_output();
        stack.from_above(b"abc").unwrap();
        assert_eq!(stack.take_output().down, b"\x03abc");
        stack.from_below(b"\x03xyz").unwrap();
        assert_eq!(stack.take_output().up, b"xyz");
    }

    #[test]
    fn failing_layer_output_is_flushed() {
        let mut stack = FilterStack::new(vec![framer()]);
        stack.start().unwrap();
        stack.take_output();
        let err = stack.from_below(b"nope").unwrap_err();
        assert!(matches!(err, GensioError::CommError(_)));
        assert_eq!(stack.take_output().down, b"alert");
    }

    #[test]
    fn empty_stack_is_open() {
        let mut stack = FilterStack::new(Vec::new());
        assert!(stack.is_open());
        stack.start().unwrap();
        stack.from_below(b"raw").unwrap();
        assert_eq!(stack.take_output().up, b"raw");
        assert!(stack.control(0, true, ControlOp::Cert, "").is_err());
    }
}
