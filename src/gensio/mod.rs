//! The stream handle applications operate on.
//!
//! # Data Flow
//! ```text
//! Gensio::write ──▶ xmit queue ──kick──▶ core ──▶ FilterStack ──▶ Link writer
//! Event::read  ◀── read queue ◀──────── core ◀── FilterStack ◀── Link reader
//! Gensio::control(depth) ──▶ filter layer | LinkControl
//! ```
//!
//! # Design Decisions
//! - One task per open stream owns the link and runs every callback
//! - Handles share an `Arc<Shared>`; the task keeps only a `Weak`, so it
//!   tears down when the last handle goes away
//! - Synchronous calls (write, control, serial setters) touch shared state
//!   under short locks and kick the task to act on the result

mod conn;
pub mod sergensio;
pub mod tracker;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Notify};

use crate::addr::{Args, BaseSpec, FilterKind, StackSpec, TransportKind};
use crate::control::ControlOp;
use crate::error::{GensioError, Result};
use crate::filter::{FilterFactory, FilterStack, PrecertHook, Role};
use crate::net::{self, with_control, Aux, Link, LinkAttrs, SharedControl};
use crate::os::Selector;
use crate::serial::{ModemState, ModemStateTracker, SerialDone, SerialOp};

use self::conn::{Command, Core, LinkSource};
pub use self::sergensio::SerGensio;
pub use self::tracker::{ConnectionGuard, ConnectionTracker, GensioId};

/// Completion of open or close.
pub type Done = Box<dyn FnOnce(Result<()>) + Send>;

/// Produces the link at open in place of a transport connect.
pub(crate) type Connector = Pin<Box<dyn Future<Output = Result<Link>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unopened,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Callbacks from a stream. All of them run on the stream's task.
pub trait Event: Send + Sync {
    /// Inbound data, or the error that ended the stream. Returns how many
    /// bytes were consumed; the rest is offered again.
    fn read(&self, io: &Gensio, data: Result<&[u8], &GensioError>, aux: &Aux) -> usize;

    /// Write space is available (while write callbacks are enabled).
    fn write_ready(&self, _io: &Gensio) {}

    fn modemstate(&self, _io: &Gensio, _state: ModemState) {}

    fn linestate(&self, _io: &Gensio, _bits: u8) {}

    /// A client asked a server-side telnet stream to change a serial
    /// setting. `Some(v)` acknowledges with `v`; `None` defers the
    /// acknowledgment to the matching [`SerGensio`] setter.
    fn serial_request(&self, _io: &Gensio, _op: SerialOp, value: u32) -> Option<u32> {
        Some(value)
    }

    fn signature(&self, _io: &Gensio, _signature: &str) {}

    fn send_break(&self, _io: &Gensio) {}

    fn flow_state(&self, _io: &Gensio, _enabled: bool) {}
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A parsed spec with its filter factories, shared by every stream an
/// accepter creates.
pub(crate) struct Plan {
    pub base: BaseSpec,
    pub filters: Vec<FilterKind>,
    pub factories: Vec<FilterFactory>,
}

impl Plan {
    pub fn new(spec: &str, selector: &Selector) -> Result<Self> {
        let parsed = StackSpec::parse(spec)?;
        net::check_args(&parsed.base)?;
        let factories = parsed
            .filters
            .iter()
            .map(|f| FilterFactory::new(f, selector))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            base: parsed.base,
            filters: parsed.filters.iter().map(|f| f.kind).collect(),
            factories,
        })
    }

    /// A transport with no filters (secondary channels).
    pub fn bare(base: BaseSpec) -> Self {
        Self {
            base,
            filters: Vec::new(),
            factories: Vec::new(),
        }
    }

    fn has_serial(&self) -> bool {
        self.factories.iter().any(|f| f.is_serial()) || self.base.kind == TransportKind::SerialDev
    }
}

/// Mutable stream state guarded by one lock.
pub(crate) struct Inner {
    pub state: StreamState,
    pub xmit: VecDeque<(Bytes, Aux)>,
    pub xmit_len: usize,
    /// Sticky failure returned by every later write.
    pub error: Option<GensioError>,
    pub read_enabled: bool,
    pub write_enabled: bool,
    pub attrs: Option<LinkAttrs>,
    pub ctl: Option<SharedControl>,
    /// Client serial requests awaiting the server's answer, FIFO per op.
    pub serial_waiting: HashMap<SerialOp, VecDeque<SerialDone>>,
    pub open_done: Option<Done>,
    pub close_done: Vec<Done>,
    pub guard: Option<ConnectionGuard>,
}

pub(crate) struct Shared {
    pub id: GensioId,
    pub selector: Selector,
    pub plan: Arc<Plan>,
    pub role: Role,
    /// Source address for accepter-sourced client streams.
    pub local: Option<SocketAddr>,
    pub precert: Option<PrecertHook>,
    pub connector: Mutex<Option<Connector>>,
    pub inner: Mutex<Inner>,
    pub stack: Mutex<FilterStack>,
    pub modem: Mutex<ModemStateTracker>,
    pub handler: RwLock<Option<Arc<dyn Event>>>,
    pub kick: Arc<Notify>,
    /// Signalled whenever write space frees up or the state changes.
    pub space: Notify,
    pub state_tx: watch::Sender<StreamState>,
    pub cmds: mpsc::UnboundedSender<Command>,
    pub core_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl Shared {
    pub fn handler(&self) -> Option<Arc<dyn Event>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Must be called with `inner` locked.
    pub fn set_state(&self, inner: &mut Inner, state: StreamState) {
        inner.state = state;
        self.state_tx.send_replace(state);
        self.space.notify_waiters();
    }

    /// Run `f` on the stream's task.
    pub fn on_core(&self, f: impl FnOnce() + Send + 'static) {
        if let Err(mpsc::error::SendError(Command::Complete(f))) = self.cmds.send(Command::Complete(Box::new(f))) {
            // no task left to run it
            let _ = self.selector.guard(&self.id, f);
        }
    }
}

/// Clonable handle to one stream.
#[derive(Clone)]
pub struct Gensio {
    pub(crate) shared: Arc<Shared>,
}

impl Gensio {
    /// Parse `spec` and prepare the stream. No I/O happens until `open`.
    pub fn new(spec: &str, selector: &Selector, handler: Option<Arc<dyn Event>>) -> Result<Self> {
        let plan = Arc::new(Plan::new(spec, selector)?);
        Ok(Self::build(selector, plan, Role::Client, None, None, handler))
    }

    /// A client stream whose socket is bound to an accepter's address.
    pub(crate) fn with_local(
        spec: &str,
        selector: &Selector,
        handler: Option<Arc<dyn Event>>,
        local: SocketAddr,
    ) -> Result<Self> {
        let plan = Arc::new(Plan::new(spec, selector)?);
        Ok(Self::build(selector, plan, Role::Client, Some(local), None, handler))
    }

    /// A client stream whose link comes from `connector` (udp accepter).
    pub(crate) fn with_connector(
        spec: &str,
        selector: &Selector,
        handler: Option<Arc<dyn Event>>,
        connector: Connector,
    ) -> Result<Self> {
        let plan = Arc::new(Plan::new(spec, selector)?);
        let io = Self::build(selector, plan, Role::Client, None, None, handler);
        *lock(&io.shared.connector) = Some(connector);
        Ok(io)
    }

    /// The server side of an accepted link. `done` fires once the
    /// handshakes finish.
    pub(crate) fn accepted(
        selector: &Selector,
        plan: Arc<Plan>,
        precert: Option<PrecertHook>,
        tracker: &ConnectionTracker,
        link: Link,
        done: Done,
    ) -> Result<Self> {
        let io = Self::build(selector, plan, Role::Server, None, precert, None);
        lock(&io.shared.inner).guard = Some(tracker.track(io.shared.id));
        io.start(LinkSource::Ready(link), done)?;
        Ok(io)
    }

    fn build(
        selector: &Selector,
        plan: Arc<Plan>,
        role: Role,
        local: Option<SocketAddr>,
        precert: Option<PrecertHook>,
        handler: Option<Arc<dyn Event>>,
    ) -> Self {
        let (cmds, core_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(StreamState::Unopened);
        let shared = Shared {
            id: GensioId::new(),
            selector: selector.clone(),
            plan,
            role,
            local,
            precert,
            connector: Mutex::new(None),
            inner: Mutex::new(Inner {
                state: StreamState::Unopened,
                xmit: VecDeque::new(),
                xmit_len: 0,
                error: None,
                read_enabled: false,
                write_enabled: false,
                attrs: None,
                ctl: None,
                serial_waiting: HashMap::new(),
                open_done: None,
                close_done: Vec::new(),
                guard: None,
            }),
            stack: Mutex::new(FilterStack::new(Vec::new())),
            modem: Mutex::new(ModemStateTracker::new()),
            handler: RwLock::new(handler),
            kick: Arc::new(Notify::new()),
            space: Notify::new(),
            state_tx,
            cmds,
            core_rx: Mutex::new(Some(core_rx)),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    fn start(&self, source: LinkSource, done: Done) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| GensioError::config("open needs a tokio runtime"))?;
        let mut inner = lock(&self.shared.inner);
        if inner.state != StreamState::Unopened {
            return Err(GensioError::NotReady);
        }
        let rx = lock(&self.shared.core_rx).take().ok_or(GensioError::NotReady)?;
        inner.open_done = Some(done);
        self.shared.set_state(&mut inner, StreamState::Opening);
        drop(inner);
        let core = Core::new(&self.shared, rx);
        runtime.spawn(core.run(source));
        Ok(())
    }

    /// Connect the transport and run the handshakes; `done` reports the
    /// outcome on the stream's task.
    pub fn open(&self, done: impl FnOnce(Result<()>) + Send + 'static) -> Result<()> {
        let source = match lock(&self.shared.connector).take() {
            Some(connector) => LinkSource::Prepared(connector),
            None => LinkSource::Connect,
        };
        self.start(source, Box::new(done))
    }

    pub async fn open_s(&self) -> Result<()> {
        let (waiter, slot) = (self.shared.selector.alloc_waiter(), Arc::new(Mutex::new(None)));
        let (w, s) = (waiter.clone(), Arc::clone(&slot));
        self.open(move |res| {
            *lock(&s) = Some(res);
            w.wake();
        })?;
        // the core enforces the open timeout; this bound only guards a lost wake
        let bound = self.shared.selector.defaults().open_timeout() * 2;
        waiter.wait(bound).await?;
        let res = lock(&slot).take();
        res.unwrap_or(Err(GensioError::LocalClosed))
    }

    /// Close every layer. Further calls after the first only wait for the
    /// same completion.
    pub fn close(&self, done: impl FnOnce(Result<()>) + Send + 'static) {
        let done: Done = Box::new(done);
        let mut inner = lock(&self.shared.inner);
        match inner.state {
            StreamState::Unopened => {
                self.shared.set_state(&mut inner, StreamState::Closed);
                drop(inner);
                let _ = self.shared.selector.guard(&self.shared.id, || done(Ok(())));
            }
            StreamState::Closed => {
                drop(inner);
                let _ = self.shared.selector.guard(&self.shared.id, || done(Ok(())));
            }
            StreamState::Closing => inner.close_done.push(done),
            StreamState::Opening | StreamState::Open => {
                inner.close_done.push(done);
                self.shared.set_state(&mut inner, StreamState::Closing);
                drop(inner);
                if self.shared.cmds.send(Command::Close).is_err() {
                    tracing::debug!(gensio = %self.shared.id, "close after the stream task ended");
                }
            }
        }
    }

    pub async fn close_s(&self) -> Result<()> {
        let (waiter, slot) = (self.shared.selector.alloc_waiter(), Arc::new(Mutex::new(None)));
        let (w, s) = (waiter.clone(), Arc::clone(&slot));
        self.close(move |res| {
            *lock(&s) = Some(res);
            w.wake();
        });
        let d = self.shared.selector.defaults();
        waiter.wait(d.open_timeout() + d.close_timeout()).await?;
        let res = lock(&slot).take();
        res.unwrap_or(Err(GensioError::LocalClosed))
    }

    /// Queue up to the free write-buffer space; returns the bytes taken.
    pub fn write(&self, data: &[u8], aux: &Aux) -> Result<usize> {
        let shared = &self.shared;
        let mut inner = lock(&shared.inner);
        match inner.state {
            StreamState::Open => {}
            StreamState::Closing | StreamState::Closed => return Err(GensioError::LocalClosed),
            StreamState::Unopened | StreamState::Opening => return Err(GensioError::NotReady),
        }
        if let Some(e) = &inner.error {
            return Err(e.clone());
        }
        let attrs = inner.attrs.unwrap_or_default();
        let filtered = !shared.plan.factories.is_empty();
        if let Some(index) = aux.stream {
            match attrs.streams {
                Some(_) if filtered => return Err(GensioError::NotSupported),
                Some((_, ostreams)) if index >= ostreams => {
                    return Err(GensioError::OutOfRange(format!(
                        "stream {index} with {ostreams} output streams"
                    )))
                }
                Some(_) => {}
                None => return Err(GensioError::NotSupported),
            }
        }
        let mut len = data.len();
        if aux.oob {
            if filtered || attrs.max_oob == 0 {
                return Err(GensioError::NotSupported);
            }
            len = len.min(attrs.max_oob);
        }
        let room = shared.selector.defaults().write_buffer.saturating_sub(inner.xmit_len);
        let n = len.min(room);
        if n == 0 {
            return Ok(0);
        }
        let chunk = (Bytes::copy_from_slice(&data[..n]), *aux);
        if aux.oob {
            inner.xmit.push_front(chunk);
        } else {
            inner.xmit.push_back(chunk);
        }
        inner.xmit_len += n;
        drop(inner);
        shared.kick.notify_one();
        Ok(n)
    }

    /// Wait for buffer space until all of `data` is queued.
    pub async fn write_s(&self, mut data: &[u8], aux: &Aux) -> Result<()> {
        let timeout = self.shared.selector.defaults().open_timeout();
        while !data.is_empty() {
            let notified = self.shared.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let n = self.write(data, aux)?;
            data = &data[n..];
            if n == 0 && tokio::time::timeout(timeout, notified).await.is_err() {
                return Err(GensioError::Timeout);
            }
        }
        Ok(())
    }

    pub fn read_cb_enable(&self, enabled: bool) {
        lock(&self.shared.inner).read_enabled = enabled;
        self.shared.kick.notify_one();
    }

    pub fn write_cb_enable(&self, enabled: bool) {
        lock(&self.shared.inner).write_enabled = enabled;
        self.shared.kick.notify_one();
    }

    pub fn set_handler(&self, handler: Arc<dyn Event>) {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
        self.shared.kick.notify_one();
    }

    /// Depth 0 is the outermost filter; the number of filters addresses
    /// the transport.
    pub fn control(&self, depth: usize, get: bool, op: ControlOp, data: &str) -> Result<String> {
        let nfilters = self.shared.plan.factories.len();
        if depth > nfilters {
            return Err(GensioError::OutOfRange(format!(
                "depth {depth} with {nfilters} filters"
            )));
        }
        if depth == nfilters {
            let ctl = lock(&self.shared.inner).ctl.clone().ok_or(GensioError::NotReady)?;
            return with_control(&ctl, |c| c.control(get, op, data));
        }
        let res = {
            let mut stack = lock(&self.shared.stack);
            if stack.is_empty() {
                return Err(GensioError::NotReady);
            }
            stack.control(depth, get, op, data)
        };
        self.shared.kick.notify_one();
        res
    }

    /// A secondary stream sharing this one's transport (stdio stderr).
    pub async fn open_channel_s(&self, args: &str, handler: Option<Arc<dyn Event>>) -> Result<Gensio> {
        let args = Args::parse(args)?;
        let ctl = lock(&self.shared.inner).ctl.clone().ok_or(GensioError::NotReady)?;
        let link = with_control(&ctl, |c| c.open_channel(&args))?;
        let plan = Arc::new(Plan::bare(self.shared.plan.base.clone()));
        let channel = Self::build(&self.shared.selector, plan, self.shared.role, None, None, handler);

        let (tx, rx) = tokio::sync::oneshot::channel();
        channel.start(
            LinkSource::Ready(link),
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        )?;
        rx.await.unwrap_or(Err(GensioError::LocalClosed))?;
        Ok(channel)
    }

    pub fn sergensio(&self) -> Option<SerGensio> {
        self.shared.plan.has_serial().then(|| SerGensio::new(self.clone()))
    }

    /// Layer name at `depth`, or `None` past the transport.
    pub fn get_type(&self, depth: usize) -> Option<&'static str> {
        let plan = &self.shared.plan;
        match depth.cmp(&plan.filters.len()) {
            std::cmp::Ordering::Less => Some(plan.filters[depth].name()),
            std::cmp::Ordering::Equal => Some(plan.base.kind.name()),
            std::cmp::Ordering::Greater => None,
        }
    }

    pub fn is_client(&self) -> bool {
        self.shared.role == Role::Client
    }

    /// Link attributes are known once the transport is up.
    pub fn is_reliable(&self) -> bool {
        lock(&self.shared.inner).attrs.is_some_and(|a| a.reliable)
    }

    pub fn is_packet(&self) -> bool {
        lock(&self.shared.inner).attrs.is_some_and(|a| a.packet)
    }

    pub fn is_authenticated(&self) -> bool {
        lock(&self.shared.stack).is_authenticated()
    }

    pub fn is_encrypted(&self) -> bool {
        lock(&self.shared.stack).is_encrypted()
    }

    pub fn id(&self) -> GensioId {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state_tx.borrow()
    }
}

impl fmt::Debug for Gensio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gensio")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("role", &self.shared.role)
            .finish_non_exhaustive()
    }
}
