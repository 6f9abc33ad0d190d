//! The per-stream task: owns the link, drives the filter stack and runs
//! every callback.
//!
//! ```text
//! connect ─▶ build filters ─▶ handshake ─▶ serve ─▶ finish
//!                               (opening)    │
//!                     cmds | link rx | link tx permit | kick | redeliver
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::error::{GensioError, Result};
use crate::filter::{ConnCtx, FilterEvent, FilterStack};
use crate::gensio::{lock, Connector, Gensio, GensioId, Shared, StreamState};
use crate::net::{self, Aux, Incoming, Link, Outgoing, LINK_QUEUE};
use crate::os::Selector;
use crate::serial::ModemState;

pub(crate) enum Command {
    Close,
    /// Run on the stream's task (serial completions).
    Complete(Box<dyn FnOnce() + Send>),
}

pub(crate) enum LinkSource {
    Connect,
    Prepared(Connector),
    Ready(Link),
}

enum Exit {
    Close,
    /// Every handle is gone.
    Dropped,
    /// Open did not complete.
    Failed(GensioError),
    Panicked,
}

pub(crate) struct Core {
    weak: Weak<Shared>,
    id: GensioId,
    selector: Selector,
    kick: Arc<Notify>,
    cmds: mpsc::UnboundedReceiver<Command>,
    /// Data for the application, OOB entries first.
    rq: VecDeque<(Bytes, Aux)>,
    rq_len: usize,
    /// Data for the link writer.
    pending: VecDeque<Outgoing>,
    opening: bool,
    filtered: bool,
    serial_link: bool,
    reads_started: bool,
    link_done: bool,
    /// Handshake failure, checked after each step.
    failure: Option<GensioError>,
    /// Why the inbound side ended; reported after the queued data.
    ended: Option<GensioError>,
    end_reported: bool,
    panicked: bool,
    /// Run another step without waiting for an event.
    again: bool,
}

impl Core {
    pub fn new(shared: &Arc<Shared>, cmds: mpsc::UnboundedReceiver<Command>) -> Self {
        Self {
            weak: Arc::downgrade(shared),
            id: shared.id,
            selector: shared.selector.clone(),
            kick: Arc::clone(&shared.kick),
            cmds,
            rq: VecDeque::new(),
            rq_len: 0,
            pending: VecDeque::new(),
            opening: true,
            filtered: false,
            serial_link: false,
            reads_started: false,
            link_done: false,
            failure: None,
            ended: None,
            end_reported: false,
            panicked: false,
            again: false,
        }
    }

    pub async fn run(mut self, source: LinkSource) {
        let Some(shared) = self.weak.upgrade() else {
            return;
        };
        let deadline = Instant::now() + shared.selector.defaults().open_timeout();
        let base = shared.plan.base.clone();
        let local = shared.local;
        drop(shared);

        let ready = match source {
            LinkSource::Ready(link) => Ok(link),
            LinkSource::Prepared(connector) => self.connect(connector, deadline).await,
            LinkSource::Connect => {
                let selector = self.selector.clone();
                let connector: Connector =
                    Box::pin(async move { net::connect(&base, &selector, local).await });
                self.connect(connector, deadline).await
            }
        };
        let mut link = match ready {
            Ok(link) => link,
            Err(exit) => return self.finish(None, exit).await,
        };
        let exit = match self.setup(&link) {
            Ok(()) => self.serve(&mut link, deadline).await,
            Err(e) => Exit::Failed(e),
        };
        self.finish(Some(link), exit).await;
    }

    async fn connect(&mut self, connector: Connector, deadline: Instant) -> std::result::Result<Link, Exit> {
        let connect = tokio::time::timeout_at(deadline, connector);
        tokio::pin!(connect);
        loop {
            tokio::select! {
                res = &mut connect => {
                    return match res {
                        Ok(Ok(link)) => Ok(link),
                        Ok(Err(e)) => Err(Exit::Failed(e)),
                        Err(_) => Err(Exit::Failed(GensioError::Timeout)),
                    };
                }
                cmd = self.cmds.recv() => match cmd {
                    None => return Err(Exit::Dropped),
                    Some(Command::Close) => return Err(Exit::Close),
                    Some(Command::Complete(f)) => {
                        self.call(f);
                    }
                },
            }
        }
    }

    /// Build this connection's filters and start their handshakes.
    fn setup(&mut self, link: &Link) -> Result<()> {
        let shared = self.weak.upgrade().ok_or(GensioError::LocalClosed)?;
        let ctx = ConnCtx {
            role: shared.role,
            host: shared.plan.base.net_addr().ok().and_then(|a| a.host),
            precert: shared.precert.clone(),
        };
        let layers = shared
            .plan
            .factories
            .iter()
            .map(|f| f.build(&ctx))
            .collect::<Result<Vec<_>>>()?;
        self.filtered = !layers.is_empty();
        self.serial_link = link.attrs.serial;
        {
            let mut inner = lock(&shared.inner);
            inner.attrs = Some(link.attrs);
            inner.ctl = Some(Arc::clone(&link.ctl));
        }
        tracing::debug!(
            gensio = %self.id,
            transport = %link.kind,
            filters = layers.len(),
            "link up"
        );
        let mut stack = FilterStack::new(layers);
        let started = stack.start();
        *lock(&shared.stack) = stack;
        started
    }

    async fn serve(&mut self, link: &mut Link, deadline: Instant) -> Exit {
        let read_buffer = self.selector.defaults().read_buffer;
        loop {
            if let Some(exit) = self.step() {
                return exit;
            }
            let want_read = !self.link_done && self.rq_len < read_buffer;
            let again = std::mem::take(&mut self.again);
            tokio::select! {
                cmd = self.cmds.recv() => match cmd {
                    None => return Exit::Dropped,
                    Some(Command::Close) => return Exit::Close,
                    Some(Command::Complete(f)) => {
                        self.call(f);
                    }
                },
                permit = link.tx.reserve(), if !self.pending.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(out) = self.pending.pop_front() {
                            permit.send(out);
                        }
                    }
                    Err(_) => {
                        self.pending.clear();
                        self.end(GensioError::RemoteClosed);
                    }
                },
                incoming = link.rx.recv(), if want_read => self.incoming(incoming),
                _ = self.kick.notified() => {}
                _ = tokio::time::sleep_until(deadline), if self.opening => {
                    return Exit::Failed(GensioError::Timeout);
                }
                _ = tokio::task::yield_now(), if again => {}
            }
        }
    }

    /// Everything that doesn't wait: route stack output, move queued writes,
    /// deliver callbacks.
    fn step(&mut self) -> Option<Exit> {
        let Some(shared) = self.weak.upgrade() else {
            return Some(Exit::Dropped);
        };
        let io = Gensio { shared };
        self.absorb(&io);
        if self.opening {
            if let Some(e) = self.failure.take() {
                return Some(Exit::Failed(e));
            }
            if !lock(&io.shared.stack).is_open() {
                return self.panicked.then_some(Exit::Panicked);
            }
            self.opened(&io);
        }
        self.pull_xmit(&io, true);
        if let Some(e) = &self.ended {
            lock(&io.shared.inner).error.get_or_insert_with(|| e.clone());
        }
        self.deliver(&io);
        self.panicked.then_some(Exit::Panicked)
    }

    fn opened(&mut self, io: &Gensio) {
        self.opening = false;
        let done = {
            let mut inner = lock(&io.shared.inner);
            if inner.state == StreamState::Opening {
                io.shared.set_state(&mut inner, StreamState::Open);
            }
            inner.open_done.take()
        };
        tracing::debug!(gensio = %self.id, "open");
        if let Some(done) = done {
            self.call(|| done(Ok(())));
        }
    }

    /// Run a user callback inside the panic guard.
    fn call<R>(&mut self, f: impl FnOnce() -> R) -> Option<R> {
        let res = self.selector.guard(&self.id, f);
        if res.is_none() {
            self.panicked = true;
        }
        res
    }

    fn queue_read(&mut self, data: Bytes, aux: Aux) {
        if data.is_empty() {
            return;
        }
        self.rq_len += data.len();
        if aux.oob {
            self.rq.push_front((data, aux));
        } else {
            self.rq.push_back((data, aux));
        }
    }

    fn end(&mut self, err: GensioError) {
        self.link_done = true;
        if self.opening {
            let err = match err {
                GensioError::CommError(_) => err,
                other => GensioError::comm(format!("connection lost during handshake: {other}")),
            };
            self.failure.get_or_insert(err);
        } else if self.ended.is_none() {
            tracing::debug!(gensio = %self.id, reason = %err, "inbound side ended");
            self.ended = Some(err);
        }
    }

    fn incoming(&mut self, event: Option<Incoming>) {
        match event {
            Some(Incoming::Data { data, aux }) => {
                if !self.filtered {
                    self.queue_read(data, aux);
                    return;
                }
                let Some(shared) = self.weak.upgrade() else {
                    return;
                };
                let res = lock(&shared.stack).from_below(&data);
                if let Err(e) = res {
                    if self.opening {
                        self.failure.get_or_insert(e);
                    } else {
                        self.end(e);
                    }
                }
            }
            Some(Incoming::Modem(bits)) => {
                if let Some(shared) = self.weak.upgrade() {
                    lock(&shared.modem).sample(bits);
                }
            }
            Some(Incoming::Closed) | None => self.end(GensioError::RemoteClosed),
            Some(Incoming::Error(e)) => self.end(e),
        }
    }

    /// Route what the filter stack produced since the last call.
    fn absorb(&mut self, io: &Gensio) {
        let out = lock(&io.shared.stack).take_output();
        if !out.down.is_empty() {
            self.pending.push_back(Outgoing::Data {
                data: Bytes::from(out.down),
                aux: Aux::default(),
            });
        }
        if !out.up.is_empty() {
            self.queue_read(Bytes::from(out.up), Aux::default());
        }
        for event in out.events {
            self.filter_event(io, event);
        }
        if out.eof {
            self.end(GensioError::RemoteClosed);
        }
    }

    /// Move application writes into the stack. `bounded` keeps the link
    /// queue short so backpressure reaches `write`.
    fn pull_xmit(&mut self, io: &Gensio, bounded: bool) {
        let mut freed = false;
        while !bounded || self.pending.len() < LINK_QUEUE {
            let next = {
                let mut inner = lock(&io.shared.inner);
                let next = inner.xmit.pop_front();
                if let Some((data, _)) = &next {
                    inner.xmit_len -= data.len();
                }
                next
            };
            let Some((data, aux)) = next else {
                break;
            };
            freed = true;
            if !self.filtered {
                let out = Outgoing::Data { data, aux };
                if aux.oob {
                    self.pending.push_front(out);
                } else {
                    self.pending.push_back(out);
                }
                continue;
            }
            let res = lock(&io.shared.stack).from_above(&data);
            if let Err(e) = res {
                lock(&io.shared.inner).error.get_or_insert(e);
                break;
            }
            self.absorb(io);
        }
        if freed {
            io.shared.space.notify_waiters();
        }
    }

    fn deliver(&mut self, io: &Gensio) {
        let Some(handler) = io.shared.handler() else {
            return;
        };
        let reads_enabled = loop {
            let (enabled, open) = {
                let inner = lock(&io.shared.inner);
                (inner.read_enabled, inner.state == StreamState::Open)
            };
            if !open || self.panicked {
                return;
            }
            if !enabled {
                break false;
            }
            if !self.reads_started {
                self.reads_started = true;
                lock(&io.shared.modem).reset();
            }
            let Some((data, aux)) = self.rq.pop_front() else {
                break true;
            };
            let len = data.len();
            let used = self
                .call(|| handler.read(io, Ok(&data[..]), &aux))
                .unwrap_or(len)
                .min(len);
            self.rq_len -= used;
            if used < len {
                self.rq.push_front((data.slice(used..), aux));
                self.again = true;
                break true;
            }
        };

        if reads_enabled && self.rq.is_empty() && !self.end_reported {
            if let Some(err) = self.ended.clone() {
                self.end_reported = true;
                self.call(|| handler.read(io, Err(&err), &Aux::default()));
            }
        }
        if reads_enabled && self.serial_link {
            let report = lock(&io.shared.modem).report();
            if let Some(state) = report {
                self.call(|| handler.modemstate(io, state));
            }
        }

        let write_ready = {
            let inner = lock(&io.shared.inner);
            inner.write_enabled
                && inner.error.is_none()
                && inner.xmit_len < self.selector.defaults().write_buffer
                && self.pending.len() < LINK_QUEUE
        };
        if write_ready && !self.panicked {
            self.call(|| handler.write_ready(io));
            self.again = true;
        }
    }

    fn filter_event(&mut self, io: &Gensio, event: FilterEvent) {
        let (live, reads) = {
            let inner = lock(&io.shared.inner);
            (
                matches!(inner.state, StreamState::Opening | StreamState::Open),
                inner.read_enabled,
            )
        };
        if !live {
            return;
        }
        let handler = io.shared.handler();
        match event {
            FilterEvent::SerialAck(op, value) => {
                let done = lock(&io.shared.inner)
                    .serial_waiting
                    .get_mut(&op)
                    .and_then(|q| q.pop_front());
                match done {
                    Some(done) => {
                        self.call(|| done(Ok(value)));
                    }
                    None => tracing::debug!(gensio = %self.id, %op, value, "unsolicited serial ack"),
                }
            }
            FilterEvent::SerialRequest(op, value) => {
                let ack = match &handler {
                    Some(h) => self.call(|| h.serial_request(io, op, value)).flatten(),
                    None => Some(value),
                };
                if let Some(ack) = ack {
                    if let Err(e) = lock(&io.shared.stack).serial_request(op, ack) {
                        tracing::debug!(gensio = %self.id, %op, error = %e, "serial ack failed");
                    }
                    self.again = true;
                }
            }
            other => {
                let Some(h) = handler else {
                    return;
                };
                match other {
                    FilterEvent::Modem(bits) if reads => {
                        self.call(|| h.modemstate(io, ModemState::from_bits(bits)));
                    }
                    FilterEvent::LineState(bits) if reads => {
                        self.call(|| h.linestate(io, bits));
                    }
                    FilterEvent::Signature(sig) => {
                        self.call(|| h.signature(io, &sig));
                    }
                    FilterEvent::Break => {
                        self.call(|| h.send_break(io));
                    }
                    FilterEvent::FlowState(enabled) => {
                        self.call(|| h.flow_state(io, enabled));
                    }
                    _ => {}
                }
            }
        }
    }

    async fn flush(&mut self, link: &mut Link, grace: Duration) {
        let pending = &mut self.pending;
        let sent = tokio::time::timeout(grace, async {
            while let Some(out) = pending.pop_front() {
                if link.tx.send(out).await.is_err() {
                    break;
                }
            }
        })
        .await;
        if sent.is_err() {
            tracing::debug!(gensio = %self.id, "pending writes dropped at close");
        }
    }

    async fn finish(mut self, link: Option<Link>, exit: Exit) {
        let grace = self.selector.defaults().close_timeout();
        let shared = self.weak.upgrade();
        match &exit {
            Exit::Failed(e) => tracing::debug!(gensio = %self.id, error = %e, "open failed"),
            Exit::Dropped => tracing::debug!(gensio = %self.id, "all handles dropped"),
            Exit::Panicked => tracing::debug!(gensio = %self.id, "closing after callback panic"),
            Exit::Close => tracing::debug!(gensio = %self.id, "closing"),
        }

        if let Some(shared) = &shared {
            if matches!(exit, Exit::Close) && !self.opening {
                let io = Gensio {
                    shared: Arc::clone(shared),
                };
                self.pull_xmit(&io, false);
                lock(&shared.stack).close();
            }
            // trailers and alerts only; nothing goes up after this point
            let out = lock(&shared.stack).take_output();
            if !out.down.is_empty() {
                self.pending.push_back(Outgoing::Data {
                    data: Bytes::from(out.down),
                    aux: Aux::default(),
                });
            }
        }
        if let Some(mut link) = link {
            self.flush(&mut link, grace).await;
            link.shutdown(grace).await;
        }

        let Some(shared) = shared else {
            return;
        };
        let (open_done, close_done, serial, guard) = {
            let mut inner = lock(&shared.inner);
            shared.set_state(&mut inner, StreamState::Closed);
            inner.xmit.clear();
            inner.xmit_len = 0;
            inner.error.get_or_insert(GensioError::LocalClosed);
            inner.ctl = None;
            (
                inner.open_done.take(),
                std::mem::take(&mut inner.close_done),
                std::mem::take(&mut inner.serial_waiting),
                inner.guard.take(),
            )
        };
        drop(guard);

        let open_err = match exit {
            Exit::Failed(e) => e,
            _ => GensioError::LocalClosed,
        };
        if let Some(done) = open_done {
            self.call(|| done(Err(open_err)));
        }
        for done in serial.into_values().flatten() {
            self.call(|| done(Err(GensioError::LocalClosed)));
        }
        for done in close_done {
            self.call(|| done(Ok(())));
        }
    }
}
