//! Serial-port control on a stream: RFC2217 over telnet, or a local
//! serial device.

use tokio::sync::oneshot;

use crate::error::{GensioError, Result};
use crate::filter::{Role, SerialNotify};
use crate::gensio::{lock, Gensio, StreamState};
use crate::net::with_control;
use crate::serial::{SerialDone, SerialOp};

macro_rules! serial_setters {
    ($($(#[$doc:meta])* $name:ident, $name_s:ident => $op:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&self, value: u32, done: Option<SerialDone>) -> Result<()> {
                self.request(SerialOp::$op, value, done)
            }

            pub async fn $name_s(&self, value: u32) -> Result<u32> {
                self.request_s(SerialOp::$op, value).await
            }
        )*
    };
}

/// Serial view of a [`Gensio`], from [`Gensio::sergensio`].
///
/// A value of 0 queries the current setting. On a telnet client the
/// completion carries the value the server applied; on a telnet server the
/// setter is the acknowledgment and completes at once.
#[derive(Debug, Clone)]
pub struct SerGensio {
    io: Gensio,
    telnet: bool,
}

impl SerGensio {
    pub(crate) fn new(io: Gensio) -> Self {
        let telnet = io.shared.plan.factories.iter().any(|f| f.is_serial());
        Self { io, telnet }
    }

    pub fn io(&self) -> &Gensio {
        &self.io
    }

    serial_setters! {
        /// Bits per second.
        baud, baud_s => Baud;
        datasize, datasize_s => DataSize;
        parity, parity_s => Parity;
        stopbits, stopbits_s => StopBits;
        flowcontrol, flowcontrol_s => FlowControl;
        iflowcontrol, iflowcontrol_s => IFlowControl;
        /// Break on/off.
        sbreak, sbreak_s => SBreak;
        dtr, dtr_s => Dtr;
        rts, rts_s => Rts;
    }

    fn check_open(&self) -> Result<()> {
        match lock(&self.io.shared.inner).state {
            StreamState::Open => Ok(()),
            StreamState::Closing | StreamState::Closed => Err(GensioError::LocalClosed),
            StreamState::Unopened | StreamState::Opening => Err(GensioError::NotReady),
        }
    }

    fn request(&self, op: SerialOp, value: u32, done: Option<SerialDone>) -> Result<()> {
        op.check(value)?;
        self.check_open()?;
        let shared = &self.io.shared;

        if !self.telnet {
            let ctl = lock(&shared.inner).ctl.clone().ok_or(GensioError::NotReady)?;
            let applied = with_control(&ctl, |c| c.serial(op, value))?;
            tracing::trace!(gensio = %shared.id, %op, value, applied, "serial device set");
            if let Some(done) = done {
                shared.on_core(move || done(Ok(applied)));
            }
            return Ok(());
        }

        match shared.role {
            Role::Client => {
                // every request holds a slot so acks pair up FIFO
                let done = done.unwrap_or_else(|| Box::new(|_| {}));
                lock(&shared.inner)
                    .serial_waiting
                    .entry(op)
                    .or_default()
                    .push_back(done);
                let res = lock(&shared.stack).serial_request(op, value);
                if let Err(e) = res {
                    if let Some(q) = lock(&shared.inner).serial_waiting.get_mut(&op) {
                        q.pop_back();
                    }
                    return Err(e);
                }
            }
            Role::Server => {
                lock(&shared.stack).serial_request(op, value)?;
                if let Some(done) = done {
                    shared.on_core(move || done(Ok(value)));
                }
            }
        }
        shared.kick.notify_one();
        Ok(())
    }

    async fn request_s(&self, op: SerialOp, value: u32) -> Result<u32> {
        let (tx, rx) = oneshot::channel();
        self.request(
            op,
            value,
            Some(Box::new(move |res| {
                let _ = tx.send(res);
            })),
        )?;
        let bound = self.io.shared.selector.defaults().open_timeout();
        match tokio::time::timeout(bound, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(GensioError::LocalClosed),
            Err(_) => Err(GensioError::Timeout),
        }
    }

    fn notify(&self, notify: SerialNotify) -> Result<()> {
        if !self.telnet {
            return Err(GensioError::NotSupported);
        }
        self.check_open()?;
        lock(&self.io.shared.stack).serial_notify(&notify)?;
        self.io.shared.kick.notify_one();
        Ok(())
    }

    /// Report modem lines to the client (telnet server).
    pub fn modemstate(&self, bits: u8) -> Result<()> {
        self.notify(SerialNotify::ModemState(bits))
    }

    /// Report line state to the client (telnet server).
    pub fn linestate(&self, bits: u8) -> Result<()> {
        self.notify(SerialNotify::LineState(bits))
    }

    pub fn flow_state(&self, suspend: bool) -> Result<()> {
        self.notify(SerialNotify::FlowState(suspend))
    }

    pub fn signature(&self, signature: &str) -> Result<()> {
        self.notify(SerialNotify::Signature(signature.to_owned()))
    }

    /// Select which modem-state changes are reported.
    pub fn modemstate_mask(&self, mask: u8) -> Result<()> {
        if self.telnet {
            return self.notify(SerialNotify::ModemMask(mask));
        }
        lock(&self.io.shared.modem).set_mask(mask);
        self.io.shared.kick.notify_one();
        Ok(())
    }
}
