//! Serial device transport on a local tty.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::io::Ready;
use tokio::sync::mpsc;

use crate::addr::{BaseSpec, TransportKind};
use crate::control::ControlOp;
use crate::error::{GensioError, Result};
use crate::net::{Aux, Incoming, Link, LinkAttrs, LinkControl, Outgoing, READ_CHUNK};
use crate::os::Selector;
use crate::serial::ops::*;
use crate::serial::settings::{parse_rs485, LineSettings, Rs485Config};
use crate::serial::{ModemState, SerialOp};

pub(crate) const OPTIONS: &[&str] = &[];

const TIOCGRS485: libc::c_ulong = 0x542e;
const TIOCSRS485: libc::c_ulong = 0x542f;

const SER_RS485_ENABLED: u32 = 1 << 0;
const SER_RS485_RTS_ON_SEND: u32 = 1 << 1;
const SER_RS485_RTS_AFTER_SEND: u32 = 1 << 2;
const SER_RS485_RX_DURING_TX: u32 = 1 << 4;
const SER_RS485_TERMINATE_BUS: u32 = 1 << 5;

#[repr(C)]
#[derive(Default)]
struct SerialRs485 {
    flags: u32,
    delay_rts_before_send: u32,
    delay_rts_after_send: u32,
    padding: [u32; 5],
}

const BAUD_TABLE: &[(u32, libc::speed_t)] = &[
    (50, libc::B50),
    (75, libc::B75),
    (110, libc::B110),
    (134, libc::B134),
    (150, libc::B150),
    (200, libc::B200),
    (300, libc::B300),
    (600, libc::B600),
    (1200, libc::B1200),
    (1800, libc::B1800),
    (2400, libc::B2400),
    (4800, libc::B4800),
    (9600, libc::B9600),
    (19200, libc::B19200),
    (38400, libc::B38400),
    (57600, libc::B57600),
    (115200, libc::B115200),
    (230400, libc::B230400),
    (460800, libc::B460800),
    (500000, libc::B500000),
    (576000, libc::B576000),
    (921600, libc::B921600),
    (1000000, libc::B1000000),
    (1152000, libc::B1152000),
    (1500000, libc::B1500000),
    (2000000, libc::B2000000),
    (2500000, libc::B2500000),
    (3000000, libc::B3000000),
    (3500000, libc::B3500000),
    (4000000, libc::B4000000),
];

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn get_termios(fd: RawFd) -> io::Result<libc::termios> {
    // SAFETY: termios is plain data, filled by tcgetattr.
    let mut t: libc::termios = unsafe { mem::zeroed() };
    cvt(unsafe { libc::tcgetattr(fd, &mut t) })?;
    Ok(t)
}

fn set_termios(fd: RawFd, t: &libc::termios) -> io::Result<()> {
    cvt(unsafe { libc::tcsetattr(fd, libc::TCSANOW, t) }).map(|_| ())
}

fn modify_termios(fd: RawFd, f: impl FnOnce(&mut libc::termios) -> Result<()>) -> Result<()> {
    let mut t = get_termios(fd)?;
    f(&mut t)?;
    set_termios(fd, &t)?;
    Ok(())
}

fn set_speed(t: &mut libc::termios, baud: u32) -> Result<()> {
    let speed = BAUD_TABLE
        .iter()
        .find(|(b, _)| *b == baud)
        .map(|(_, s)| *s)
        .ok_or_else(|| GensioError::OutOfRange(format!("baud {baud}")))?;
    // SAFETY: t is a valid termios.
    unsafe {
        libc::cfsetispeed(t, speed);
        libc::cfsetospeed(t, speed);
    }
    Ok(())
}

fn get_speed(t: &libc::termios) -> u32 {
    // SAFETY: t is a valid termios.
    let speed = unsafe { libc::cfgetospeed(t) };
    BAUD_TABLE.iter().find(|(_, s)| *s == speed).map(|(b, _)| *b).unwrap_or(0)
}

fn set_datasize(t: &mut libc::termios, size: u32) {
    let bits = match size {
        5 => libc::CS5,
        6 => libc::CS6,
        7 => libc::CS7,
        _ => libc::CS8,
    };
    t.c_cflag = (t.c_cflag & !libc::CSIZE) | bits;
}

fn get_datasize(t: &libc::termios) -> u32 {
    match t.c_cflag & libc::CSIZE {
        libc::CS5 => 5,
        libc::CS6 => 6,
        libc::CS7 => 7,
        _ => 8,
    }
}

fn set_parity(t: &mut libc::termios, parity: u32) {
    t.c_cflag &= !(libc::PARENB | libc::PARODD | libc::CMSPAR);
    t.c_cflag |= match parity {
        PARITY_ODD => libc::PARENB | libc::PARODD,
        PARITY_EVEN => libc::PARENB,
        PARITY_MARK => libc::PARENB | libc::PARODD | libc::CMSPAR,
        PARITY_SPACE => libc::PARENB | libc::CMSPAR,
        _ => 0,
    };
}

fn get_parity(t: &libc::termios) -> u32 {
    let f = t.c_cflag;
    if f & libc::PARENB == 0 {
        PARITY_NONE
    } else if f & libc::CMSPAR != 0 {
        if f & libc::PARODD != 0 {
            PARITY_MARK
        } else {
            PARITY_SPACE
        }
    } else if f & libc::PARODD != 0 {
        PARITY_ODD
    } else {
        PARITY_EVEN
    }
}

fn set_flow(t: &mut libc::termios, flow: u32) {
    t.c_cflag &= !libc::CRTSCTS;
    t.c_iflag &= !(libc::IXON | libc::IXOFF);
    match flow {
        FLOWCONTROL_RTSCTS => t.c_cflag |= libc::CRTSCTS,
        FLOWCONTROL_XONXOFF => t.c_iflag |= libc::IXON | libc::IXOFF,
        _ => {}
    }
}

fn get_flow(t: &libc::termios) -> u32 {
    if t.c_cflag & libc::CRTSCTS != 0 {
        FLOWCONTROL_RTSCTS
    } else if t.c_iflag & libc::IXON != 0 {
        FLOWCONTROL_XONXOFF
    } else {
        FLOWCONTROL_NONE
    }
}

fn configure(fd: RawFd, s: &LineSettings) -> Result<()> {
    modify_termios(fd, |t| {
        // SAFETY: t is a valid termios.
        unsafe { libc::cfmakeraw(t) };
        set_speed(t, s.baud)?;
        set_datasize(t, s.datasize);
        set_parity(t, s.parity);
        if s.stopbits == STOPBITS_2 {
            t.c_cflag |= libc::CSTOPB;
        } else {
            t.c_cflag &= !libc::CSTOPB;
        }
        set_flow(t, s.flowcontrol());
        t.c_cflag |= libc::CREAD;
        if s.local {
            t.c_cflag |= libc::CLOCAL;
        } else {
            t.c_cflag &= !libc::CLOCAL;
        }
        if s.hangup_when_done {
            t.c_cflag |= libc::HUPCL;
        } else {
            t.c_cflag &= !libc::HUPCL;
        }
        t.c_cc[libc::VMIN] = 1;
        t.c_cc[libc::VTIME] = 0;
        Ok(())
    })
}

fn modem_bits(fd: RawFd) -> io::Result<libc::c_int> {
    let mut bits: libc::c_int = 0;
    cvt(unsafe { libc::ioctl(fd, libc::TIOCMGET, &mut bits) })?;
    Ok(bits)
}

fn set_modem_bit(fd: RawFd, bit: libc::c_int, on: bool) -> io::Result<()> {
    let req = if on { libc::TIOCMBIS } else { libc::TIOCMBIC };
    cvt(unsafe { libc::ioctl(fd, req, &bit) }).map(|_| ())
}

fn to_modemstate(bits: libc::c_int) -> u8 {
    let mut state = 0;
    for (tiocm, flag) in [
        (libc::TIOCM_CTS, ModemState::CTS),
        (libc::TIOCM_DSR, ModemState::DSR),
        (libc::TIOCM_RNG, ModemState::RI),
        (libc::TIOCM_CAR, ModemState::CD),
    ] {
        if bits & tiocm != 0 {
            state |= flag;
        }
    }
    state
}

fn get_rs485(fd: RawFd) -> Result<Option<Rs485Config>> {
    let mut raw = SerialRs485::default();
    cvt(unsafe { libc::ioctl(fd, TIOCGRS485 as _, &mut raw) })?;
    if raw.flags & SER_RS485_ENABLED == 0 {
        return Ok(None);
    }
    Ok(Some(Rs485Config {
        delay_before: raw.delay_rts_before_send,
        delay_after: raw.delay_rts_after_send,
        rts_on_send: raw.flags & SER_RS485_RTS_ON_SEND != 0,
        rts_after_send: raw.flags & SER_RS485_RTS_AFTER_SEND != 0,
        rx_during_tx: raw.flags & SER_RS485_RX_DURING_TX != 0,
        terminate_bus: raw.flags & SER_RS485_TERMINATE_BUS != 0,
    }))
}

fn set_rs485(fd: RawFd, cfg: Option<&Rs485Config>) -> Result<()> {
    let mut raw = SerialRs485::default();
    if let Some(cfg) = cfg {
        raw.flags = SER_RS485_ENABLED;
        for (set, flag) in [
            (cfg.rts_on_send, SER_RS485_RTS_ON_SEND),
            (cfg.rts_after_send, SER_RS485_RTS_AFTER_SEND),
            (cfg.rx_during_tx, SER_RS485_RX_DURING_TX),
            (cfg.terminate_bus, SER_RS485_TERMINATE_BUS),
        ] {
            if set {
                raw.flags |= flag;
            }
        }
        raw.delay_rts_before_send = cfg.delay_before;
        raw.delay_rts_after_send = cfg.delay_after;
    }
    cvt(unsafe { libc::ioctl(fd, TIOCSRS485 as _, &raw) })?;
    Ok(())
}

struct Port {
    fd: AsyncFd<File>,
    settings: LineSettings,
    break_on: Mutex<bool>,
}

impl Port {
    fn raw(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

pub(crate) fn open(base: &BaseSpec, selector: &Selector) -> Result<Link> {
    let device = base
        .fields
        .first()
        .ok_or_else(|| GensioError::config("serialdev: missing device path"))?;
    let settings = LineSettings::parse(&base.fields[1..])?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(device)
        .map_err(|e| GensioError::open(device, e))?;
    let raw = file.as_raw_fd();
    configure(raw, &settings)?;
    if let Some(rs485) = &settings.rs485 {
        set_rs485(raw, Some(rs485))?;
    }
    if settings.nobreak {
        // SAFETY: raw is an open tty.
        unsafe { libc::ioctl(raw, libc::TIOCCBRK) };
    }
    tracing::debug!(device = %device, settings = %settings, "serial device open");

    let port = Arc::new(Port {
        fd: AsyncFd::new(file)?,
        settings,
        break_on: Mutex::new(false),
    });
    let attrs = LinkAttrs {
        reliable: true,
        serial: true,
        ..Default::default()
    };
    let ctl = SerialControl {
        port: Arc::clone(&port),
    };
    let (mut link, ends) = Link::new(TransportKind::SerialDev, attrs, Box::new(ctl));
    link.abort_on_close(tokio::spawn(reader(Arc::clone(&port), ends.incoming.clone())));
    link.abort_on_close(tokio::spawn(modem_poll(
        Arc::clone(&port),
        ends.incoming.clone(),
        selector.defaults().modem_poll(),
    )));
    link.drain_on_close(tokio::spawn(writer(port, ends.outgoing, ends.incoming)));
    Ok(link)
}

async fn reader(port: Arc<Port>, tx: mpsc::Sender<Incoming>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let event = read_event(&port, &mut buf).await.unwrap_or_else(|e| match e.raw_os_error() {
            // the other end of a pty went away
            Some(libc::EIO) => Incoming::Closed,
            _ => Incoming::Error(e.into()),
        });
        let last = matches!(event, Incoming::Closed | Incoming::Error(_));
        if tx.send(event).await.is_err() || last {
            return;
        }
    }
}

async fn read_event(port: &Port, buf: &mut [u8]) -> io::Result<Incoming> {
    loop {
        let mut guard = port.fd.readable().await?;
        let mut file = port.fd.get_ref();
        match file.read(buf) {
            Ok(0) => return Ok(Incoming::Closed),
            Ok(n) => {
                return Ok(Incoming::Data {
                    data: Bytes::copy_from_slice(&buf[..n]),
                    aux: Aux::default(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => guard.clear_ready_matching(Ready::READABLE),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

async fn writer(port: Arc<Port>, mut rx: mpsc::Receiver<Outgoing>, errors: mpsc::Sender<Incoming>) {
    while let Some(out) = rx.recv().await {
        let data = match out {
            Outgoing::Data { data, .. } => data,
            Outgoing::Shutdown => return,
        };
        let mut rest: &[u8] = &data;
        while !rest.is_empty() {
            let mut guard = match port.fd.writable().await {
                Ok(g) => g,
                Err(e) => {
                    let _ = errors.send(Incoming::Error(e.into())).await;
                    return;
                }
            };
            let mut file = port.fd.get_ref();
            match file.write(rest) {
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => guard.clear_ready_matching(Ready::WRITABLE),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let _ = errors.send(Incoming::Error(e.into())).await;
                    return;
                }
            }
        }
    }
}

/// Sample the modem lines; reports the first sample and every change.
async fn modem_poll(port: Arc<Port>, tx: mpsc::Sender<Incoming>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    let mut last: Option<u8> = None;
    loop {
        ticker.tick().await;
        let bits = match modem_bits(port.raw()) {
            Ok(bits) => to_modemstate(bits),
            Err(e) => {
                tracing::debug!(error = %e, "modem lines not readable, polling stopped");
                return;
            }
        };
        if last != Some(bits) {
            last = Some(bits);
            if tx.send(Incoming::Modem(bits)).await.is_err() {
                return;
            }
        }
    }
}

struct SerialControl {
    port: Arc<Port>,
}

impl LinkControl for SerialControl {
    fn control(&mut self, get: bool, op: ControlOp, data: &str) -> Result<String> {
        let fd = self.port.raw();
        match op {
            ControlOp::Rs485 => {
                if !get {
                    set_rs485(fd, parse_rs485(data)?.as_ref())?;
                }
                Ok(match get_rs485(fd)? {
                    Some(cfg) => cfg.to_string(),
                    None => "off".to_string(),
                })
            }
            ControlOp::SendBreak if !get => {
                cvt(unsafe { libc::tcsendbreak(fd, 0) })?;
                Ok(String::new())
            }
            _ => Err(GensioError::NotSupported),
        }
    }

    fn serial(&mut self, op: SerialOp, value: u32) -> Result<u32> {
        op.check(value)?;
        let fd = self.port.raw();
        let set = value != 0;
        match op {
            SerialOp::Baud => {
                if set {
                    modify_termios(fd, |t| set_speed(t, value))?;
                }
                Ok(get_speed(&get_termios(fd)?))
            }
            SerialOp::DataSize => {
                if set {
                    modify_termios(fd, |t| {
                        set_datasize(t, value);
                        Ok(())
                    })?;
                }
                Ok(get_datasize(&get_termios(fd)?))
            }
            SerialOp::Parity => {
                if set {
                    modify_termios(fd, |t| {
                        set_parity(t, value);
                        Ok(())
                    })?;
                }
                Ok(get_parity(&get_termios(fd)?))
            }
            SerialOp::StopBits => {
                if set {
                    modify_termios(fd, |t| {
                        if value == STOPBITS_1 {
                            t.c_cflag &= !libc::CSTOPB;
                        } else {
                            t.c_cflag |= libc::CSTOPB;
                        }
                        Ok(())
                    })?;
                }
                let t = get_termios(fd)?;
                Ok(if t.c_cflag & libc::CSTOPB != 0 { STOPBITS_2 } else { STOPBITS_1 })
            }
            SerialOp::FlowControl => {
                if set {
                    modify_termios(fd, |t| {
                        set_flow(t, value);
                        Ok(())
                    })?;
                }
                Ok(get_flow(&get_termios(fd)?))
            }
            // input flow control on DCD/DTR/DSR has no termios equivalent
            SerialOp::IFlowControl => match value {
                0 | FLOWCONTROL_NONE => Ok(FLOWCONTROL_NONE),
                _ => Err(GensioError::NotSupported),
            },
            SerialOp::SBreak => {
                let mut on = self.port.break_on.lock().unwrap_or_else(PoisonError::into_inner);
                if set {
                    let req = if value == SERIAL_ON { libc::TIOCSBRK } else { libc::TIOCCBRK };
                    cvt(unsafe { libc::ioctl(fd, req) })?;
                    *on = value == SERIAL_ON;
                }
                Ok(if *on { SERIAL_ON } else { SERIAL_OFF })
            }
            SerialOp::Dtr | SerialOp::Rts => {
                let bit = if op == SerialOp::Dtr { libc::TIOCM_DTR } else { libc::TIOCM_RTS };
                if set {
                    set_modem_bit(fd, bit, value == SERIAL_ON)?;
                }
                Ok(if modem_bits(fd)? & bit != 0 { SERIAL_ON } else { SERIAL_OFF })
            }
        }
    }

    fn on_close(&mut self) {
        if self.port.settings.hangup_when_done {
            let _ = set_modem_bit(self.port.raw(), libc::TIOCM_DTR, false);
        }
    }
}
