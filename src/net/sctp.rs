//! SCTP transport: one-to-one sockets with multiple sub-streams.
//!
//! Stream selection and unordered (OOB) delivery ride in SCTP_SNDINFO /
//! SCTP_RCVINFO ancillary data.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::io::Ready;
use tokio::sync::mpsc;

use crate::addr::{BaseSpec, TransportKind};
use crate::control::ControlOp;
use crate::error::{GensioError, Result};
use crate::net::{sock, Aux, Incoming, Link, LinkAttrs, LinkControl, Outgoing, READ_CHUNK};
use crate::os::Selector;

pub(crate) const OPTIONS: &[&str] = &["instreams", "ostreams"];

const IPPROTO_SCTP: libc::c_int = 132;
const SOL_SCTP: libc::c_int = 132;
const SCTP_INITMSG: libc::c_int = 2;
const SCTP_STATUS: libc::c_int = 14;
const SCTP_RECVRCVINFO: libc::c_int = 32;
const SCTP_SNDINFO: libc::c_int = 2;
const SCTP_RCVINFO: libc::c_int = 3;
const SCTP_UNORDERED: u16 = 1;
const MSG_NOTIFICATION: libc::c_int = 0x8000;

const SNDINFO_LEN: usize = 16;
/// Largest single message handed to the kernel.
const MAX_MESSAGE: usize = 16 * 1024;

#[repr(C)]
#[derive(Default)]
struct InitMsg {
    num_ostreams: u16,
    max_instreams: u16,
    max_attempts: u16,
    max_init_timeo: u16,
}

#[repr(align(8))]
struct Aligned<T>(T);

/// Requested stream counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamCounts {
    pub instreams: u16,
    pub ostreams: u16,
}

impl StreamCounts {
    pub(crate) fn from_spec(base: &BaseSpec, selector: &Selector) -> Result<Self> {
        let d = selector.defaults();
        let get = |key: &str, default: u32| -> Result<u16> {
            let v = base.args.u32(key)?.unwrap_or(default);
            u16::try_from(v)
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| GensioError::config(format!("sctp: {key}={v} out of range")))
        };
        Ok(Self {
            instreams: get("instreams", d.sctp_instreams)?,
            ostreams: get("ostreams", d.sctp_ostreams)?,
        })
    }
}

/// Whether the running kernel can create SCTP sockets.
pub fn sctp_supported() -> bool {
    Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::from(IPPROTO_SCTP))).is_ok()
}

fn setsockopt<T>(fd: RawFd, name: libc::c_int, value: &T) -> io::Result<()> {
    // SAFETY: value points to a live T of the given size.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            SOL_SCTP,
            name,
            (value as *const T).cast(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Create an SCTP socket with the requested stream counts.
pub(crate) fn new_socket(addr: &SocketAddr, counts: StreamCounts) -> io::Result<Socket> {
    let s = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::from(IPPROTO_SCTP)))?;
    let init = InitMsg {
        num_ostreams: counts.ostreams,
        max_instreams: counts.instreams,
        ..Default::default()
    };
    setsockopt(s.as_raw_fd(), SCTP_INITMSG, &init)?;
    enable_rcvinfo(&s)?;
    Ok(s)
}

pub(crate) fn enable_rcvinfo(s: &Socket) -> io::Result<()> {
    let on: libc::c_int = 1;
    setsockopt(s.as_raw_fd(), SCTP_RECVRCVINFO, &on)
}

/// Negotiated (instreams, ostreams) of the association.
fn status_streams(fd: RawFd) -> io::Result<(u16, u16)> {
    let mut buf = Aligned([0u8; 256]);
    let mut len = buf.0.len() as libc::socklen_t;
    // SAFETY: buf is large enough for struct sctp_status and len says so.
    let rc = unsafe { libc::getsockopt(fd, SOL_SCTP, SCTP_STATUS, buf.0.as_mut_ptr().cast(), &mut len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let field = |off: usize| u16::from_ne_bytes([buf.0[off], buf.0[off + 1]]);
    Ok((field(16), field(18)))
}

struct RecvInfo {
    len: usize,
    stream: u16,
    unordered: bool,
    notification: bool,
}

fn recv_msg(fd: RawFd, buf: &mut [u8]) -> io::Result<RecvInfo> {
    let mut cbuf = Aligned([0u8; 128]);
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: an all-zero msghdr is valid; the pointers set below outlive the call.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.0.as_mut_ptr().cast();
    msg.msg_controllen = cbuf.0.len() as _;

    // SAFETY: msg describes valid buffers.
    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut info = RecvInfo {
        len: n as usize,
        stream: 0,
        unordered: false,
        notification: msg.msg_flags & MSG_NOTIFICATION != 0,
    };
    // SAFETY: the kernel filled msg_control; CMSG_* walk it within msg_controllen.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == IPPROTO_SCTP && (*cmsg).cmsg_type == SCTP_RCVINFO {
                let data = libc::CMSG_DATA(cmsg);
                info.stream = ptr::read_unaligned(data as *const u16);
                let flags = ptr::read_unaligned(data.add(4) as *const u16);
                info.unordered = flags & SCTP_UNORDERED != 0;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok(info)
}

fn send_msg(fd: RawFd, data: &[u8], stream: u16, unordered: bool) -> io::Result<usize> {
    let mut cbuf = Aligned([0u8; 64]);
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    // SAFETY: as in recv_msg.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.0.as_mut_ptr().cast();
    // SAFETY: CMSG_SPACE is a pure size computation.
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(SNDINFO_LEN as u32) } as _;

    let mut sndinfo = [0u8; SNDINFO_LEN];
    sndinfo[0..2].copy_from_slice(&stream.to_ne_bytes());
    let flags = if unordered { SCTP_UNORDERED } else { 0 };
    sndinfo[2..4].copy_from_slice(&flags.to_ne_bytes());

    // SAFETY: cbuf holds CMSG_SPACE(16) bytes, enough for one header plus sndinfo.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = IPPROTO_SCTP;
        (*cmsg).cmsg_type = SCTP_SNDINFO;
        (*cmsg).cmsg_len = libc::CMSG_LEN(SNDINFO_LEN as u32) as _;
        ptr::copy_nonoverlapping(sndinfo.as_ptr(), libc::CMSG_DATA(cmsg), SNDINFO_LEN);
    }

    // SAFETY: msg describes valid buffers.
    let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub(crate) async fn connect(base: &BaseSpec, selector: &Selector, local: Option<SocketAddr>) -> Result<Link> {
    let counts = StreamCounts::from_spec(base, selector)?;
    let addrs = base.net_addr()?.resolve().await?;
    let fd = sock::connect_any(&addrs, |addr| {
        let s = new_socket(addr, counts)?;
        if let Some(local) = local {
            sock::bind_shared(&s, local, addr)?;
        }
        Ok(s)
    })
    .await?;
    from_socket(fd)
}

/// Wrap a socket accepted by the sctp accepter.
pub(crate) fn accepted(s: Socket) -> Result<Link> {
    s.set_nonblocking(true)?;
    enable_rcvinfo(&s)?;
    from_socket(AsyncFd::new(s)?)
}

fn from_socket(fd: AsyncFd<Socket>) -> Result<Link> {
    let (instreams, ostreams) = status_streams(fd.get_ref().as_raw_fd())?;
    tracing::debug!(instreams, ostreams, "sctp association up");
    let fd = Arc::new(fd);
    let attrs = LinkAttrs {
        reliable: true,
        packet: true,
        max_oob: usize::MAX,
        streams: Some((instreams, ostreams)),
        ..Default::default()
    };
    let ctl = SctpControl { fd: Arc::clone(&fd) };
    let (mut link, ends) = Link::new(TransportKind::Sctp, attrs, Box::new(ctl));
    link.abort_on_close(tokio::spawn(reader(Arc::clone(&fd), ends.incoming.clone())));
    link.drain_on_close(tokio::spawn(writer(fd, ends.outgoing, ends.incoming)));
    Ok(link)
}

async fn reader(fd: Arc<AsyncFd<Socket>>, tx: mpsc::Sender<Incoming>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let event = read_event(&fd, &mut buf).await.unwrap_or_else(|e| Incoming::Error(e.into()));
        let last = matches!(event, Incoming::Closed | Incoming::Error(_));
        if tx.send(event).await.is_err() || last {
            return;
        }
    }
}

async fn read_event(fd: &AsyncFd<Socket>, buf: &mut [u8]) -> io::Result<Incoming> {
    loop {
        let mut guard = fd.readable().await?;
        match recv_msg(fd.get_ref().as_raw_fd(), buf) {
            Ok(info) if info.notification => continue,
            Ok(info) if info.len == 0 => return Ok(Incoming::Closed),
            Ok(info) => {
                return Ok(Incoming::Data {
                    data: Bytes::copy_from_slice(&buf[..info.len]),
                    aux: Aux {
                        oob: info.unordered,
                        stream: Some(info.stream),
                    },
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                guard.clear_ready_matching(Ready::READABLE | Ready::READ_CLOSED)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

async fn writer(fd: Arc<AsyncFd<Socket>>, mut rx: mpsc::Receiver<Outgoing>, errors: mpsc::Sender<Incoming>) {
    while let Some(out) = rx.recv().await {
        let (data, aux) = match out {
            Outgoing::Data { data, aux } => (data, aux),
            Outgoing::Shutdown => {
                let _ = fd.get_ref().shutdown(std::net::Shutdown::Write);
                return;
            }
        };
        let stream = aux.stream.unwrap_or(0);
        for message in data.chunks(MAX_MESSAGE) {
            let res = sock::write_all(&fd, message, |s, b| send_msg(s.as_raw_fd(), b, stream, aux.oob)).await;
            if let Err(e) = res {
                let _ = errors.send(Incoming::Error(e.into())).await;
                return;
            }
        }
    }
}

struct SctpControl {
    fd: Arc<AsyncFd<Socket>>,
}

impl LinkControl for SctpControl {
    fn control(&mut self, get: bool, op: ControlOp, _data: &str) -> Result<String> {
        if !get {
            return Err(GensioError::NotSupported);
        }
        let s = self.fd.get_ref();
        match op {
            ControlOp::Streams => {
                let (instreams, ostreams) = status_streams(s.as_raw_fd())?;
                Ok(format!("instreams={instreams},ostreams={ostreams}"))
            }
            ControlOp::EnableOob if get => Ok("1".to_string()),
            ControlOp::LAddr => sock::sockaddr_str(s.local_addr()),
            ControlOp::LPort => Ok(sock::local_port(s)?.to_string()),
            ControlOp::RAddr => sock::sockaddr_str(s.peer_addr()),
            _ => Err(GensioError::NotSupported),
        }
    }
}
