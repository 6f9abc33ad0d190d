//! TCP transport with urgent-byte (OOB) support.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::io::{Interest, Ready};
use tokio::sync::mpsc;

use crate::addr::args::parse_bool;
use crate::addr::{BaseSpec, TransportKind};
use crate::control::ControlOp;
use crate::error::{GensioError, Result};
use crate::net::{sock, Aux, Incoming, Link, LinkAttrs, LinkControl, Outgoing, READ_CHUNK};
use crate::os::Selector;

pub(crate) const OPTIONS: &[&str] = &["nodelay"];

/// Urgent data is a single byte per send on TCP.
const MAX_OOB: usize = 1;

pub(crate) async fn connect(base: &BaseSpec, selector: &Selector, local: Option<SocketAddr>) -> Result<Link> {
    let nodelay = base.args.bool("nodelay")?.unwrap_or(selector.defaults().nodelay);
    let addrs = base.net_addr()?.resolve().await?;
    let fd = sock::connect_any(&addrs, |addr| {
        let s = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
        if let Some(local) = local {
            sock::bind_shared(&s, local, addr)?;
        }
        Ok(s)
    })
    .await?;
    fd.get_ref().set_nodelay(nodelay)?;
    tracing::debug!(peer = ?fd.get_ref().peer_addr().ok().and_then(|a| a.as_socket()), "tcp connected");
    Ok(from_socket(fd))
}

/// Wrap a stream handed over by the tcp accepter.
pub(crate) fn accepted(stream: tokio::net::TcpStream, nodelay: bool) -> Result<Link> {
    let sock = Socket::from(stream.into_std()?);
    sock.set_nodelay(nodelay)?;
    Ok(from_socket(sock::register(sock)?))
}

fn from_socket(fd: AsyncFd<Socket>) -> Link {
    let fd = Arc::new(fd);
    let attrs = LinkAttrs {
        reliable: true,
        max_oob: MAX_OOB,
        ..Default::default()
    };
    let ctl = TcpControl { fd: Arc::clone(&fd) };
    let (mut link, ends) = Link::new(TransportKind::Tcp, attrs, Box::new(ctl));
    link.abort_on_close(tokio::spawn(reader(Arc::clone(&fd), ends.incoming.clone())));
    link.drain_on_close(tokio::spawn(writer(fd, ends.outgoing, ends.incoming)));
    link
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn read_interest() -> Interest {
    Interest::READABLE | Interest::PRIORITY
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn read_interest() -> Interest {
    Interest::READABLE
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
        let mut guard = fd.ready(read_interest()).await?;
        let ready = guard.ready();

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if ready.is_priority() {
            let mut urgent = [0u8; MAX_OOB];
            match sock::recv(fd.get_ref(), &mut urgent, libc::MSG_OOB) {
                Ok(n) if n > 0 => {
                    return Ok(Incoming::Data {
                        data: Bytes::copy_from_slice(&urgent[..n]),
                        aux: Aux::oob(),
                    })
                }
                Ok(_) => guard.clear_ready_matching(Ready::PRIORITY),
                // EINVAL: the urgent mark has already been consumed
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINVAL) => {
                    guard.clear_ready_matching(Ready::PRIORITY)
                }
                Err(e) => return Err(e),
            }
        }

        if ready.is_readable() || ready.is_read_closed() {
            match sock::recv(fd.get_ref(), buf, 0) {
                Ok(0) => return Ok(Incoming::Closed),
                Ok(n) => {
                    return Ok(Incoming::Data {
                        data: Bytes::copy_from_slice(&buf[..n]),
                        aux: Aux::default(),
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
}

async fn writer(fd: Arc<AsyncFd<Socket>>, mut rx: mpsc::Receiver<Outgoing>, errors: mpsc::Sender<Incoming>) {
    while let Some(out) = rx.recv().await {
        let res = match out {
            Outgoing::Data { data, aux } if aux.oob => {
                sock::write_all(&fd, &data, |s, b| s.send_out_of_band(b)).await
            }
            Outgoing::Data { data, .. } => {
                sock::write_all(&fd, &data, |s, b| s.send_with_flags(b, libc::MSG_NOSIGNAL)).await
            }
            Outgoing::Shutdown => {
                let _ = fd.get_ref().shutdown(std::net::Shutdown::Write);
                return;
            }
        };
        if let Err(e) = res {
            let _ = errors.send(Incoming::Error(e.into())).await;
            return;
        }
    }
}

struct TcpControl {
    fd: Arc<AsyncFd<Socket>>,
}

impl LinkControl for TcpControl {
    fn control(&mut self, get: bool, op: ControlOp, data: &str) -> Result<String> {
        let s = self.fd.get_ref();
        match op {
            ControlOp::NoDelay => {
                if !get {
                    let on = parse_bool(data)
                        .ok_or_else(|| GensioError::config(format!("nodelay: '{data}' is not a boolean")))?;
                    s.set_nodelay(on)?;
                }
                Ok(if s.nodelay()? { "1" } else { "0" }.to_string())
            }
            ControlOp::EnableOob if get => Ok("1".to_string()),
            ControlOp::LAddr if get => sock::sockaddr_str(s.local_addr()),
            ControlOp::LPort if get => Ok(sock::local_port(s)?.to_string()),
            ControlOp::RAddr if get => sock::sockaddr_str(s.peer_addr()),
            _ => Err(GensioError::NotSupported),
        }
    }
}
