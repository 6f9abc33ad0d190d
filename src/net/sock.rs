//! Nonblocking socket plumbing shared by the tcp and sctp transports.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{SockAddr, Socket};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::error::{GensioError, Result};

pub(crate) fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: u8 and MaybeUninit<u8> have the same layout, and the kernel
    // only ever writes initialized bytes into the buffer.
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}

pub(crate) fn recv(sock: &Socket, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    sock.recv_with_flags(as_uninit(buf), flags)
}

pub(crate) fn sockaddr_str(addr: io::Result<SockAddr>) -> Result<String> {
    let addr = addr?;
    addr.as_socket()
        .map(|a| a.to_string())
        .ok_or(GensioError::NotSupported)
}

pub(crate) fn local_port(sock: &Socket) -> Result<u16> {
    sock.local_addr()?
        .as_socket()
        .map(|a| a.port())
        .ok_or(GensioError::NotSupported)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn interest() -> Interest {
    Interest::READABLE | Interest::WRITABLE | Interest::PRIORITY
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn interest() -> Interest {
    Interest::READABLE | Interest::WRITABLE
}

/// Register a socket with the runtime. Urgent data only wakes a reader
/// when priority events are part of the registration.
pub(crate) fn register(sock: Socket) -> io::Result<AsyncFd<Socket>> {
    AsyncFd::with_interest(sock, interest())
}

/// Allow a connecting socket to share a listener's address. A wildcard
/// `local` takes the family of `remote`.
pub(crate) fn bind_shared(sock: &Socket, local: SocketAddr, remote: &SocketAddr) -> io::Result<()> {
    let local = match local.ip() {
        ip if ip.is_unspecified() && local.is_ipv4() != remote.is_ipv4() => {
            let ip = if remote.is_ipv4() {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            } else {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            };
            SocketAddr::new(ip, local.port())
        }
        _ => local,
    };
    sock.set_reuse_address(true)?;
    sock.set_reuse_port(true)?;
    sock.bind(&local.into())
}

/// Connect to each address in turn until one succeeds.
pub(crate) async fn connect_any(
    addrs: &[SocketAddr],
    make: impl Fn(&SocketAddr) -> io::Result<Socket>,
) -> Result<AsyncFd<Socket>> {
    let mut last_err: Option<io::Error> = None;
    for addr in addrs {
        match connect_one(addr, &make).await {
            Ok(fd) => return Ok(fd),
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    let err = last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable));
    Err(GensioError::open("connect", err))
}

async fn connect_one(
    addr: &SocketAddr,
    make: &impl Fn(&SocketAddr) -> io::Result<Socket>,
) -> io::Result<AsyncFd<Socket>> {
    let sock = make(addr)?;
    sock.set_nonblocking(true)?;
    match sock.connect(&(*addr).into()) {
        Ok(()) => register(sock),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
            let fd = register(sock)?;
            let guard = fd.writable().await?;
            drop(guard);
            match fd.get_ref().take_error()? {
                None => Ok(fd),
                Some(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

/// Write all of `data` with `send`, waiting for writability as needed.
pub(crate) async fn write_all(
    fd: &AsyncFd<Socket>,
    mut data: &[u8],
    send: impl Fn(&Socket, &[u8]) -> io::Result<usize>,
) -> io::Result<()> {
    while !data.is_empty() {
        let mut guard = fd.writable().await?;
        match guard.try_io(|inner| send(inner.get_ref(), data)) {
            Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}
