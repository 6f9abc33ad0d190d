use std::io;
use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::{accepting, bind_first, AccShared, Gate};
use crate::error::Result;
use crate::net;
use crate::observability::logging::LogLevel;

/// Back off after a failed accept (fd exhaustion and the like).
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// A listening socket that outgoing streams may share via SO_REUSEPORT.
pub(super) fn listener_socket(addr: &SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let s = Socket::new(Domain::for_address(*addr), ty, Some(protocol))?;
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        s.set_only_v6(false)?;
    }
    s.set_reuse_address(true)?;
    s.set_reuse_port(true)?;
    s.bind(&(*addr).into())?;
    Ok(s)
}

pub(super) fn listen(addrs: &[SocketAddr], backlog: u32) -> Result<(TcpListener, SocketAddr)> {
    let s = bind_first(addrs, |addr| {
        let s = listener_socket(addr, Type::STREAM, Protocol::TCP)?;
        s.listen(backlog.try_into().unwrap_or(i32::MAX))?;
        s.set_nonblocking(true)?;
        Ok(s)
    })?;
    let listener = TcpListener::from_std(s.into())?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

pub(super) async fn run(listener: TcpListener, acc: Weak<AccShared>, mut gate: watch::Receiver<Gate>, nodelay: bool) {
    loop {
        if !accepting(&mut gate).await {
            break;
        }
        let accepted = tokio::select! {
            res = listener.accept() => res,
            changed = gate.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        let Some(acc) = acc.upgrade() else {
            break;
        };
        match accepted {
            Ok((stream, peer)) => match net::tcp::accepted(stream, nodelay) {
                Ok(link) => acc.serve(link, peer),
                Err(e) => acc.report(LogLevel::Err, format!("{peer}: {e}")),
            },
            Err(e) => {
                acc.report(LogLevel::Err, format!("tcp accept: {e}"));
                drop(acc);
                tokio::time::sleep(ACCEPT_RETRY).await;
            }
        }
    }
    tracing::debug!("tcp listener closed");
}
