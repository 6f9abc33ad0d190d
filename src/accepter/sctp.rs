use std::io;
use std::net::SocketAddr;
use std::sync::Weak;

use socket2::{SockAddr, Socket};
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;

use super::{accepting, bind_first, AccShared, Gate};
use crate::error::{GensioError, Result};
use crate::net::sctp::{self, StreamCounts};
use crate::observability::logging::LogLevel;

pub(super) fn listen(
    addrs: &[SocketAddr],
    counts: StreamCounts,
    backlog: u32,
) -> Result<(AsyncFd<Socket>, SocketAddr)> {
    let s = bind_first(addrs, |addr| {
        let s = sctp::new_socket(addr, counts)?;
        if addr.is_ipv6() && addr.ip().is_unspecified() {
            s.set_only_v6(false)?;
        }
        s.set_reuse_address(true)?;
        s.set_reuse_port(true)?;
        s.bind(&(*addr).into())?;
        s.listen(backlog.try_into().unwrap_or(i32::MAX))?;
        s.set_nonblocking(true)?;
        Ok(s)
    })?;
    let local = s
        .local_addr()?
        .as_socket()
        .ok_or_else(|| GensioError::OpenFailure("sctp: no local address".into()))?;
    Ok((AsyncFd::new(s)?, local))
}

async fn accept_one(fd: &AsyncFd<Socket>) -> io::Result<(Socket, SockAddr)> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| inner.get_ref().accept()) {
            Ok(res) => return res,
            Err(_would_block) => continue,
        }
    }
}

pub(super) async fn run(fd: AsyncFd<Socket>, acc: Weak<AccShared>, mut gate: watch::Receiver<Gate>) {
    loop {
        if !accepting(&mut gate).await {
            break;
        }
        let accepted = tokio::select! {
            res = accept_one(&fd) => res,
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
            Ok((s, peer)) => {
                let Some(peer) = peer.as_socket() else {
                    continue;
                };
                match sctp::accepted(s) {
                    Ok(link) => acc.serve(link, peer),
                    Err(e) => acc.report(LogLevel::Err, format!("{peer}: {e}")),
                }
            }
            Err(e) => acc.report(LogLevel::Err, format!("sctp accept: {e}")),
        }
    }
    tracing::debug!("sctp listener closed");
}
