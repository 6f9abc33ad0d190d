//! Connectionless accept: every new remote seen on the shared socket
//! becomes a stream.

use std::net::{SocketAddr, SocketAddrV6};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use socket2::{Protocol, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify};

use super::tcp::listener_socket;
use super::{bind_first, AccShared, Gate};
use crate::addr::NetAddr;
use crate::error::{GensioError, Result};
use crate::gensio::Connector;
use crate::net::{self, Aux, Incoming};
use crate::observability::logging::LogLevel;

type Children = DashMap<SocketAddr, mpsc::Sender<Incoming>>;

/// The accepter's socket and the streams that share it.
#[derive(Clone)]
pub(super) struct Endpoint {
    sock: Arc<UdpSocket>,
    children: Arc<Children>,
    /// Signalled when a stream leaves the map.
    left: Arc<Notify>,
    max_packet: usize,
}

pub(super) fn bind(addrs: &[SocketAddr], max_packet: usize) -> Result<(Endpoint, SocketAddr)> {
    let s = bind_first(addrs, |addr| {
        let s = listener_socket(addr, Type::DGRAM, Protocol::UDP)?;
        s.set_nonblocking(true)?;
        Ok(s)
    })?;
    let sock = UdpSocket::from_std(s.into())?;
    let local = sock.local_addr()?;
    let endpoint = Endpoint {
        sock: Arc::new(sock),
        children: Arc::new(DashMap::new()),
        left: Arc::new(Notify::new()),
        max_packet,
    };
    Ok((endpoint, local))
}

impl Endpoint {
    /// Peers reach a dual-stack socket as v4-mapped addresses.
    fn key(&self, addr: SocketAddr) -> SocketAddr {
        match addr {
            SocketAddr::V4(v4) if self.sock.local_addr().is_ok_and(|l| l.is_ipv6()) => {
                SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
            }
            other => other,
        }
    }

    /// Create a stream for `from` and register it with the dispatcher.
    fn child(&self, from: SocketAddr) -> (net::Link, mpsc::Sender<Incoming>) {
        let (children, left) = (Arc::clone(&self.children), Arc::clone(&self.left));
        let (link, feed) = net::udp::child(
            Arc::clone(&self.sock),
            from,
            self.max_packet,
            Box::new(move || {
                children.remove(&from);
                left.notify_one();
            }),
        );
        self.children.insert(from, feed.clone());
        (link, feed)
    }

    /// Link source for an outgoing stream to `remote` on this socket.
    pub(super) fn connector(&self, remote: NetAddr) -> Connector {
        let endpoint = self.clone();
        Box::pin(async move {
            let addrs = remote.resolve().await?;
            let to = endpoint.key(addrs[0]);
            if endpoint.children.contains_key(&to) {
                return Err(GensioError::OpenFailure(format!("udp: {to} already has a stream")));
            }
            let (link, _) = endpoint.child(to);
            Ok(link)
        })
    }
}

pub(super) async fn run(endpoint: Endpoint, acc: Weak<AccShared>, mut gate: watch::Receiver<Gate>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        let g = *gate.borrow_and_update();
        if g.stopped && endpoint.children.is_empty() {
            break;
        }
        let (n, from) = tokio::select! {
            res = endpoint.sock.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
                Err(e) => {
                    if let Some(acc) = acc.upgrade() {
                        acc.report(LogLevel::Err, format!("udp receive: {e}"));
                    }
                    break;
                }
            },
            changed = gate.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = endpoint.left.notified() => continue,
        };
        let event = Incoming::Data {
            data: Bytes::copy_from_slice(&buf[..n]),
            aux: Aux::default(),
        };

        let known = endpoint.children.get(&from).map(|e| e.value().clone());
        if let Some(feed) = known {
            if feed.try_send(event).is_err() {
                tracing::debug!(%from, "udp datagram dropped");
            }
            continue;
        }
        if g.stopped || !g.enabled {
            tracing::debug!(%from, "udp datagram from new peer ignored");
            continue;
        }
        let Some(acc) = acc.upgrade() else {
            break;
        };
        let (link, feed) = endpoint.child(from);
        let _ = feed.try_send(event);
        acc.serve(link, from);
    }
    tracing::debug!("udp dispatcher stopped");
}
