//! UDP transport.
//!
//! A client socket is `connect`ed to its remote, so the first write goes out
//! without any prior handshake. Streams created by the udp accepter share
//! the accepter's socket and are fed by its dispatcher.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::addr::{BaseSpec, TransportKind};
use crate::control::ControlOp;
use crate::error::{GensioError, Result};
use crate::net::{Aux, Incoming, Link, LinkAttrs, LinkControl, Outgoing};
use crate::os::Selector;

pub(crate) const OPTIONS: &[&str] = &["max_packet"];

fn attrs() -> LinkAttrs {
    LinkAttrs {
        packet: true,
        ..Default::default()
    }
}

pub(crate) fn max_packet(base: &BaseSpec, selector: &Selector) -> Result<usize> {
    let size = base
        .args
        .usize("max_packet")?
        .unwrap_or(selector.defaults().udp_max_packet);
    if size == 0 || size > 65_507 {
        return Err(GensioError::config(format!("udp: max_packet {size} out of range")));
    }
    Ok(size)
}

pub(crate) async fn connect(base: &BaseSpec, selector: &Selector, local: Option<SocketAddr>) -> Result<Link> {
    let max_packet = max_packet(base, selector)?;
    let addrs = base.net_addr()?.resolve().await?;
    let remote = addrs[0];
    let local = local.unwrap_or_else(|| {
        let ip = if remote.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        SocketAddr::new(ip, 0)
    });
    let sock = UdpSocket::bind(local)
        .await
        .map_err(|e| GensioError::open("udp bind", e))?;
    sock.connect(remote)
        .await
        .map_err(|e| GensioError::open("udp connect", e))?;
    let sock = Arc::new(sock);

    let ctl = UdpControl {
        sock: Arc::clone(&sock),
        remote,
        max_packet,
        on_close: None,
    };
    let (mut link, ends) = Link::new(TransportKind::Udp, attrs(), Box::new(ctl));
    link.abort_on_close(tokio::spawn(reader(Arc::clone(&sock), ends.incoming.clone(), max_packet)));
    link.drain_on_close(tokio::spawn(writer(sock, None, ends.outgoing, ends.incoming, max_packet)));
    Ok(link)
}

/// A stream on an accepter's shared socket for the peer at `remote`.
///
/// Returns the link and the sender the dispatcher feeds datagrams into.
pub(crate) fn child(
    sock: Arc<UdpSocket>,
    remote: SocketAddr,
    max_packet: usize,
    on_close: Box<dyn FnOnce() + Send>,
) -> (Link, mpsc::Sender<Incoming>) {
    let ctl = UdpControl {
        sock: Arc::clone(&sock),
        remote,
        max_packet,
        on_close: Some(on_close),
    };
    let (mut link, ends) = Link::new(TransportKind::Udp, attrs(), Box::new(ctl));
    let feed = ends.incoming.clone();
    link.drain_on_close(tokio::spawn(writer(
        sock,
        Some(remote),
        ends.outgoing,
        ends.incoming,
        max_packet,
    )));
    (link, feed)
}

async fn reader(sock: Arc<UdpSocket>, tx: mpsc::Sender<Incoming>, max_packet: usize) {
    let mut buf = vec![0u8; max_packet.max(1500)];
    loop {
        let event = match sock.recv(&mut buf).await {
            Ok(n) => Incoming::Data {
                data: Bytes::copy_from_slice(&buf[..n]),
                aux: Aux::default(),
            },
            // ICMP port unreachable from an earlier send; the socket stays usable
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::debug!("udp peer unreachable");
                continue;
            }
            Err(e) => Incoming::Error(e.into()),
        };
        let last = matches!(event, Incoming::Error(_));
        if tx.send(event).await.is_err() || last {
            return;
        }
    }
}

async fn writer(
    sock: Arc<UdpSocket>,
    to: Option<SocketAddr>,
    mut rx: mpsc::Receiver<Outgoing>,
    errors: mpsc::Sender<Incoming>,
    max_packet: usize,
) {
    while let Some(out) = rx.recv().await {
        let data = match out {
            Outgoing::Data { data, .. } => data,
            Outgoing::Shutdown => return,
        };
        for packet in data.chunks(max_packet) {
            let res = match to {
                Some(addr) => sock.send_to(packet, addr).await,
                None => sock.send(packet).await,
            };
            match res {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    tracing::debug!("udp send refused, dropping datagram");
                }
                Err(e) => {
                    let _ = errors.send(Incoming::Error(e.into())).await;
                    return;
                }
            }
        }
    }
}

struct UdpControl {
    sock: Arc<UdpSocket>,
    remote: SocketAddr,
    max_packet: usize,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl LinkControl for UdpControl {
    fn control(&mut self, get: bool, op: ControlOp, _data: &str) -> Result<String> {
        if !get {
            return Err(GensioError::NotSupported);
        }
        match op {
            ControlOp::LAddr => Ok(self.sock.local_addr()?.to_string()),
            ControlOp::LPort => Ok(self.sock.local_addr()?.port().to_string()),
            ControlOp::RAddr => Ok(self.remote.to_string()),
            ControlOp::MaxWritePacket => Ok(self.max_packet.to_string()),
            _ => Err(GensioError::NotSupported),
        }
    }

    fn on_close(&mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}
