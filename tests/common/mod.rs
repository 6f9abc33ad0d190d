//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use gensio::{
    Accepter, AccepterEvent, Aux, CertVerify, Event, Gensio, GensioError, LogLevel, ModemState,
    Result, Selector, SerialOp, Waiter,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Deterministic, non-repeating-looking test data.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(7) + i / 251) as u8).collect()
}

#[derive(Debug, Default)]
pub struct Record {
    pub data: Vec<u8>,
    pub oob: Vec<u8>,
    /// (stream index, bytes) per read.
    pub streams: Vec<(u16, Vec<u8>)>,
    pub error: Option<GensioError>,
    pub modem: Vec<ModemState>,
    pub linestate: Vec<u8>,
    pub serial_requests: Vec<(SerialOp, u32)>,
    pub signatures: Vec<String>,
    pub breaks: usize,
    pub flow: Vec<bool>,
    pub write_ready: usize,
}

/// Event handler that records everything and wakes a [`Waiter`] per callback.
pub struct Recorder {
    rec: Mutex<Record>,
    waiter: Waiter,
    /// Server-side serial requests are left for the application to ack.
    pub defer_serial: AtomicBool,
    /// Consume at most this many bytes per read (0 = all).
    pub read_limit: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rec: Mutex::new(Record::default()),
            waiter: Waiter::new(),
            defer_serial: AtomicBool::new(false),
            read_limit: AtomicUsize::new(0),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&Record) -> R) -> R {
        f(&self.rec.lock().unwrap())
    }

    fn update(&self, f: impl FnOnce(&mut Record)) {
        f(&mut self.rec.lock().unwrap());
        self.waiter.wake();
    }

    pub async fn wait_until(&self, what: &str, cond: impl Fn(&Record) -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            if self.with(&cond) {
                return;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if self.waiter.wait(left).await.is_err() {
                panic!("timed out waiting for {what}: {:?}", self.with(|r| format!("{r:?}")));
            }
        }
    }

    /// Wait until `len` bytes arrived and return them.
    pub async fn wait_data(&self, len: usize) -> Vec<u8> {
        self.wait_until("data", |r| r.data.len() >= len).await;
        self.with(|r| r.data.clone())
    }

    pub async fn wait_error(&self) -> GensioError {
        self.wait_until("end of stream", |r| r.error.is_some()).await;
        self.with(|r| r.error.clone().unwrap())
    }
}

impl Event for Recorder {
    fn read(&self, _io: &Gensio, data: Result<&[u8], &GensioError>, aux: &Aux) -> usize {
        match data {
            Ok(buf) => {
                let limit = self.read_limit.load(Ordering::Relaxed);
                let n = if limit == 0 { buf.len() } else { buf.len().min(limit) };
                let buf = &buf[..n];
                self.update(|r| {
                    if aux.oob {
                        r.oob.extend_from_slice(buf);
                    } else {
                        r.data.extend_from_slice(buf);
                    }
                    if let Some(stream) = aux.stream {
                        r.streams.push((stream, buf.to_vec()));
                    }
                });
                n
            }
            Err(e) => {
                self.update(|r| r.error = Some(e.clone()));
                0
            }
        }
    }

    fn write_ready(&self, io: &Gensio) {
        io.write_cb_enable(false);
        self.update(|r| r.write_ready += 1);
    }

    fn modemstate(&self, _io: &Gensio, state: ModemState) {
        self.update(|r| r.modem.push(state));
    }

    fn linestate(&self, _io: &Gensio, bits: u8) {
        self.update(|r| r.linestate.push(bits));
    }

    fn serial_request(&self, _io: &Gensio, op: SerialOp, value: u32) -> Option<u32> {
        self.update(|r| r.serial_requests.push((op, value)));
        if self.defer_serial.load(Ordering::Relaxed) {
            None
        } else {
            Some(value)
        }
    }

    fn signature(&self, _io: &Gensio, signature: &str) {
        self.update(|r| r.signatures.push(signature.to_string()));
    }

    fn send_break(&self, _io: &Gensio) {
        self.update(|r| r.breaks += 1);
    }

    fn flow_state(&self, _io: &Gensio, enabled: bool) {
        self.update(|r| r.flow.push(enabled));
    }
}

type PrecertFn = Box<dyn Fn(&mut CertVerify) -> Result<()> + Send + Sync>;

/// Accepter handler that queues new connections.
#[derive(Default)]
pub struct Incoming {
    conns: Mutex<VecDeque<Gensio>>,
    logs: Mutex<Vec<(LogLevel, String)>>,
    precert: Mutex<Option<PrecertFn>>,
    waiter: Waiter,
}

impl Incoming {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_precert(&self, f: impl Fn(&mut CertVerify) -> Result<()> + Send + Sync + 'static) {
        *self.precert.lock().unwrap() = Some(Box::new(f));
    }

    /// The next accepted stream.
    pub async fn next(&self) -> Gensio {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            if let Some(io) = self.conns.lock().unwrap().pop_front() {
                return io;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            self.waiter.wait(left).await.expect("no connection accepted");
        }
    }

    /// Wait for an accepter log message.
    pub async fn next_log(&self) -> String {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            if let Some((_, msg)) = self.logs.lock().unwrap().first() {
                return msg.clone();
            }
            let left = deadline.saturating_duration_since(Instant::now());
            self.waiter.wait(left).await.expect("no accepter log");
        }
    }

    pub fn pending(&self) -> usize {
        self.conns.lock().unwrap().len()
    }
}

impl AccepterEvent for Incoming {
    fn new_connection(&self, io: Gensio) {
        self.conns.lock().unwrap().push_back(io);
        self.waiter.wake();
    }

    fn precert_verify(&self, cv: &mut CertVerify) -> Result<()> {
        match &*self.precert.lock().unwrap() {
            Some(f) => f(cv),
            None => Err(GensioError::NotSupported),
        }
    }

    fn log(&self, level: LogLevel, msg: &str) {
        self.logs.lock().unwrap().push((level, msg.to_string()));
        self.waiter.wake();
    }
}

/// Both ends of an accepted connection with recorders attached and read
/// callbacks enabled.
pub struct Pair {
    pub selector: Selector,
    pub acc: Accepter,
    pub incoming: Arc<Incoming>,
    pub client: Gensio,
    pub client_rec: Arc<Recorder>,
    pub server: Gensio,
    pub server_rec: Arc<Recorder>,
}

pub async fn start_accepter(spec: &str) -> (Selector, Accepter, Arc<Incoming>) {
    let selector = Selector::new();
    let incoming = Incoming::new();
    let acc = Accepter::new(spec, &selector, incoming.clone()).unwrap();
    acc.startup().await.unwrap();
    (selector, acc, incoming)
}

/// Accept on `accept_spec`, connect with `connect(port)`.
pub async fn pair(accept_spec: &str, connect: impl Fn(u16) -> String) -> Pair {
    let (selector, acc, incoming) = start_accepter(accept_spec).await;
    let port = acc.local_port().unwrap();
    let client_rec = Recorder::new();
    let client = Gensio::new(&connect(port), &selector, Some(client_rec.clone())).unwrap();
    client.open_s().await.unwrap();
    let server = incoming.next().await;
    let server_rec = Recorder::new();
    server.set_handler(server_rec.clone());
    server.read_cb_enable(true);
    client.read_cb_enable(true);
    Pair {
        selector,
        acc,
        incoming,
        client,
        client_rec,
        server,
        server_rec,
    }
}

impl Pair {
    pub async fn close(self) {
        self.client.close_s().await.unwrap();
        self.server.close_s().await.unwrap();
        self.acc.shutdown().await;
    }
}

/// A fresh directory under the system temp dir.
pub fn temp_dir(tag: &str) -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "gensio-{tag}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Self-signed certificates for localhost; each one is its own CA.
pub struct Certs {
    pub dir: PathBuf,
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
    /// Not trusted by anything.
    pub rogue_cert: String,
    pub rogue_key: String,
}

fn self_signed(dir: &PathBuf, name: &str, cn: &str) -> (String, String) {
    use rcgen::SanType;

    let mut sans = vec![SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST))];
    sans.extend(rcgen::Ia5String::try_from("localhost").ok().map(SanType::DnsName));
    self_signed_with(dir, name, cn, sans)
}

/// A self-signed certificate carrying only the given alternative names.
pub fn self_signed_with(dir: &PathBuf, name: &str, cn: &str, sans: Vec<rcgen::SanType>) -> (String, String) {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    let mut params = CertificateParams::default();
    params.subject_alt_names = sans;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "US");
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();

    let cert_path = dir.join(format!("{name}cert.pem"));
    let key_path = dir.join(format!("{name}key.pem"));
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key.serialize_pem()).unwrap();
    (
        cert_path.display().to_string(),
        key_path.display().to_string(),
    )
}

pub fn certs() -> Certs {
    let dir = temp_dir("certs");
    let (server_cert, server_key) = self_signed(&dir, "server", "ser2net.org");
    let (client_cert, client_key) = self_signed(&dir, "client", "gensio.org");
    let (rogue_cert, rogue_key) = self_signed(&dir, "rogue", "rogue.example");
    Certs {
        dir,
        server_cert,
        server_key,
        client_cert,
        client_key,
        rogue_cert,
        rogue_key,
    }
}
