//! TLS over any reliable stream, driven through rustls without I/O.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{Acceptor, WebPkiClientVerifier};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, Connection, DigitallySignedStruct, OtherError,
    RootCertStore, ServerConfig, SignatureScheme,
};

use crate::addr::{FilterKind, FilterSpec};
use crate::control::ControlOp;
use crate::error::{GensioError, Result};
use crate::filter::{run_precert, x509, CertVerify, ConnCtx, Filter, FilterIo, PrecertHook, Role};
use crate::os::Selector;

const OPTIONS: &[&str] = &["CA", "cert", "key", "clientauth", "mode"];

/// Plaintext pulled out of rustls per read call.
const PLAINTEXT_CHUNK: usize = 16 * 1024;

pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open_pem(path: &str) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| GensioError::config(format!("{path}: {e}")))
}

pub(crate) fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open_pem(path)?)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| GensioError::config(format!("{path}: {e}")))?;
    if certs.is_empty() {
        return Err(GensioError::config(format!("{path}: no certificates")));
    }
    Ok(certs)
}

pub(crate) fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open_pem(path)?)
        .map_err(|e| GensioError::config(format!("{path}: {e}")))?
        .ok_or_else(|| GensioError::config(format!("{path}: no private key")))
}

pub(crate) fn load_roots(path: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| GensioError::config(format!("{path}: {e}")))?;
    }
    Ok(roots)
}

/// A certificate chain and its key.
pub(crate) struct Identity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Identity {
    /// `cert` and `key` from the layer's args, falling back to `[tls]`.
    pub fn from_args(spec: &FilterSpec, selector: &Selector) -> Result<Option<Self>> {
        let defaults = &selector.config().tls;
        let cert = spec.args.value("cert").map(str::to_string).or_else(|| defaults.cert.clone());
        let key = spec.args.value("key").map(str::to_string).or_else(|| defaults.key.clone());
        match (cert, key) {
            (Some(cert), Some(key)) => Ok(Some(Self {
                certs: load_certs(&cert)?,
                key: load_key(&key)?,
            })),
            (None, None) => Ok(None),
            _ => Err(GensioError::config(format!(
                "{}: cert and key must be given together",
                spec.kind.name()
            ))),
        }
    }
}

/// `CA` from the layer's args, falling back to `[tls]`.
pub(crate) fn ca_from_args(spec: &FilterSpec, selector: &Selector) -> Result<Option<(String, Arc<RootCertStore>)>> {
    let ca = spec
        .args
        .value("CA")
        .map(str::to_string)
        .or_else(|| selector.config().tls.ca.clone());
    ca.map(|path| {
        let roots = load_roots(&path)?;
        Ok((path, Arc::new(roots)))
    })
    .transpose()
}

/// Trusts any server whose chain leads to one of `roots`. The host name the
/// client dialed is not matched against the certificate.
#[derive(Debug)]
struct CaVerifier {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

fn cert_error(e: webpki::Error) -> rustls::Error {
    let err = match e {
        webpki::Error::UnknownIssuer => CertificateError::UnknownIssuer,
        webpki::Error::CertExpired { .. } => CertificateError::Expired,
        webpki::Error::CertNotValidYet { .. } => CertificateError::NotValidYet,
        webpki::Error::InvalidSignatureForPublicKey => CertificateError::BadSignature,
        other => CertificateError::Other(OtherError(Arc::new(other))),
    };
    rustls::Error::InvalidCertificate(err)
}

impl ServerCertVerifier for CaVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cert = webpki::EndEntityCert::try_from(end_entity).map_err(cert_error)?;
        cert.verify_for_usage(
            self.provider.signature_verification_algorithms.all,
            &self.roots.roots,
            intermediates,
            now,
            webpki::KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(cert_error)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

pub(crate) struct TlsFactory {
    ca: Option<(String, Arc<RootCertStore>)>,
    identity: Option<Identity>,
    clientauth: bool,
    mode: Option<Role>,
}

impl TlsFactory {
    pub fn new(spec: &FilterSpec, selector: &Selector) -> Result<Self> {
        spec.args.check_known("ssl", OPTIONS)?;
        let mode = match spec.args.value("mode") {
            Some(_) => Some(Role::from_args(spec, Role::Client)?),
            None => None,
        };
        Ok(Self {
            ca: ca_from_args(spec, selector)?,
            identity: Identity::from_args(spec, selector)?,
            clientauth: spec.args.bool("clientauth")?.unwrap_or(false),
            mode,
        })
    }

    fn client_config(&self) -> Result<ClientConfig> {
        let (_, roots) = self
            .ca
            .as_ref()
            .ok_or_else(|| GensioError::config("ssl: a client needs a CA"))?;
        let provider = provider();
        let verifier = CaVerifier {
            roots: Arc::clone(roots),
            provider: Arc::clone(&provider),
        };
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));
        Ok(match &self.identity {
            Some(id) => builder.with_client_auth_cert(id.certs.clone(), id.key.clone_key())?,
            None => builder.with_no_client_auth(),
        })
    }

    fn server_config(&self, roots: Option<Arc<RootCertStore>>) -> Result<Arc<ServerConfig>> {
        let id = self
            .identity
            .as_ref()
            .ok_or_else(|| GensioError::config("ssl: a server needs cert and key"))?;
        let builder = ServerConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
        let builder = match (roots, self.clientauth) {
            (Some(roots), clientauth) => {
                let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider());
                let verifier = if clientauth {
                    verifier
                } else {
                    verifier.allow_unauthenticated()
                };
                let verifier = verifier
                    .build()
                    .map_err(|e| GensioError::comm(format!("client verifier: {e}")))?;
                builder.with_client_cert_verifier(verifier)
            }
            (None, true) => return Err(GensioError::comm("client authentication requested without a CA")),
            (None, false) => builder.with_no_client_auth(),
        };
        Ok(Arc::new(builder.with_single_cert(id.certs.clone(), id.key.clone_key())?))
    }

    pub fn build(self: &Arc<Self>, ctx: &ConnCtx) -> Result<TlsFilter> {
        let role = self.mode.unwrap_or(ctx.role);
        let state = match role {
            Role::Client => {
                let host = ctx.host.clone().unwrap_or_else(|| "localhost".to_string());
                let name = ServerName::try_from(host.clone())
                    .map_err(|_| GensioError::config(format!("ssl: bad server name '{host}'")))?;
                let conn = ClientConnection::new(Arc::new(self.client_config()?), name)?;
                TlsState::Conn(Connection::Client(conn))
            }
            Role::Server => {
                if self.identity.is_none() {
                    return Err(GensioError::config("ssl: a server needs cert and key"));
                }
                TlsState::Accepting(Box::default())
            }
        };
        Ok(TlsFilter {
            factory: Arc::clone(self),
            role,
            state,
            ca: self.ca.as_ref().map(|(path, _)| path.clone()),
            precert: ctx.precert.clone(),
        })
    }
}

enum TlsState {
    Accepting(Box<Acceptor>),
    Conn(Connection),
    Failed,
}

pub(crate) struct TlsFilter {
    factory: Arc<TlsFactory>,
    role: Role,
    state: TlsState,
    /// CA path in force for this connection.
    ca: Option<String>,
    precert: Option<PrecertHook>,
}

impl TlsFilter {
    /// Server config for one connection, after the verify hook had its say.
    fn config_for_connection(&mut self) -> Result<Arc<ServerConfig>> {
        let mut cv = CertVerify::new(FilterKind::Ssl, self.ca.clone());
        run_precert(self.precert.as_ref(), &mut cv)?;
        self.ca = cv.into_ca();
        let roots = match (&self.ca, &self.factory.ca) {
            (None, _) => None,
            (Some(path), Some((static_path, roots))) if path == static_path => Some(Arc::clone(roots)),
            (Some(path), _) => Some(Arc::new(load_roots(path)?)),
        };
        self.factory.server_config(roots)
    }

    fn peer_cert(&self) -> Result<&CertificateDer<'static>> {
        match &self.state {
            TlsState::Conn(c) => c
                .peer_certificates()
                .and_then(|certs| certs.first())
                .ok_or(GensioError::NotReady),
            _ => Err(GensioError::NotReady),
        }
    }
}

/// Move records and plaintext between rustls and the layer's buffers.
fn pump(conn: &mut Connection, io: &mut FilterIo) -> Result<()> {
    let processed = conn.process_new_packets();
    // alerts go out even when processing failed
    while conn.wants_write() {
        conn.write_tls(&mut io.down)?;
    }
    processed?;

    let mut buf = vec![0u8; PLAINTEXT_CHUNK];
    loop {
        match conn.reader().read(&mut buf) {
            Ok(0) => {
                io.eof = true;
                return Ok(());
            }
            Ok(n) => io.up.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

impl Filter for TlsFilter {
    fn setup(&mut self, io: &mut FilterIo) -> Result<()> {
        if let TlsState::Conn(conn) = &mut self.state {
            while conn.wants_write() {
                conn.write_tls(&mut io.down)?;
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        matches!(&self.state, TlsState::Conn(c) if !c.is_handshaking())
    }

    fn ll_read(&mut self, data: &[u8], io: &mut FilterIo) -> Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            match std::mem::replace(&mut self.state, TlsState::Failed) {
                TlsState::Accepting(mut acceptor) => {
                    acceptor.read_tls(&mut rest)?;
                    match acceptor.accept() {
                        Ok(None) => self.state = TlsState::Accepting(acceptor),
                        Ok(Some(accepted)) => {
                            let config = match self.config_for_connection() {
                                Ok(c) => c,
                                Err(e) => {
                                    tracing::debug!(error = %e, "tls server setup failed");
                                    return Err(e);
                                }
                            };
                            match accepted.into_connection(config) {
                                Ok(conn) => {
                                    let mut conn = Connection::Server(conn);
                                    let res = pump(&mut conn, io);
                                    self.state = TlsState::Conn(conn);
                                    res?;
                                }
                                Err((e, mut alert)) => {
                                    let _ = alert.write_all(&mut io.down);
                                    return Err(e.into());
                                }
                            }
                        }
                        Err((e, mut alert)) => {
                            let _ = alert.write_all(&mut io.down);
                            return Err(e.into());
                        }
                    }
                }
                TlsState::Conn(mut conn) => {
                    let res = conn.read_tls(&mut rest).map_err(GensioError::from).and_then(|_| pump(&mut conn, io));
                    self.state = TlsState::Conn(conn);
                    if let Err(e) = res {
                        self.state = TlsState::Failed;
                        return Err(e);
                    }
                }
                TlsState::Failed => return Err(GensioError::comm("tls session failed")),
            }
        }
        Ok(())
    }

    fn ul_write(&mut self, data: &[u8], io: &mut FilterIo) -> Result<()> {
        let TlsState::Conn(conn) = &mut self.state else {
            return Err(GensioError::NotReady);
        };
        conn.writer().write_all(data)?;
        while conn.wants_write() {
            conn.write_tls(&mut io.down)?;
        }
        Ok(())
    }

    fn control(&mut self, get: bool, op: ControlOp, data: &str, _io: &mut FilterIo) -> Result<String> {
        match (op, get) {
            (ControlOp::GetPeerCertName, true) => x509::peer_cert_name(self.peer_cert()?, data),
            (ControlOp::Cert, true) => Ok(x509::to_pem(self.peer_cert()?)),
            (ControlOp::CertAuth, true) => self.ca.clone().ok_or(GensioError::NotReady),
            (ControlOp::CertAuth, false) => match self.state {
                TlsState::Accepting(_) => {
                    load_roots(data)?;
                    self.ca = Some(data.to_string());
                    Ok(String::new())
                }
                _ => Err(GensioError::NotReady),
            },
            _ => Err(GensioError::NotSupported),
        }
    }

    fn close(&mut self, io: &mut FilterIo) {
        if let TlsState::Conn(conn) = &mut self.state {
            conn.send_close_notify();
            while conn.wants_write() {
                if conn.write_tls(&mut io.down).is_err() {
                    break;
                }
            }
        }
    }

    fn is_authenticated(&self) -> bool {
        match self.role {
            Role::Client => self.is_open(),
            Role::Server => self.is_open() && self.peer_cert().is_ok(),
        }
    }

    fn is_encrypted(&self) -> bool {
        self.is_open()
    }
}
