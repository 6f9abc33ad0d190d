//! Certificate-based login over an existing stream.
//!
//! ```text
//! client                                server
//!   HELLO(version, username)  ───────▶
//!                             ◀───────  CHALLENGE(32 random bytes)
//!   CERT(der)                 ───────▶
//!   SIG(scheme, signature)    ───────▶  hook, chain check, signature check
//!                             ◀───────  RESULT(code)
//! ```
//! Frames are `[type u8][len u16 BE][payload]`. Once RESULT is exchanged the
//! layer passes data through untouched.

use std::sync::Arc;

use rand::RngCore;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, SignatureVerificationAlgorithm, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::sign::SigningKey;
use rustls::{RootCertStore, SignatureScheme};

use crate::addr::{FilterKind, FilterSpec};
use crate::control::ControlOp;
use crate::error::{GensioError, Result};
use crate::filter::tls::{ca_from_args, load_roots, provider, Identity};
use crate::filter::{run_precert, x509, CertVerify, ConnCtx, Filter, FilterIo, PrecertHook, Role};
use crate::os::Selector;

const OPTIONS: &[&str] = &["CA", "cert", "key", "username", "mode"];

const VERSION: u8 = 1;
const CHALLENGE_LEN: usize = 32;
const SIGNED_PREFIX: &[u8] = b"gensio certauth";

const MSG_HELLO: u8 = 1;
const MSG_CHALLENGE: u8 = 2;
const MSG_CERT: u8 = 3;
const MSG_SIG: u8 = 4;
const MSG_RESULT: u8 = 5;

const RESULT_OK: u8 = 0;
const RESULT_CERT_REJECTED: u8 = 1;
const RESULT_BAD_SIGNATURE: u8 = 2;
const RESULT_PROTOCOL: u8 = 3;

const SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ED25519,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PKCS1_SHA256,
];

fn verify_alg(scheme: SignatureScheme) -> Option<&'static dyn SignatureVerificationAlgorithm> {
    Some(match scheme {
        SignatureScheme::ECDSA_NISTP256_SHA256 => webpki::ring::ECDSA_P256_SHA256,
        SignatureScheme::ECDSA_NISTP384_SHA384 => webpki::ring::ECDSA_P384_SHA384,
        SignatureScheme::ED25519 => webpki::ring::ED25519,
        SignatureScheme::RSA_PSS_SHA256 => webpki::ring::RSA_PSS_2048_8192_SHA256_LEGACY_KEY,
        SignatureScheme::RSA_PKCS1_SHA256 => webpki::ring::RSA_PKCS1_2048_8192_SHA256,
        _ => return None,
    })
}

fn signed_message(challenge: &[u8]) -> Vec<u8> {
    [SIGNED_PREFIX, challenge].concat()
}

fn frame(kind: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let len = u16::try_from(payload.len())
        .map_err(|_| GensioError::comm("certauth: message too large"))?;
    out.push(kind);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Pop one complete frame off the front of `buf`.
fn next_frame(buf: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
    if buf.len() < 3 {
        return None;
    }
    let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    if buf.len() < 3 + len {
        return None;
    }
    let kind = buf[0];
    let payload = buf[3..3 + len].to_vec();
    buf.drain(..3 + len);
    Some((kind, payload))
}

pub(crate) struct CertAuthFactory {
    ca: Option<(String, Arc<RootCertStore>)>,
    identity: Option<Identity>,
    signer: Option<Arc<dyn SigningKey>>,
    username: Option<String>,
    mode: Option<Role>,
}

impl CertAuthFactory {
    pub fn new(spec: &FilterSpec, selector: &Selector) -> Result<Self> {
        spec.args.check_known("certauth", OPTIONS)?;
        let identity = Identity::from_args(spec, selector)?;
        let signer = identity
            .as_ref()
            .map(|id| any_supported_type(&id.key))
            .transpose()
            .map_err(|e| GensioError::config(format!("certauth: unusable key: {e}")))?;
        let mode = match spec.args.value("mode") {
            Some(_) => Some(Role::from_args(spec, Role::Client)?),
            None => None,
        };
        Ok(Self {
            ca: ca_from_args(spec, selector)?,
            identity,
            signer,
            username: spec.args.value("username").map(str::to_string),
            mode,
        })
    }

    pub fn build(self: &Arc<Self>, ctx: &ConnCtx) -> Result<CertAuthFilter> {
        let role = self.mode.unwrap_or(ctx.role);
        if role == Role::Client && self.signer.is_none() {
            return Err(GensioError::config("certauth: a client needs cert and key"));
        }
        Ok(CertAuthFilter {
            factory: Arc::clone(self),
            role,
            phase: match role {
                Role::Client => Phase::Hello,
                Role::Server => Phase::WaitHello,
            },
            inbuf: Vec::new(),
            username: if role == Role::Client {
                self.username.clone()
            } else {
                None
            },
            challenge: Vec::new(),
            peer_cert: None,
            ca: self.ca.as_ref().map(|(path, _)| path.clone()),
            precert: ctx.precert.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    // client
    Hello,
    WaitChallenge,
    WaitResult,
    // server
    WaitHello,
    WaitCert,
    WaitSig,
    Open,
    Failed,
}

pub(crate) struct CertAuthFilter {
    factory: Arc<CertAuthFactory>,
    role: Role,
    phase: Phase,
    inbuf: Vec<u8>,
    /// Our username on a client, the peer's on a server.
    username: Option<String>,
    challenge: Vec<u8>,
    peer_cert: Option<CertificateDer<'static>>,
    ca: Option<String>,
    precert: Option<PrecertHook>,
}

impl CertAuthFilter {
    fn fail(&mut self, msg: impl Into<String>) -> GensioError {
        self.phase = Phase::Failed;
        GensioError::comm(format!("certauth: {}", msg.into()))
    }

    /// Server side: reject with `code`, telling the client why.
    fn reject(&mut self, code: u8, msg: impl Into<String>, io: &mut FilterIo) -> GensioError {
        let _ = frame(MSG_RESULT, &[code], &mut io.down);
        self.fail(msg)
    }

    fn client_frame(&mut self, kind: u8, payload: &[u8], io: &mut FilterIo) -> Result<()> {
        match (self.phase, kind) {
            (Phase::WaitChallenge, MSG_CHALLENGE) => {
                if payload.len() != CHALLENGE_LEN {
                    return Err(self.fail("bad challenge"));
                }
                let factory = Arc::clone(&self.factory);
                let (Some(id), Some(key)) = (&factory.identity, &factory.signer) else {
                    return Err(self.fail("no identity"));
                };
                let signer = key
                    .choose_scheme(SCHEMES)
                    .ok_or_else(|| GensioError::comm("certauth: no usable signature scheme"))?;
                let sig = signer.sign(&signed_message(payload))?;
                frame(MSG_CERT, id.certs[0].as_ref(), &mut io.down)?;
                let mut sig_msg = u16::from(signer.scheme()).to_be_bytes().to_vec();
                sig_msg.extend_from_slice(&sig);
                frame(MSG_SIG, &sig_msg, &mut io.down)?;
                self.phase = Phase::WaitResult;
                Ok(())
            }
            (Phase::WaitResult, MSG_RESULT) => match payload.first() {
                Some(&RESULT_OK) => {
                    tracing::debug!("certauth accepted");
                    self.phase = Phase::Open;
                    Ok(())
                }
                Some(code) => Err(self.fail(format!("server rejected login (code {code})"))),
                None => Err(self.fail("empty result")),
            },
            _ => Err(self.fail(format!("unexpected message {kind}"))),
        }
    }

    fn server_frame(&mut self, kind: u8, payload: &[u8], io: &mut FilterIo) -> Result<()> {
        match (self.phase, kind) {
            (Phase::WaitHello, MSG_HELLO) => {
                let Some((&version, name)) = payload.split_first() else {
                    return Err(self.reject(RESULT_PROTOCOL, "empty hello", io));
                };
                if version != VERSION {
                    return Err(self.reject(RESULT_PROTOCOL, format!("version {version} unsupported"), io));
                }
                if !name.is_empty() {
                    self.username = Some(String::from_utf8_lossy(name).into_owned());
                }
                let mut challenge = vec![0u8; CHALLENGE_LEN];
                rand::thread_rng().fill_bytes(&mut challenge);
                frame(MSG_CHALLENGE, &challenge, &mut io.down)?;
                self.challenge = challenge;
                self.phase = Phase::WaitCert;
                Ok(())
            }
            (Phase::WaitCert, MSG_CERT) => {
                self.peer_cert = Some(CertificateDer::from(payload.to_vec()));
                self.phase = Phase::WaitSig;
                Ok(())
            }
            (Phase::WaitSig, MSG_SIG) => self.verify(payload, io),
            _ => Err(self.reject(RESULT_PROTOCOL, format!("unexpected message {kind}"), io)),
        }
    }

    fn verify(&mut self, sig_msg: &[u8], io: &mut FilterIo) -> Result<()> {
        let Some(cert) = self.peer_cert.clone() else {
            return Err(self.reject(RESULT_PROTOCOL, "signature before certificate", io));
        };

        let mut cv = CertVerify::new(FilterKind::CertAuth, self.ca.clone())
            .with_peer(self.username.clone(), Some(cert.as_ref().to_vec()));
        if let Err(e) = run_precert(self.precert.as_ref(), &mut cv) {
            return Err(self.reject(RESULT_CERT_REJECTED, e.to_string(), io));
        }
        self.ca = cv.into_ca();

        let roots = match (&self.ca, &self.factory.ca) {
            (None, _) => None,
            (Some(path), Some((static_path, roots))) if path == static_path => Some(Arc::clone(roots)),
            (Some(path), _) => match load_roots(path) {
                Ok(r) => Some(Arc::new(r)),
                Err(e) => return Err(self.reject(RESULT_CERT_REJECTED, e.to_string(), io)),
            },
        };
        if let Some(roots) = roots {
            let checked = WebPkiClientVerifier::builder_with_provider(roots, provider())
                .build()
                .map_err(|e| e.to_string())
                .and_then(|v| {
                    v.verify_client_cert(&cert, &[], UnixTime::now())
                        .map_err(|e| e.to_string())
                });
            if let Err(e) = checked {
                return Err(self.reject(RESULT_CERT_REJECTED, format!("certificate not trusted: {e}"), io));
            }
        }

        if sig_msg.len() < 2 {
            return Err(self.reject(RESULT_PROTOCOL, "short signature message", io));
        }
        let scheme = SignatureScheme::from(u16::from_be_bytes([sig_msg[0], sig_msg[1]]));
        let Some(alg) = verify_alg(scheme) else {
            return Err(self.reject(RESULT_BAD_SIGNATURE, format!("unsupported scheme {scheme:?}"), io));
        };
        let valid = webpki::EndEntityCert::try_from(&cert)
            .and_then(|ee| ee.verify_signature(alg, &signed_message(&self.challenge), &sig_msg[2..]));
        if let Err(e) = valid {
            return Err(self.reject(RESULT_BAD_SIGNATURE, format!("bad signature: {e}"), io));
        }

        frame(MSG_RESULT, &[RESULT_OK], &mut io.down)?;
        tracing::debug!(username = ?self.username, "certauth login accepted");
        self.phase = Phase::Open;
        Ok(())
    }
}

impl Filter for CertAuthFilter {
    fn setup(&mut self, io: &mut FilterIo) -> Result<()> {
        if self.phase == Phase::Hello {
            let mut hello = vec![VERSION];
            hello.extend_from_slice(self.username.as_deref().unwrap_or("").as_bytes());
            frame(MSG_HELLO, &hello, &mut io.down)?;
            self.phase = Phase::WaitChallenge;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    fn ll_read(&mut self, data: &[u8], io: &mut FilterIo) -> Result<()> {
        match self.phase {
            Phase::Open => {
                io.up.extend_from_slice(data);
                return Ok(());
            }
            Phase::Failed => return Err(GensioError::comm("certauth: login failed")),
            _ => {}
        }
        self.inbuf.extend_from_slice(data);
        while self.phase != Phase::Open {
            let Some((kind, payload)) = next_frame(&mut self.inbuf) else {
                return Ok(());
            };
            match self.role {
                Role::Client => self.client_frame(kind, &payload, io)?,
                Role::Server => self.server_frame(kind, &payload, io)?,
            }
        }
        // data that followed the last handshake frame
        io.up.append(&mut self.inbuf);
        Ok(())
    }

    fn ul_write(&mut self, data: &[u8], io: &mut FilterIo) -> Result<()> {
        if self.phase != Phase::Open {
            return Err(GensioError::NotReady);
        }
        io.down.extend_from_slice(data);
        Ok(())
    }

    fn control(&mut self, get: bool, op: ControlOp, data: &str, _io: &mut FilterIo) -> Result<String> {
        match (op, get) {
            (ControlOp::Username, true) => self.username.clone().ok_or(GensioError::NotReady),
            (ControlOp::GetPeerCertName, true) if self.role == Role::Server => match &self.peer_cert {
                Some(cert) => x509::peer_cert_name(cert, data),
                None => Err(GensioError::NotReady),
            },
            (ControlOp::Cert, true) if self.role == Role::Server => match &self.peer_cert {
                Some(cert) => Ok(x509::to_pem(cert)),
                None => Err(GensioError::NotReady),
            },
            (ControlOp::CertAuth, true) => self.ca.clone().ok_or(GensioError::NotReady),
            (ControlOp::CertAuth, false) => {
                if self.role != Role::Server || self.phase == Phase::Open {
                    return Err(GensioError::NotReady);
                }
                load_roots(data)?;
                self.ca = Some(data.to_string());
                Ok(String::new())
            }
            _ => Err(GensioError::NotSupported),
        }
    }

    fn is_authenticated(&self) -> bool {
        self.phase == Phase::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_length_prefixed() {
        let mut out = Vec::new();
        frame(MSG_HELLO, b"\x01bob", &mut out).unwrap();
        assert_eq!(out, b"\x01\x00\x04\x01bob");

        let mut buf = out.clone();
        buf.extend_from_slice(b"\x05\x00");
        assert_eq!(next_frame(&mut buf), Some((MSG_HELLO, b"\x01bob".to_vec())));
        // the partial RESULT header stays buffered
        assert_eq!(next_frame(&mut buf), None);
        assert_eq!(buf, b"\x05\x00");
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut out = Vec::new();
        assert!(frame(MSG_CERT, &vec![0u8; 70_000], &mut out).is_err());
    }

    #[test]
    fn every_offered_scheme_can_be_verified() {
        for scheme in SCHEMES {
            assert!(verify_alg(*scheme).is_some(), "{scheme:?}");
        }
        assert!(verify_alg(SignatureScheme::RSA_PKCS1_SHA1).is_none());
    }
}
