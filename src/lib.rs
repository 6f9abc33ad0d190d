//! gensio: stackable streams over network, serial and process transports.
//!
//! # Architecture Overview
//!
//! ```text
//!   application                                   accepter
//!       │ Gensio::new(spec) / open                    │ startup / new_connection
//!       ▼                                             ▼
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │ gensio   stream handle + per-stream task (conn)              │
//!  │    │                                                         │
//!  │    ▼                                                         │
//!  │ filter   telnet/rfc2217 ─ tls ─ certauth ─ trace (sans-IO)   │
//!  │    │                                                         │
//!  │    ▼                                                         │
//!  │ net      tcp │ udp │ sctp │ serialdev │ stdio │ file  (Link) │
//!  └──────────────────────────────────────────────────────────────┘
//!        cross-cutting: addr (spec parsing), config, os (Selector,
//!        Waiter), observability (log sink + tracing), serial, control
//! ```
//!
//! A spec string names the stack outermost first, e.g.
//! `telnet(rfc2217),tcp,localhost,3001` or `ssl(CA=ca.pem),tcp,host,443`.

pub mod accepter;
pub mod addr;
pub mod config;
pub mod control;
pub mod error;
pub mod filter;
pub mod gensio;
pub mod net;
pub mod observability;
pub mod os;
pub mod serial;

pub use accepter::{Accepter, AccepterEvent, AccepterState};
pub use config::GensioConfig;
pub use control::ControlOp;
pub use error::{ErrorKind, GensioError, Result};
pub use filter::CertVerify;
pub use gensio::{Event, Gensio, GensioId, SerGensio, StreamState};
pub use net::sctp::sctp_supported;
pub use net::Aux;
pub use observability::logging::{LogLevel, LogMask, LogSink};
pub use os::{Selector, Waiter};
pub use serial::{ModemState, SerialOp};
