//! Control operations addressed to a single layer of a stream.

use std::fmt;
use std::str::FromStr;

use crate::error::GensioError;

/// Operation codes. The numeric values are stable and match the classic
/// gensio control numbering where one exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ControlOp {
    NoDelay = 1,
    Streams = 2,
    SendBreak = 3,
    GetPeerCertName = 4,
    CertAuth = 5,
    Username = 6,
    Cert = 8,
    MaxWritePacket = 11,
    ExitCode = 13,
    LAddr = 17,
    LPort = 18,
    CloseOutput = 19,
    RAddr = 21,
    EnableOob = 33,
    Rs485 = 1001,
}

impl ControlOp {
    const NAMES: [(ControlOp, &'static str); 15] = [
        (ControlOp::NoDelay, "nodelay"),
        (ControlOp::Streams, "streams"),
        (ControlOp::SendBreak, "send_break"),
        (ControlOp::GetPeerCertName, "get_peer_cert_name"),
        (ControlOp::CertAuth, "cert_auth"),
        (ControlOp::Username, "username"),
        (ControlOp::Cert, "cert"),
        (ControlOp::MaxWritePacket, "max_write_packet"),
        (ControlOp::ExitCode, "exit_code"),
        (ControlOp::LAddr, "laddr"),
        (ControlOp::LPort, "lport"),
        (ControlOp::CloseOutput, "close_output"),
        (ControlOp::RAddr, "raddr"),
        (ControlOp::EnableOob, "enable_oob"),
        (ControlOp::Rs485, "rs485"),
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::NAMES.iter().map(|(op, _)| *op).find(|op| op.code() == code)
    }

    pub fn name(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(op, _)| *op == self)
            .map(|(_, n)| *n)
            .unwrap_or("unknown")
    }
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ControlOp {
    type Err = GensioError;

    /// Accepts a name (`streams`) or a numeric code (`2`).
    fn from_str(s: &str) -> Result<Self, GensioError> {
        let by_name = Self::NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(s))
            .map(|(op, _)| *op);
        by_name
            .or_else(|| s.parse().ok().and_then(Self::from_code))
            .ok_or_else(|| GensioError::config(format!("unknown control operation '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_codes() {
        assert_eq!("streams".parse::<ControlOp>().unwrap(), ControlOp::Streams);
        assert_eq!("4".parse::<ControlOp>().unwrap(), ControlOp::GetPeerCertName);
        assert_eq!(ControlOp::from_code(5), Some(ControlOp::CertAuth));
        assert_eq!(ControlOp::ExitCode.to_string(), "exit_code");
        assert!("7".parse::<ControlOp>().is_err());
    }
}
