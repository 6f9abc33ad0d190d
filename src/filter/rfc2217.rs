//! RFC2217 COM-PORT-OPTION subnegotiation payloads.
//!
//! A payload is `<command> <data…>`; replies from the access server carry
//! the command plus 100. Escaping of IAC bytes is the telnet layer's job.

use crate::error::{GensioError, Result};
use crate::serial::SerialOp;

/// Telnet option number of COM-PORT-OPTION.
pub(crate) const COM_PORT_OPTION: u8 = 44;

const SERVER_OFFSET: u8 = 100;

const SIGNATURE: u8 = 0;
const SET_BAUDRATE: u8 = 1;
const SET_DATASIZE: u8 = 2;
const SET_PARITY: u8 = 3;
const SET_STOPSIZE: u8 = 4;
const SET_CONTROL: u8 = 5;
const NOTIFY_LINESTATE: u8 = 6;
const NOTIFY_MODEMSTATE: u8 = 7;
const FLOWCONTROL_SUSPEND: u8 = 8;
const FLOWCONTROL_RESUME: u8 = 9;
const SET_LINESTATE_MASK: u8 = 10;
const SET_MODEMSTATE_MASK: u8 = 11;
const PURGE_DATA: u8 = 12;

/// SET-CONTROL value ranges: first code of each group is the query.
const CONTROL_FLOW: u8 = 0;
const CONTROL_BREAK: u8 = 4;
const CONTROL_DTR: u8 = 7;
const CONTROL_RTS: u8 = 10;
const CONTROL_IFLOW: u8 = 13;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ComPort {
    Signature(String),
    Serial(SerialOp, u32),
    LineState(u8),
    ModemState(u8),
    FlowSuspend,
    FlowResume,
    LineStateMask(u8),
    ModemStateMask(u8),
    Purge(u8),
}

fn control_byte(op: SerialOp, value: u32) -> u8 {
    let base = match op {
        SerialOp::FlowControl => CONTROL_FLOW,
        SerialOp::SBreak => CONTROL_BREAK,
        SerialOp::Dtr => CONTROL_DTR,
        SerialOp::Rts => CONTROL_RTS,
        _ => CONTROL_IFLOW,
    };
    base + value as u8
}

fn from_control_byte(c: u8) -> Option<(SerialOp, u32)> {
    let (op, base) = match c {
        0..=3 => (SerialOp::FlowControl, CONTROL_FLOW),
        4..=6 => (SerialOp::SBreak, CONTROL_BREAK),
        7..=9 => (SerialOp::Dtr, CONTROL_DTR),
        10..=12 => (SerialOp::Rts, CONTROL_RTS),
        13..=19 => (SerialOp::IFlowControl, CONTROL_IFLOW),
        _ => return None,
    };
    Some((op, (c - base) as u32))
}

/// Command byte and data for `msg`.
pub(crate) fn encode(msg: &ComPort, from_server: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    let code = |c: u8| if from_server { c + SERVER_OFFSET } else { c };
    match msg {
        ComPort::Signature(s) => {
            out.push(code(SIGNATURE));
            out.extend_from_slice(s.as_bytes());
        }
        ComPort::Serial(SerialOp::Baud, v) => {
            out.push(code(SET_BAUDRATE));
            out.extend_from_slice(&v.to_be_bytes());
        }
        ComPort::Serial(op @ (SerialOp::DataSize | SerialOp::Parity | SerialOp::StopBits), v) => {
            out.push(code(match op {
                SerialOp::DataSize => SET_DATASIZE,
                SerialOp::Parity => SET_PARITY,
                _ => SET_STOPSIZE,
            }));
            out.push(*v as u8);
        }
        ComPort::Serial(op, v) => {
            out.push(code(SET_CONTROL));
            out.push(control_byte(*op, *v));
        }
        ComPort::LineState(b) => {
            out.push(code(NOTIFY_LINESTATE));
            out.push(*b);
        }
        ComPort::ModemState(b) => {
            out.push(code(NOTIFY_MODEMSTATE));
            out.push(*b);
        }
        ComPort::FlowSuspend => out.push(code(FLOWCONTROL_SUSPEND)),
        ComPort::FlowResume => out.push(code(FLOWCONTROL_RESUME)),
        ComPort::LineStateMask(m) => {
            out.push(code(SET_LINESTATE_MASK));
            out.push(*m);
        }
        ComPort::ModemStateMask(m) => {
            out.push(code(SET_MODEMSTATE_MASK));
            out.push(*m);
        }
        ComPort::Purge(p) => {
            out.push(code(PURGE_DATA));
            out.push(*p);
        }
    }
    out
}

/// Decode a payload; the flag tells whether it came from the server.
pub(crate) fn decode(payload: &[u8]) -> Result<(ComPort, bool)> {
    let bad = || GensioError::comm(format!("rfc2217: malformed command {payload:?}"));
    let (&raw, data) = payload.split_first().ok_or_else(bad)?;
    let from_server = raw >= SERVER_OFFSET;
    let cmd = if from_server { raw - SERVER_OFFSET } else { raw };
    let byte = || data.first().copied().ok_or_else(bad);

    let msg = match cmd {
        SIGNATURE => ComPort::Signature(String::from_utf8_lossy(data).into_owned()),
        SET_BAUDRATE => {
            let b: [u8; 4] = data.get(..4).and_then(|b| b.try_into().ok()).ok_or_else(bad)?;
            ComPort::Serial(SerialOp::Baud, u32::from_be_bytes(b))
        }
        SET_DATASIZE => ComPort::Serial(SerialOp::DataSize, byte()? as u32),
        SET_PARITY => ComPort::Serial(SerialOp::Parity, byte()? as u32),
        SET_STOPSIZE => ComPort::Serial(SerialOp::StopBits, byte()? as u32),
        SET_CONTROL => {
            let (op, v) = from_control_byte(byte()?).ok_or_else(bad)?;
            ComPort::Serial(op, v)
        }
        NOTIFY_LINESTATE => ComPort::LineState(byte()?),
        NOTIFY_MODEMSTATE => ComPort::ModemState(byte()?),
        FLOWCONTROL_SUSPEND => ComPort::FlowSuspend,
        FLOWCONTROL_RESUME => ComPort::FlowResume,
        SET_LINESTATE_MASK => ComPort::LineStateMask(byte()?),
        SET_MODEMSTATE_MASK => ComPort::ModemStateMask(byte()?),
        PURGE_DATA => ComPort::Purge(byte()?),
        _ => return Err(bad()),
    };
    Ok((msg, from_server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::ops::*;

    #[test]
    fn baud_is_big_endian() {
        let wire = encode(&ComPort::Serial(SerialOp::Baud, 115200), false);
        assert_eq!(wire, [1, 0x00, 0x01, 0xc2, 0x00]);
        assert_eq!(decode(&wire).unwrap(), (ComPort::Serial(SerialOp::Baud, 115200), false));
    }

    #[test]
    fn server_replies_add_100() {
        let wire = encode(&ComPort::Serial(SerialOp::Parity, PARITY_EVEN), true);
        assert_eq!(wire, [103, 3]);
        assert_eq!(decode(&wire).unwrap(), (ComPort::Serial(SerialOp::Parity, PARITY_EVEN), true));
        assert_eq!(encode(&ComPort::ModemState(0x90), true), [107, 0x90]);
    }

    #[test]
    fn set_control_groups() {
        let cases = [
            (SerialOp::FlowControl, 0, 0),
            (SerialOp::FlowControl, FLOWCONTROL_RTSCTS, 3),
            (SerialOp::SBreak, 0, 4),
            (SerialOp::SBreak, SERIAL_ON, 5),
            (SerialOp::SBreak, SERIAL_OFF, 6),
            (SerialOp::Dtr, 0, 7),
            (SerialOp::Dtr, SERIAL_ON, 8),
            (SerialOp::Rts, SERIAL_OFF, 12),
            (SerialOp::IFlowControl, 0, 13),
            (SerialOp::IFlowControl, FLOWCONTROL_NONE, 14),
            (SerialOp::IFlowControl, FLOWCONTROL_DSR, 19),
        ];
        for (op, value, code) in cases {
            let wire = encode(&ComPort::Serial(op, value), false);
            assert_eq!(wire, [SET_CONTROL, code], "{op} {value}");
            assert_eq!(decode(&wire).unwrap().0, ComPort::Serial(op, value));
        }
    }

    #[test]
    fn malformed_payloads() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[SET_BAUDRATE, 1, 2]).is_err());
        assert!(decode(&[SET_CONTROL, 20]).is_err());
        assert!(decode(&[50]).is_err());
    }
}
