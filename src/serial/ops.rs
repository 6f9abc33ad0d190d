//! Serial line operations and their wire values.
//!
//! Values follow RFC2217 numbering so they can cross a telnet link
//! unchanged. Zero always means "query the current value".

use std::fmt;

use crate::error::{GensioError, Result};

pub const PARITY_NONE: u32 = 1;
pub const PARITY_ODD: u32 = 2;
pub const PARITY_EVEN: u32 = 3;
pub const PARITY_MARK: u32 = 4;
pub const PARITY_SPACE: u32 = 5;

pub const STOPBITS_1: u32 = 1;
pub const STOPBITS_2: u32 = 2;
pub const STOPBITS_1_5: u32 = 3;

pub const FLOWCONTROL_NONE: u32 = 1;
pub const FLOWCONTROL_XONXOFF: u32 = 2;
pub const FLOWCONTROL_RTSCTS: u32 = 3;
pub const FLOWCONTROL_DCD: u32 = 4;
pub const FLOWCONTROL_DTR: u32 = 5;
pub const FLOWCONTROL_DSR: u32 = 6;

pub const SERIAL_ON: u32 = 1;
pub const SERIAL_OFF: u32 = 2;

/// Completion for an asynchronous serial request: the applied value.
pub type SerialDone = Box<dyn FnOnce(Result<u32>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialOp {
    Baud,
    DataSize,
    Parity,
    StopBits,
    FlowControl,
    IFlowControl,
    SBreak,
    Dtr,
    Rts,
}

impl SerialOp {
    pub const ALL: [SerialOp; 9] = [
        SerialOp::Baud,
        SerialOp::DataSize,
        SerialOp::Parity,
        SerialOp::StopBits,
        SerialOp::FlowControl,
        SerialOp::IFlowControl,
        SerialOp::SBreak,
        SerialOp::Dtr,
        SerialOp::Rts,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SerialOp::Baud => "baud",
            SerialOp::DataSize => "datasize",
            SerialOp::Parity => "parity",
            SerialOp::StopBits => "stopbits",
            SerialOp::FlowControl => "flowcontrol",
            SerialOp::IFlowControl => "iflowcontrol",
            SerialOp::SBreak => "sbreak",
            SerialOp::Dtr => "dtr",
            SerialOp::Rts => "rts",
        }
    }

    /// Range check for a set request; 0 (query) is always valid.
    pub fn check(self, value: u32) -> Result<()> {
        let ok = value == 0
            || match self {
                SerialOp::Baud => true,
                SerialOp::DataSize => (5..=8).contains(&value),
                SerialOp::Parity => (PARITY_NONE..=PARITY_SPACE).contains(&value),
                SerialOp::StopBits => (STOPBITS_1..=STOPBITS_1_5).contains(&value),
                SerialOp::FlowControl => (FLOWCONTROL_NONE..=FLOWCONTROL_RTSCTS).contains(&value),
                SerialOp::IFlowControl => (FLOWCONTROL_NONE..=FLOWCONTROL_DSR).contains(&value),
                SerialOp::SBreak | SerialOp::Dtr | SerialOp::Rts => {
                    value == SERIAL_ON || value == SERIAL_OFF
                }
            };
        if ok {
            Ok(())
        } else {
            Err(GensioError::OutOfRange(format!("{}: {value}", self.name())))
        }
    }
}

impl fmt::Display for SerialOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn parity_to_str(v: u32) -> &'static str {
    match v {
        PARITY_NONE => "none",
        PARITY_ODD => "odd",
        PARITY_EVEN => "even",
        PARITY_MARK => "mark",
        PARITY_SPACE => "space",
        _ => "unknown",
    }
}

pub fn str_to_parity(s: &str) -> Option<u32> {
    match s.to_ascii_lowercase().as_str() {
        "none" | "n" => Some(PARITY_NONE),
        "odd" | "o" => Some(PARITY_ODD),
        "even" | "e" => Some(PARITY_EVEN),
        "mark" | "m" => Some(PARITY_MARK),
        "space" | "s" => Some(PARITY_SPACE),
        _ => None,
    }
}

pub fn flowcontrol_to_str(v: u32) -> &'static str {
    match v {
        FLOWCONTROL_NONE => "none",
        FLOWCONTROL_XONXOFF => "xonxoff",
        FLOWCONTROL_RTSCTS => "rtscts",
        FLOWCONTROL_DCD => "dcd",
        FLOWCONTROL_DTR => "dtr",
        FLOWCONTROL_DSR => "dsr",
        _ => "unknown",
    }
}

pub fn str_to_flowcontrol(s: &str) -> Option<u32> {
    match s.to_ascii_lowercase().as_str() {
        "none" => Some(FLOWCONTROL_NONE),
        "xonxoff" => Some(FLOWCONTROL_XONXOFF),
        "rtscts" => Some(FLOWCONTROL_RTSCTS),
        "dcd" => Some(FLOWCONTROL_DCD),
        "dtr" => Some(FLOWCONTROL_DTR),
        "dsr" => Some(FLOWCONTROL_DSR),
        _ => None,
    }
}

pub fn onoff_to_str(v: u32) -> &'static str {
    match v {
        SERIAL_ON => "on",
        SERIAL_OFF => "off",
        _ => "unknown",
    }
}
