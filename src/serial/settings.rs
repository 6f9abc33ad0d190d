//! `9600N81,LOCAL,rs485=...` style serial device options.

use std::fmt;
use std::str::FromStr;

use crate::error::{GensioError, Result};
use crate::serial::ops::*;

/// RS-485 transceiver timing and mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rs485Config {
    pub delay_before: u32,
    pub delay_after: u32,
    pub rts_on_send: bool,
    pub rts_after_send: bool,
    pub rx_during_tx: bool,
    pub terminate_bus: bool,
}

impl FromStr for Rs485Config {
    type Err = GensioError;

    /// `<before>:<after>[:flag]*`
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let mut delay = |what: &str| -> Result<u32> {
            let v = parts
                .next()
                .ok_or_else(|| GensioError::config(format!("rs485: missing {what}")))?;
            v.trim()
                .parse()
                .map_err(|_| GensioError::config(format!("rs485: bad {what} '{v}'")))
        };
        let mut cfg = Rs485Config {
            delay_before: delay("delay before send")?,
            delay_after: delay("delay after send")?,
            ..Default::default()
        };
        for flag in parts {
            match flag.trim().to_ascii_lowercase().as_str() {
                "rts_on_send" => cfg.rts_on_send = true,
                "rts_after_send" => cfg.rts_after_send = true,
                "rx_during_tx" => cfg.rx_during_tx = true,
                "terminate_bus" => cfg.terminate_bus = true,
                other => return Err(GensioError::config(format!("rs485: unknown flag '{other}'"))),
            }
        }
        Ok(cfg)
    }
}

impl fmt::Display for Rs485Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.delay_before, self.delay_after)?;
        for (set, name) in [
            (self.rts_on_send, "rts_on_send"),
            (self.rts_after_send, "rts_after_send"),
            (self.rx_during_tx, "rx_during_tx"),
            (self.terminate_bus, "terminate_bus"),
        ] {
            if set {
                write!(f, ":{name}")?;
            }
        }
        Ok(())
    }
}

/// Parse the control operand: a config or `off`.
pub fn parse_rs485(s: &str) -> Result<Option<Rs485Config>> {
    if s.trim().eq_ignore_ascii_case("off") {
        Ok(None)
    } else {
        s.parse().map(Some)
    }
}

/// Line settings for a serial device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSettings {
    pub baud: u32,
    pub parity: u32,
    pub datasize: u32,
    pub stopbits: u32,
    /// Ignore modem control lines (CLOCAL).
    pub local: bool,
    pub hangup_when_done: bool,
    pub rtscts: bool,
    pub xonxoff: bool,
    /// Clear any break condition on open.
    pub nobreak: bool,
    pub rs485: Option<Rs485Config>,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud: 9600,
            parity: PARITY_NONE,
            datasize: 8,
            stopbits: STOPBITS_1,
            local: false,
            hangup_when_done: false,
            rtscts: false,
            xonxoff: false,
            nobreak: false,
            rs485: None,
        }
    }
}

impl LineSettings {
    /// Parse the option fields that follow the device path.
    pub fn parse<S: AsRef<str>>(fields: &[S]) -> Result<Self> {
        let mut s = LineSettings::default();
        for field in fields {
            let field = field.as_ref().trim();
            let upper = field.to_ascii_uppercase();
            match upper.as_str() {
                "" => {}
                "LOCAL" | "CLOCAL" => s.local = true,
                "-LOCAL" | "-CLOCAL" => s.local = false,
                "HANGUP_WHEN_DONE" | "HUPCL" => s.hangup_when_done = true,
                "-HANGUP_WHEN_DONE" | "-HUPCL" => s.hangup_when_done = false,
                "RTSCTS" => s.rtscts = true,
                "-RTSCTS" => s.rtscts = false,
                "XONXOFF" => s.xonxoff = true,
                "-XONXOFF" => s.xonxoff = false,
                "NOBREAK" => s.nobreak = true,
                _ if upper.starts_with("RS485=") => s.rs485 = parse_rs485(&field[6..])?,
                _ if field.starts_with(|c: char| c.is_ascii_digit()) => s.apply_speed(field)?,
                _ => return Err(GensioError::config(format!("serialdev: unknown option '{field}'"))),
            }
        }
        Ok(s)
    }

    /// `<baud>[<parity><datasize><stopbits>]`, e.g. `115200` or `9600N81`.
    fn apply_speed(&mut self, field: &str) -> Result<()> {
        let digits = field.find(|c: char| !c.is_ascii_digit()).unwrap_or(field.len());
        let bad = || GensioError::config(format!("serialdev: bad speed '{field}'"));
        self.baud = field[..digits].parse().map_err(|_| bad())?;
        let rest = field[digits..].as_bytes();
        match rest {
            [] => Ok(()),
            [p, d, s] => {
                self.parity = str_to_parity(&(*p as char).to_string()).ok_or_else(bad)?;
                self.datasize = match d {
                    b'5'..=b'8' => u32::from(d - b'0'),
                    _ => return Err(bad()),
                };
                self.stopbits = match s {
                    b'1' => STOPBITS_1,
                    b'2' => STOPBITS_2,
                    _ => return Err(bad()),
                };
                Ok(())
            }
            _ => Err(bad()),
        }
    }

    pub fn flowcontrol(&self) -> u32 {
        if self.rtscts {
            FLOWCONTROL_RTSCTS
        } else if self.xonxoff {
            FLOWCONTROL_XONXOFF
        } else {
            FLOWCONTROL_NONE
        }
    }
}

impl fmt::Display for LineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            PARITY_ODD => 'O',
            PARITY_EVEN => 'E',
            PARITY_MARK => 'M',
            PARITY_SPACE => 'S',
            _ => 'N',
        };
        let stop = if self.stopbits == STOPBITS_2 { 2 } else { 1 };
        write!(f, "{}{}{}{}", self.baud, parity, self.datasize, stop)?;
        if self.local {
            f.write_str(",LOCAL")?;
        }
        if self.rtscts {
            f.write_str(",RTSCTS")?;
        }
        if self.xonxoff {
            f.write_str(",XONXOFF")?;
        }
        Ok(())
    }
}
