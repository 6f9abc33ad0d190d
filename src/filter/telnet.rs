//! Telnet framing, option negotiation and the RFC2217 serial relay.

use crate::addr::FilterSpec;
use crate::control::ControlOp;
use crate::error::{GensioError, Result};
use crate::filter::rfc2217::{self, ComPort, COM_PORT_OPTION};
use crate::filter::{ConnCtx, Filter, FilterEvent, FilterIo, Role, SerialNotify};
use crate::serial::SerialOp;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const BREAK: u8 = 243;
const SE: u8 = 240;

const OPT_BINARY: u8 = 0;
const OPT_SGA: u8 = 3;

/// Longest subnegotiation kept; longer ones are dropped.
const MAX_SUBNEG: usize = 1024;

const OPTIONS: &[&str] = &["rfc2217", "mode"];

#[derive(Debug, Clone)]
pub(crate) struct TelnetConfig {
    pub rfc2217: bool,
    mode: Option<Role>,
}

impl TelnetConfig {
    pub fn from_spec(spec: &FilterSpec) -> Result<Self> {
        spec.args.check_known("telnet", OPTIONS)?;
        let mode = match spec.args.value("mode") {
            Some(_) => Some(Role::from_args(spec, Role::Client)?),
            None => None,
        };
        Ok(Self {
            rfc2217: spec.args.bool("rfc2217")?.unwrap_or(false),
            mode,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

pub(crate) struct TelnetFilter {
    role: Role,
    rfc2217: bool,
    open: bool,
    /// The peer agreed to COM-PORT-OPTION.
    com_port: bool,
    state: ParseState,
    sub: Vec<u8>,
    sub_overflow: bool,
    /// Options enabled on our side / the peer's side.
    local: [bool; 256],
    remote: [bool; 256],
    modem_mask: u8,
}

impl TelnetFilter {
    pub fn new(cfg: &TelnetConfig, ctx: &ConnCtx) -> Self {
        Self {
            role: cfg.mode.unwrap_or(ctx.role),
            rfc2217: cfg.rfc2217,
            open: false,
            com_port: false,
            state: ParseState::Data,
            sub: Vec::new(),
            sub_overflow: false,
            local: [false; 256],
            remote: [false; 256],
            modem_mask: 0xff,
        }
    }

    fn supports_local(&self, opt: u8) -> bool {
        matches!(opt, OPT_BINARY | OPT_SGA) || (opt == COM_PORT_OPTION && self.rfc2217 && self.role == Role::Client)
    }

    fn supports_remote(&self, opt: u8) -> bool {
        matches!(opt, OPT_BINARY | OPT_SGA) || (opt == COM_PORT_OPTION && self.rfc2217 && self.role == Role::Server)
    }

    fn negotiate(&mut self, cmd: u8, opt: u8, io: &mut FilterIo) {
        let i = opt as usize;
        match cmd {
            DO if self.supports_local(opt) => {
                if !self.local[i] {
                    self.local[i] = true;
                    io.down.extend_from_slice(&[IAC, WILL, opt]);
                }
                if opt == COM_PORT_OPTION {
                    self.com_port = true;
                    self.open = true;
                }
            }
            DO => io.down.extend_from_slice(&[IAC, WONT, opt]),
            DONT => {
                if opt == COM_PORT_OPTION && self.role == Role::Client && !self.open {
                    // refused: carry on without serial control
                    self.local[i] = false;
                    self.open = true;
                } else if self.local[i] {
                    self.local[i] = false;
                    io.down.extend_from_slice(&[IAC, WONT, opt]);
                }
            }
            WILL if self.supports_remote(opt) => {
                if !self.remote[i] {
                    self.remote[i] = true;
                    io.down.extend_from_slice(&[IAC, DO, opt]);
                }
                if opt == COM_PORT_OPTION {
                    self.com_port = true;
                }
            }
            WILL => io.down.extend_from_slice(&[IAC, DONT, opt]),
            WONT => {
                if self.remote[i] {
                    self.remote[i] = false;
                    io.down.extend_from_slice(&[IAC, DONT, opt]);
                }
                if opt == COM_PORT_OPTION {
                    self.com_port = false;
                }
            }
            _ => {}
        }
    }

    fn send_com_port(&self, msg: &ComPort, io: &mut FilterIo) {
        let payload = rfc2217::encode(msg, self.role == Role::Server);
        io.down.extend_from_slice(&[IAC, SB, COM_PORT_OPTION]);
        escape_into(&payload, &mut io.down);
        io.down.extend_from_slice(&[IAC, SE]);
    }

    fn subnegotiation(&mut self, io: &mut FilterIo) {
        let sub = std::mem::take(&mut self.sub);
        let Some((&opt, payload)) = sub.split_first() else {
            return;
        };
        if opt != COM_PORT_OPTION || !self.rfc2217 {
            tracing::debug!(option = opt, "ignoring subnegotiation");
            return;
        }
        let (msg, from_server) = match rfc2217::decode(payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "bad com-port subnegotiation");
                return;
            }
        };
        if from_server != (self.role == Role::Client) {
            tracing::debug!(?msg, "com-port message in the wrong direction");
            return;
        }
        match (self.role, msg) {
            (Role::Server, ComPort::Serial(op, v)) => io.events.push(FilterEvent::SerialRequest(op, v)),
            (Role::Client, ComPort::Serial(op, v)) => io.events.push(FilterEvent::SerialAck(op, v)),
            (_, ComPort::Signature(s)) => io.events.push(FilterEvent::Signature(s)),
            (_, ComPort::FlowSuspend) => io.events.push(FilterEvent::FlowState(true)),
            (_, ComPort::FlowResume) => io.events.push(FilterEvent::FlowState(false)),
            (Role::Client, ComPort::ModemState(b)) => io.events.push(FilterEvent::Modem(b)),
            (Role::Client, ComPort::LineState(b)) => io.events.push(FilterEvent::LineState(b)),
            (Role::Server, ComPort::ModemStateMask(m)) => {
                self.modem_mask = m;
                self.send_com_port(&ComPort::ModemStateMask(m), io);
            }
            (Role::Server, msg @ (ComPort::LineStateMask(_) | ComPort::Purge(_))) => {
                self.send_com_port(&msg, io);
            }
            (_, msg) => tracing::debug!(?msg, "unhandled com-port message"),
        }
    }
}

fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for chunk in data.split_inclusive(|b| *b == IAC) {
        out.extend_from_slice(chunk);
        if chunk.last() == Some(&IAC) {
            out.push(IAC);
        }
    }
}

impl Filter for TelnetFilter {
    fn setup(&mut self, io: &mut FilterIo) -> Result<()> {
        if self.rfc2217 && self.role == Role::Client {
            self.local[COM_PORT_OPTION as usize] = true;
            io.down.extend_from_slice(&[IAC, WILL, COM_PORT_OPTION]);
        } else {
            self.open = true;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn ll_read(&mut self, data: &[u8], io: &mut FilterIo) -> Result<()> {
        for &b in data {
            self.state = match (self.state, b) {
                (ParseState::Data, IAC) => ParseState::Iac,
                (ParseState::Data, _) => {
                    io.up.push(b);
                    ParseState::Data
                }
                (ParseState::Iac, IAC) => {
                    io.up.push(IAC);
                    ParseState::Data
                }
                (ParseState::Iac, DO | DONT | WILL | WONT) => ParseState::Negotiate(b),
                (ParseState::Iac, SB) => {
                    self.sub.clear();
                    self.sub_overflow = false;
                    ParseState::Sub
                }
                (ParseState::Iac, BREAK) => {
                    io.events.push(FilterEvent::Break);
                    ParseState::Data
                }
                (ParseState::Iac, _) => ParseState::Data,
                (ParseState::Negotiate(cmd), opt) => {
                    self.negotiate(cmd, opt, io);
                    ParseState::Data
                }
                (ParseState::Sub, IAC) => ParseState::SubIac,
                (ParseState::Sub, _) | (ParseState::SubIac, IAC) => {
                    if self.sub.len() < MAX_SUBNEG {
                        self.sub.push(b);
                    } else {
                        self.sub_overflow = true;
                    }
                    ParseState::Sub
                }
                (ParseState::SubIac, SE) => {
                    if self.sub_overflow {
                        tracing::debug!("oversized subnegotiation dropped");
                        self.sub.clear();
                    } else {
                        self.subnegotiation(io);
                    }
                    ParseState::Data
                }
                // protocol violation; resync on plain data
                (ParseState::SubIac, _) => ParseState::Data,
            };
        }
        Ok(())
    }

    fn ul_write(&mut self, data: &[u8], io: &mut FilterIo) -> Result<()> {
        escape_into(data, &mut io.down);
        Ok(())
    }

    fn control(&mut self, get: bool, op: ControlOp, _data: &str, io: &mut FilterIo) -> Result<String> {
        match op {
            ControlOp::SendBreak if !get => {
                io.down.extend_from_slice(&[IAC, BREAK]);
                Ok(String::new())
            }
            _ => Err(GensioError::NotSupported),
        }
    }

    fn is_serial(&self) -> bool {
        self.rfc2217
    }

    fn serial_request(&mut self, op: SerialOp, value: u32, io: &mut FilterIo) -> Result<()> {
        if !self.com_port {
            return Err(GensioError::NotSupported);
        }
        op.check(value)?;
        self.send_com_port(&ComPort::Serial(op, value), io);
        Ok(())
    }

    fn serial_notify(&mut self, notify: &SerialNotify, io: &mut FilterIo) -> Result<()> {
        if !self.com_port {
            return Err(GensioError::NotSupported);
        }
        let msg = match (self.role, notify) {
            (Role::Server, SerialNotify::ModemState(b)) => ComPort::ModemState(b & self.modem_mask),
            (Role::Server, SerialNotify::LineState(b)) => ComPort::LineState(*b),
            (Role::Client, SerialNotify::ModemMask(m)) => ComPort::ModemStateMask(*m),
            (_, SerialNotify::FlowState(true)) => ComPort::FlowSuspend,
            (_, SerialNotify::FlowState(false)) => ComPort::FlowResume,
            (_, SerialNotify::Signature(s)) => ComPort::Signature(s.clone()),
            _ => return Err(GensioError::NotSupported),
        };
        self.send_com_port(&msg, io);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::StackSpec;

    fn telnet(role: Role, rfc2217: bool) -> TelnetFilter {
        let cfg = TelnetConfig {
            rfc2217,
            mode: None,
        };
        let ctx = ConnCtx {
            role,
            host: None,
            precert: None,
        };
        TelnetFilter::new(&cfg, &ctx)
    }

    /// Feed each side's output into the other until both go quiet.
    fn exchange(a: &mut TelnetFilter, b: &mut TelnetFilter, first: Vec<u8>) -> (FilterIo, FilterIo) {
        let (mut a_total, mut b_total) = (FilterIo::default(), FilterIo::default());
        let mut to_b = first;
        while !to_b.is_empty() {
            let mut io = FilterIo::default();
            b.ll_read(&to_b, &mut io).unwrap();
            let to_a = std::mem::take(&mut io.down);
            b_total.up.extend(io.up);
            b_total.events.extend(io.events);
            let mut io = FilterIo::default();
            a.ll_read(&to_a, &mut io).unwrap();
            to_b = std::mem::take(&mut io.down);
            a_total.up.extend(io.up);
            a_total.events.extend(io.events);
        }
        (a_total, b_total)
    }

    fn opened_pair() -> (TelnetFilter, TelnetFilter) {
        let mut client = telnet(Role::Client, true);
        let mut server = telnet(Role::Server, true);
        let mut io = FilterIo::default();
        server.setup(&mut io).unwrap();
        assert!(server.is_open());
        let mut io = FilterIo::default();
        client.setup(&mut io).unwrap();
        assert!(!client.is_open());
        assert_eq!(io.down, [IAC, WILL, COM_PORT_OPTION]);
        exchange(&mut client, &mut server, io.down);
        assert!(client.is_open());
        (client, server)
    }

    #[test]
    fn iac_is_escaped_both_ways() {
        let mut t = telnet(Role::Client, false);
        let mut io = FilterIo::default();
        t.setup(&mut io).unwrap();
        assert!(t.is_open());
        t.ul_write(&[1, IAC, 2], &mut io).unwrap();
        assert_eq!(io.down, [1, IAC, IAC, 2]);
        let mut io = FilterIo::default();
        t.ll_read(&[1, IAC, IAC, 2], &mut io).unwrap();
        assert_eq!(io.up, [1, IAC, 2]);
    }

    #[test]
    fn commands_split_across_reads() {
        let mut t = telnet(Role::Server, false);
        let mut io = FilterIo::default();
        t.ll_read(&[b'a', IAC], &mut io).unwrap();
        t.ll_read(&[BREAK, b'b'], &mut io).unwrap();
        assert_eq!(io.up, b"ab");
        assert_eq!(io.events, vec![FilterEvent::Break]);
    }

    #[test]
    fn negotiation_accepts_binary_refuses_echo() {
        let mut t = telnet(Role::Server, false);
        let mut io = FilterIo::default();
        t.ll_read(&[IAC, DO, OPT_BINARY, IAC, DO, 1, IAC, WILL, OPT_SGA], &mut io).unwrap();
        assert_eq!(
            io.down,
            [IAC, WILL, OPT_BINARY, IAC, WONT, 1, IAC, DO, OPT_SGA]
        );
        // repeated requests are not answered again
        let mut io = FilterIo::default();
        t.ll_read(&[IAC, DO, OPT_BINARY], &mut io).unwrap();
        assert!(io.down.is_empty());
    }

    #[test]
    fn com_port_refused_still_opens() {
        let mut client = telnet(Role::Client, true);
        let mut server = telnet(Role::Server, false);
        let mut io = FilterIo::default();
        client.setup(&mut io).unwrap();
        exchange(&mut client, &mut server, io.down);
        assert!(client.is_open());
        let mut io = FilterIo::default();
        assert!(client.serial_request(SerialOp::Baud, 9600, &mut io).unwrap_err().is_not_supported());
    }

    #[test]
    fn serial_request_and_ack() {
        let (mut client, mut server) = opened_pair();
        let mut io = FilterIo::default();
        client.serial_request(SerialOp::Baud, 19200, &mut io).unwrap();
        let (_, server_io) = exchange(&mut client, &mut server, io.down);
        assert_eq!(server_io.events, vec![FilterEvent::SerialRequest(SerialOp::Baud, 19200)]);

        let mut io = FilterIo::default();
        server.serial_request(SerialOp::Baud, 9600, &mut io).unwrap();
        let (_, client_io) = exchange(&mut server, &mut client, io.down);
        assert_eq!(client_io.events, vec![FilterEvent::SerialAck(SerialOp::Baud, 9600)]);
    }

    #[test]
    fn modemstate_notify_honours_mask() {
        let (mut client, mut server) = opened_pair();
        let mut io = FilterIo::default();
        client.serial_notify(&SerialNotify::ModemMask(0x0f), &mut io).unwrap();
        exchange(&mut client, &mut server, io.down);

        let mut io = FilterIo::default();
        server.serial_notify(&SerialNotify::ModemState(0x88), &mut io).unwrap();
        let (_, client_io) = exchange(&mut server, &mut client, io.down);
        assert_eq!(client_io.events, vec![FilterEvent::Modem(0x08)]);
    }

    #[test]
    fn baud_with_iac_byte_survives() {
        let (mut client, mut server) = opened_pair();
        // 0x0000ff00 carries an IAC in the payload
        let mut io = FilterIo::default();
        client.serial_request(SerialOp::Baud, 0xff00, &mut io).unwrap();
        let (_, server_io) = exchange(&mut client, &mut server, io.down);
        assert_eq!(server_io.events, vec![FilterEvent::SerialRequest(SerialOp::Baud, 0xff00)]);
    }

    #[test]
    fn config_from_spec() {
        let spec = StackSpec::parse("telnet(rfc2217),tcp,localhost,3000").unwrap();
        assert!(TelnetConfig::from_spec(&spec.filters[0]).unwrap().rfc2217);
        let spec = StackSpec::parse("telnet(bogus),tcp,localhost,3000").unwrap();
        assert!(TelnetConfig::from_spec(&spec.filters[0]).is_err());
    }
}
