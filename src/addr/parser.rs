//! Spec-string parsing: `filter(opts),...,transport(opts),positional...`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::addr::args::{split_top_level, str_to_argv, Args};
use crate::error::{GensioError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Telnet,
    Ssl,
    CertAuth,
    Trace,
}

impl FilterKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "telnet" => Some(FilterKind::Telnet),
            "ssl" | "tls" => Some(FilterKind::Ssl),
            "certauth" => Some(FilterKind::CertAuth),
            "trace" => Some(FilterKind::Trace),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FilterKind::Telnet => "telnet",
            FilterKind::Ssl => "ssl",
            FilterKind::CertAuth => "certauth",
            FilterKind::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
    Sctp,
    SerialDev,
    Stdio,
    File,
}

impl TransportKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(TransportKind::Tcp),
            "udp" => Some(TransportKind::Udp),
            "sctp" => Some(TransportKind::Sctp),
            "serialdev" => Some(TransportKind::SerialDev),
            "stdio" => Some(TransportKind::Stdio),
            "file" => Some(TransportKind::File),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Sctp => "sctp",
            TransportKind::SerialDev => "serialdev",
            TransportKind::Stdio => "stdio",
            TransportKind::File => "file",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub kind: FilterKind,
    pub args: Args,
}

/// The bottom layer: a transport with its options and positional fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseSpec {
    pub kind: TransportKind,
    pub args: Args,
    /// Comma separated positional fields (empty for stdio).
    pub fields: Vec<String>,
    /// Everything after the transport name, unsplit.
    pub raw: String,
}

impl BaseSpec {
    fn new(kind: TransportKind, args: Args, rest: &str) -> Result<Self> {
        let fields = if kind == TransportKind::Stdio {
            Vec::new()
        } else {
            split_top_level(rest, ',')?
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect()
        };
        let base = Self {
            kind,
            args,
            fields,
            raw: rest.trim().to_string(),
        };
        base.check()?;
        Ok(base)
    }

    fn check(&self) -> Result<()> {
        match self.kind {
            TransportKind::Tcp | TransportKind::Udp | TransportKind::Sctp => {
                NetAddr::parse(&self.fields).map(|_| ())
            }
            TransportKind::SerialDev => match self.fields.first() {
                Some(_) => Ok(()),
                None => Err(GensioError::config("serialdev: missing device path")),
            },
            TransportKind::Stdio => {
                if self.argv()?.is_empty() {
                    Err(GensioError::config("stdio: missing command"))
                } else {
                    Ok(())
                }
            }
            TransportKind::File => {
                if self.fields.is_empty() {
                    Ok(())
                } else {
                    Err(GensioError::config("file: takes no positional fields"))
                }
            }
        }
    }

    pub fn net_addr(&self) -> Result<NetAddr> {
        NetAddr::parse(&self.fields)
    }

    /// Command line for stdio.
    pub fn argv(&self) -> Result<Vec<String>> {
        str_to_argv(&self.raw)
    }
}

/// A parsed stack, outermost filter first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSpec {
    pub filters: Vec<FilterSpec>,
    pub base: BaseSpec,
}

impl StackSpec {
    pub fn parse(s: &str) -> Result<Self> {
        let mut filters = Vec::new();
        let mut cur = s.trim();

        loop {
            if cur.is_empty() {
                return Err(GensioError::config(format!("'{s}': missing transport")));
            }
            let head = split_head(cur)?;
            let name = head.name.trim().to_ascii_lowercase();
            let args = match head.args {
                Some(a) => Args::parse(a)?,
                None => Args::default(),
            };

            if let Some(kind) = FilterKind::from_name(&name) {
                let rest = head.rest.ok_or_else(|| {
                    GensioError::config(format!("{}: filter needs a layer below it", kind.name()))
                })?;
                filters.push(FilterSpec { kind, args });
                cur = rest.trim();
                continue;
            }

            let base = match TransportKind::from_name(&name) {
                Some(kind) => BaseSpec::new(kind, args, head.rest.unwrap_or(""))?,
                None if head.args.is_some() => {
                    return Err(GensioError::config(format!("unknown layer '{}'", head.name)));
                }
                // a bare address means tcp
                None => BaseSpec::new(TransportKind::Tcp, Args::default(), cur)?,
            };
            return Ok(Self { filters, base });
        }
    }

    /// Layer names, outermost first.
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.filters
            .iter()
            .map(|f| f.kind.name())
            .chain(std::iter::once(self.base.kind.name()))
            .collect()
    }
}

struct Head<'a> {
    name: &'a str,
    args: Option<&'a str>,
    rest: Option<&'a str>,
}

fn split_head(s: &str) -> Result<Head<'_>> {
    let name_end = s.find(['(', ',']).unwrap_or(s.len());
    let name = &s[..name_end];
    if name.trim().is_empty() {
        return Err(GensioError::config(format!("'{s}': empty layer name")));
    }

    if !s[name_end..].starts_with('(') {
        let rest = s.get(name_end + 1..).filter(|_| name_end < s.len());
        return Ok(Head {
            name,
            args: None,
            rest,
        });
    }

    let close = matching_paren(s, name_end)?;
    let args = &s[name_end + 1..close];
    let after = &s[close + 1..];
    let rest = if after.trim().is_empty() {
        None
    } else if let Some(r) = after.trim_start().strip_prefix(',') {
        Some(r)
    } else {
        return Err(GensioError::config(format!("'{s}': unexpected text after ')'")));
    };
    Ok(Head {
        name,
        args: Some(args),
        rest,
    })
}

fn matching_paren(s: &str, open: usize) -> Result<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in s.char_indices().skip_while(|(i, _)| *i < open) {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' | '\'' if quote.is_none() => quote = Some(c),
            c if Some(c) == quote => quote = None,
            '(' if quote.is_none() => depth += 1,
            ')' if quote.is_none() => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }
    Err(GensioError::config(format!("'{s}': unbalanced parentheses")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Any,
    Ipv4,
    Ipv6,
}

/// `[ipv4|ipv6,][host,]port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddr {
    pub family: Family,
    pub host: Option<String>,
    pub port: u16,
}

impl NetAddr {
    pub fn parse(fields: &[String]) -> Result<Self> {
        let (family, fields) = match fields.first().map(|f| f.to_ascii_lowercase()) {
            Some(f) if f == "ipv4" => (Family::Ipv4, &fields[1..]),
            Some(f) if f == "ipv6" => (Family::Ipv6, &fields[1..]),
            _ => (Family::Any, fields),
        };
        let (host, port) = match fields {
            [port] => (None, port),
            [host, port] => (Some(host.clone()), port),
            _ => {
                return Err(GensioError::config(format!(
                    "expected [host,]port, got '{}'",
                    fields.join(",")
                )))
            }
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| GensioError::config(format!("invalid port '{port}'")))?;
        Ok(Self { family, host, port })
    }

    fn matches(&self, addr: &SocketAddr) -> bool {
        match self.family {
            Family::Any => true,
            Family::Ipv4 => addr.is_ipv4(),
            Family::Ipv6 => addr.is_ipv6(),
        }
    }

    /// Resolve the remote addresses to try, in resolver order.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let host = self
            .host
            .as_deref()
            .ok_or_else(|| GensioError::config("a host is required to connect"))?;
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, self.port))
            .await
            .map_err(|e| GensioError::open(host, e))?
            .filter(|a| self.matches(a))
            .collect();
        if addrs.is_empty() {
            return Err(GensioError::OpenFailure(format!("{host}: no usable address")));
        }
        Ok(addrs)
    }

    /// Local address to listen on; no host means every address.
    pub async fn bind_addr(&self) -> Result<SocketAddr> {
        match &self.host {
            None => {
                let ip = match self.family {
                    Family::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                    _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                };
                Ok(SocketAddr::new(ip, self.port))
            }
            Some(_) => Ok(self.resolve().await?[0]),
        }
    }
}
