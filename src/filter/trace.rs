//! Pass-through layer that records the traffic crossing it.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::addr::FilterSpec;
use crate::error::{GensioError, Result};
use crate::filter::{Filter, FilterIo};

const OPTIONS: &[&str] = &["dir", "raw", "file", "stdout", "stderr", "delold"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    None,
    Read,
    Write,
    Both,
}

impl Direction {
    fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "none" => Self::None,
            "read" => Self::Read,
            "write" => Self::Write,
            "both" => Self::Both,
            _ => return Err(GensioError::config(format!("trace: bad dir '{s}'"))),
        })
    }

    fn reads(self) -> bool {
        matches!(self, Self::Read | Self::Both)
    }

    fn writes(self) -> bool {
        matches!(self, Self::Write | Self::Both)
    }
}

enum Sink {
    Tracing,
    Stdout,
    Stderr,
    File(Mutex<File>),
}

impl Sink {
    fn emit(&self, text: &[u8]) {
        let res = match self {
            Sink::Tracing => {
                tracing::debug!(target: "gensio::trace", "{}", String::from_utf8_lossy(text).trim_end());
                Ok(())
            }
            Sink::Stdout => io::stdout().lock().write_all(text),
            Sink::Stderr => io::stderr().lock().write_all(text),
            Sink::File(f) => match f.lock() {
                Ok(mut f) => f.write_all(text).and_then(|_| f.flush()),
                Err(_) => Ok(()),
            },
        };
        if let Err(e) = res {
            tracing::warn!(error = %e, "trace output failed");
        }
    }
}

/// Hex dump with offsets and a printable column, 16 bytes per line.
fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(16).enumerate() {
        out.push_str(&format!("  {:04x}:", line * 16));
        for b in chunk {
            out.push_str(&format!(" {b:02x}"));
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str("  ");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}

pub(crate) struct TraceFactory {
    dir: Direction,
    raw: bool,
    sink: Arc<Sink>,
}

impl TraceFactory {
    pub fn new(spec: &FilterSpec) -> Result<Self> {
        let args = &spec.args;
        args.check_known("trace", OPTIONS)?;
        let dir = args.value("dir").map(Direction::parse).transpose()?.unwrap_or(Direction::None);
        let sink = match args.value("file") {
            Some(path) => {
                let delold = args.bool("delold")?.unwrap_or(false);
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(!delold)
                    .truncate(delold)
                    .open(path)
                    .map_err(|e| GensioError::config(format!("trace: {path}: {e}")))?;
                Sink::File(Mutex::new(file))
            }
            None if args.bool("stdout")?.unwrap_or(false) => Sink::Stdout,
            None if args.bool("stderr")?.unwrap_or(false) => Sink::Stderr,
            None => Sink::Tracing,
        };
        Ok(Self {
            dir,
            raw: args.bool("raw")?.unwrap_or(false),
            sink: Arc::new(sink),
        })
    }

    pub fn build(&self) -> TraceFilter {
        TraceFilter {
            dir: self.dir,
            raw: self.raw,
            sink: Arc::clone(&self.sink),
        }
    }
}

pub(crate) struct TraceFilter {
    dir: Direction,
    raw: bool,
    sink: Arc<Sink>,
}

impl TraceFilter {
    fn record(&self, what: &str, data: &[u8]) {
        if self.raw {
            self.sink.emit(data);
            return;
        }
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let text = format!(
            "{}.{:06} {what} {} bytes\n{}",
            ts.as_secs(),
            ts.subsec_micros(),
            data.len(),
            hex_dump(data)
        );
        self.sink.emit(text.as_bytes());
    }
}

impl Filter for TraceFilter {
    fn is_open(&self) -> bool {
        true
    }

    fn ll_read(&mut self, data: &[u8], io: &mut FilterIo) -> Result<()> {
        if self.dir.reads() {
            self.record("read", data);
        }
        io.up.extend_from_slice(data);
        Ok(())
    }

    fn ul_write(&mut self, data: &[u8], io: &mut FilterIo) -> Result<()> {
        if self.dir.writes() {
            self.record("write", data);
        }
        io.down.extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::StackSpec;

    fn factory(spec: &str) -> Result<TraceFactory> {
        let parsed = StackSpec::parse(spec)?;
        TraceFactory::new(&parsed.filters[0])
    }

    #[test]
    fn hex_dump_layout() {
        let dump = hex_dump(b"hello\x00world, this is long");
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("  0000: 68 65 6c 6c 6f 00"));
        assert!(lines[0].ends_with("hello.world, thi"));
        assert!(lines[1].starts_with("  0010: 73 20"));
    }

    #[test]
    fn raw_file_records_both_directions() {
        let dir = std::env::temp_dir().join(format!("gensio-trace-{}", std::process::id()));
        let path = dir.with_extension("log");
        let spec = format!("trace(dir=both,raw,delold,file={}),tcp,localhost,1", path.display());
        let mut filter = factory(&spec).unwrap().build();

        let mut io = FilterIo::default();
        filter.ul_write(b"out", &mut io).unwrap();
        filter.ll_read(b"in", &mut io).unwrap();
        assert_eq!(io.down, b"out");
        assert_eq!(io.up, b"in");

        assert_eq!(std::fs::read(&path).unwrap(), b"outin");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn bad_direction_rejected() {
        assert!(factory("trace(dir=sideways),tcp,localhost,1").is_err());
        assert!(factory("trace(colour=red),tcp,localhost,1").is_err());
    }
}
