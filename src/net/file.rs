//! File transport: reads stream from `infile`, writes go to `outfile`.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::addr::{BaseSpec, TransportKind};
use crate::error::{GensioError, Result};
use crate::net::{Aux, Incoming, Link, LinkAttrs, LinkControl, Outgoing};
use crate::os::Selector;

pub(crate) const OPTIONS: &[&str] = &[
    "infile", "outfile", "create", "mode", "umode", "gmode", "omode", "readbuf",
];

/// One permission digit, either octal (`6`) or `rwx` letters.
fn parse_perm(key: &str, v: &str) -> Result<u32> {
    let bad = || GensioError::config(format!("file: bad {key} '{v}'"));
    if let Some(d) = v.chars().next().and_then(|c| c.to_digit(8)) {
        return if v.len() == 1 { Ok(d) } else { Err(bad()) };
    }
    v.chars().try_fold(0, |mode, c| match c {
        'r' => Ok(mode | 4),
        'w' => Ok(mode | 2),
        'x' => Ok(mode | 1),
        _ => Err(bad()),
    })
}

/// File creation mode: `mode=644` or the per-class `umode`/`gmode`/`omode`.
fn creation_mode(base: &BaseSpec) -> Result<u32> {
    if let Some(v) = base.args.value("mode") {
        return u32::from_str_radix(v, 8)
            .ok()
            .filter(|m| *m <= 0o777)
            .ok_or_else(|| GensioError::config(format!("file: bad mode '{v}'")));
    }
    let mut mode = 0;
    for (key, shift) in [("umode", 6), ("gmode", 3), ("omode", 0)] {
        let perm = match base.args.value(key) {
            Some(v) => parse_perm(key, v)?,
            None => 6,
        };
        mode |= perm << shift;
    }
    Ok(mode)
}

pub(crate) fn open(base: &BaseSpec, selector: &Selector) -> Result<Link> {
    let readbuf = base.args.usize("readbuf")?.unwrap_or(selector.defaults().read_buffer);
    if readbuf == 0 {
        return Err(GensioError::config("file: readbuf must be > 0"));
    }
    let create = base.args.bool("create")?.unwrap_or(false);
    let mode = creation_mode(base)?;

    let infile = base
        .args
        .value("infile")
        .map(|path| {
            std::fs::File::open(path)
                .map(File::from_std)
                .map_err(|e| GensioError::open(path, e))
        })
        .transpose()?;
    let outfile = base
        .args
        .value("outfile")
        .map(|path| {
            let mut opts = OpenOptions::new();
            opts.append(true).create(create).mode(mode);
            opts.open(path)
                .map(File::from_std)
                .map_err(|e| GensioError::open(path, e))
        })
        .transpose()?;

    let attrs = LinkAttrs {
        reliable: true,
        ..Default::default()
    };
    let (mut link, ends) = Link::new(TransportKind::File, attrs, Box::new(FileControl));
    if let Some(f) = infile {
        link.abort_on_close(tokio::spawn(reader(f, ends.incoming.clone(), readbuf)));
    }
    link.drain_on_close(tokio::spawn(writer(outfile, ends.outgoing, ends.incoming)));
    Ok(link)
}

async fn reader(mut f: File, tx: mpsc::Sender<Incoming>, readbuf: usize) {
    let mut buf = vec![0u8; readbuf];
    loop {
        let event = match f.read(&mut buf).await {
            Ok(0) => Incoming::Closed,
            Ok(n) => Incoming::Data {
                data: Bytes::copy_from_slice(&buf[..n]),
                aux: Aux::default(),
            },
            Err(e) => Incoming::Error(e.into()),
        };
        let last = matches!(event, Incoming::Closed | Incoming::Error(_));
        if tx.send(event).await.is_err() || last {
            return;
        }
    }
}

async fn writer(mut f: Option<File>, mut rx: mpsc::Receiver<Outgoing>, errors: mpsc::Sender<Incoming>) {
    while let Some(out) = rx.recv().await {
        let res = match (out, f.as_mut()) {
            (Outgoing::Data { data, .. }, Some(f)) => f.write_all(&data).await,
            // no outfile: the bytes count as written
            (Outgoing::Data { .. }, None) => Ok(()),
            (Outgoing::Shutdown, Some(f)) => {
                let _ = f.flush().await;
                return;
            }
            (Outgoing::Shutdown, None) => return,
        };
        if let Err(e) = res {
            let _ = errors.send(Incoming::Error(e.into())).await;
            return;
        }
    }
}

struct FileControl;

impl LinkControl for FileControl {}
