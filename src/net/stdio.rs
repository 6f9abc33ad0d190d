//! Child process transport over piped stdio.
//!
//! Stdout is the main stream, stdin takes writes. Stderr is only read once
//! a channel is opened for it.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, Notify};

use crate::addr::{Args, BaseSpec, TransportKind};
use crate::control::ControlOp;
use crate::error::{GensioError, Result};
use crate::net::{Aux, Incoming, Link, LinkAttrs, LinkControl, Outgoing, READ_CHUNK};
use crate::os::Selector;

pub(crate) const OPTIONS: &[&str] = &["noredir-stderr"];

fn attrs() -> LinkAttrs {
    LinkAttrs {
        reliable: true,
        ..Default::default()
    }
}

pub(crate) fn spawn(base: &BaseSpec, _selector: &Selector) -> Result<Link> {
    let argv = base.argv()?;
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| GensioError::config("stdio: empty command line"))?;
    let noredir = base.args.bool("noredir-stderr")?.unwrap_or(false);

    let mut cmd = Command::new(program);
    cmd.args(rest)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(if noredir { Stdio::inherit() } else { Stdio::piped() })
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|e| GensioError::open(program, e))?;
    tracing::debug!(program = %program, pid = ?child.id(), "child started");

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let exit_code = Arc::new(Mutex::new(None));
    let close_input = Arc::new(Notify::new());

    let ctl = StdioControl {
        exit_code: Arc::clone(&exit_code),
        close_input: Arc::clone(&close_input),
        stderr,
    };
    let (mut link, ends) = Link::new(TransportKind::Stdio, attrs(), Box::new(ctl));
    if let Some(stdout) = stdout {
        link.abort_on_close(tokio::spawn(reader(stdout, ends.incoming.clone())));
    }
    link.drain_on_close(tokio::spawn(writer(stdin, close_input, ends.outgoing, ends.incoming)));
    // Waits for exit within the close grace period; dropping the child kills it.
    link.drain_on_close(tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                let code = status.code().or_else(|| status.signal().map(|s| -s));
                tracing::debug!(?code, "child exited");
                *exit_code.lock().unwrap_or_else(PoisonError::into_inner) = code;
            }
            Err(e) => tracing::debug!(error = %e, "child wait failed"),
        }
    }));
    Ok(link)
}

async fn reader<R: AsyncRead + Unpin>(mut src: R, tx: mpsc::Sender<Incoming>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let event = match src.read(&mut buf).await {
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

async fn writer(
    mut stdin: Option<ChildStdin>,
    close_input: Arc<Notify>,
    mut rx: mpsc::Receiver<Outgoing>,
    errors: mpsc::Sender<Incoming>,
) {
    loop {
        let out = tokio::select! {
            out = rx.recv() => out,
            _ = close_input.notified(), if stdin.is_some() => {
                stdin = None;
                continue;
            }
        };
        match out {
            Some(Outgoing::Data { data, .. }) => {
                let Some(pipe) = stdin.as_mut() else {
                    tracing::debug!(len = data.len(), "child input closed, dropping write");
                    continue;
                };
                if let Err(e) = pipe.write_all(&data).await {
                    let _ = errors.send(Incoming::Error(e.into())).await;
                    return;
                }
            }
            Some(Outgoing::Shutdown) | None => return,
        }
    }
}

struct StdioControl {
    exit_code: Arc<Mutex<Option<i32>>>,
    close_input: Arc<Notify>,
    stderr: Option<ChildStderr>,
}

impl LinkControl for StdioControl {
    fn control(&mut self, get: bool, op: ControlOp, _data: &str) -> Result<String> {
        match op {
            ControlOp::ExitCode if get => self
                .exit_code
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .map(|code| code.to_string())
                .ok_or(GensioError::NotReady),
            ControlOp::CloseOutput if !get => {
                self.close_input.notify_one();
                Ok(String::new())
            }
            _ => Err(GensioError::NotSupported),
        }
    }

    fn open_channel(&mut self, args: &Args) -> Result<Link> {
        args.check_known("stdio channel", &[])?;
        let stderr = self.stderr.take().ok_or(GensioError::NotReady)?;
        let (mut link, ends) = Link::new(TransportKind::Stdio, attrs(), Box::new(StderrControl));
        link.abort_on_close(tokio::spawn(reader(stderr, ends.incoming)));
        link.drain_on_close(tokio::spawn(discard(ends.outgoing)));
        Ok(link)
    }
}

/// The stderr channel is read-only.
struct StderrControl;

impl LinkControl for StderrControl {}

async fn discard(mut rx: mpsc::Receiver<Outgoing>) {
    while let Some(out) = rx.recv().await {
        if matches!(out, Outgoing::Shutdown) {
            return;
        }
    }
}
