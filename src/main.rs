//! gensiot: connect stdin/stdout to a gensio stream.
//!
//! ```text
//! stdin ──▶ Gensio::write_s ──▶ stack ──▶ peer
//! stdout ◀── Event::read ◀──── stack ◀── peer
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use gensio::config::load_config;
use gensio::observability::logging::{init_tracing, TracingLogSink};
use gensio::{Accepter, AccepterEvent, Aux, Event, Gensio, GensioConfig, GensioError, LogMask, Selector};

#[derive(Parser, Debug)]
#[command(name = "gensiot", version, about = "Copy stdio to and from a gensio stream")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen on SPEC and serve the first connection.
    #[arg(short, long)]
    accept: bool,

    /// Severities delivered to the log sink (fatal,err,warning,info,debug).
    #[arg(long, value_delimiter = ',')]
    log_mask: Vec<String>,

    /// Debug-level diagnostics on stderr.
    #[arg(short, long)]
    verbose: bool,

    /// Stack spec, e.g. `telnet,tcp,localhost,3001`.
    spec: String,
}

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gensiot: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GensioConfig::default(),
    };
    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    init_tracing(level);
    tracing::debug!(spec = %cli.spec, accept = cli.accept, "gensiot starting");

    let selector = Selector::with_config(config.clone(), Arc::new(TracingLogSink))?;
    if !cli.log_mask.is_empty() {
        selector.set_log_mask(LogMask::from_names(&cli.log_mask)?);
    }

    let io = if cli.accept {
        accept_one(&cli.spec, &selector).await?
    } else {
        let io = Gensio::new(&cli.spec, &selector, None)?;
        io.open_s().await?;
        io
    };
    pump(io).await
}

/// Hands the first accepted stream to `accept_one`; later ones are closed.
struct FirstConnection(Mutex<Option<oneshot::Sender<Gensio>>>);

impl AccepterEvent for FirstConnection {
    fn new_connection(&self, io: Gensio) {
        let tx = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => {
                let _ = tx.send(io);
            }
            None => io.close(|_| {}),
        }
    }
}

async fn accept_one(spec: &str, selector: &Selector) -> Result<Gensio, BoxError> {
    let (tx, rx) = oneshot::channel();
    let acc = Accepter::new(spec, selector, Arc::new(FirstConnection(Mutex::new(Some(tx)))))?;
    acc.startup().await?;
    if let Some(addr) = acc.local_addr() {
        eprintln!("gensiot: listening on {addr}");
    }
    let io = rx.await.map_err(|_| GensioError::LocalClosed)?;
    acc.shutdown().await;
    Ok(io)
}

/// Forwards stream data to the stdout task; `None` marks the end.
struct Output(mpsc::UnboundedSender<Option<Vec<u8>>>);

impl Event for Output {
    fn read(&self, _io: &Gensio, data: Result<&[u8], &GensioError>, _aux: &Aux) -> usize {
        match data {
            Ok(buf) => {
                let _ = self.0.send(Some(buf.to_vec()));
                buf.len()
            }
            Err(e) => {
                tracing::debug!(error = %e, "stream ended");
                let _ = self.0.send(None);
                0
            }
        }
    }
}

async fn pump(io: Gensio) -> Result<(), BoxError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.set_handler(Arc::new(Output(tx)));
    io.read_cb_enable(true);

    let to_stdout = async {
        let mut stdout = tokio::io::stdout();
        while let Some(Some(chunk)) = rx.recv().await {
            stdout.write_all(&chunk).await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let from_stdin = async {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stdin.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, BoxError>(());
            }
            io.write_s(&buf[..n], &Aux::default()).await?;
        }
    };

    let res = tokio::select! {
        res = to_stdout => res.map_err(BoxError::from),
        res = from_stdin => res,
    };
    io.close_s().await?;
    res
}
