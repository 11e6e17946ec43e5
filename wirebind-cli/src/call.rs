//! Client commands: echo, notify, shutdown.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use wirebind::stream::{self, StreamTransport};
use wirebind::{
    Client, Dispatcher, DispatchOutcome, EventHandler, IncomingMessage, Status, UnbindInfo,
};

use crate::OutputFormat;
use crate::protocol::{ECHO, NOTIFY, ON_NOTIFY, SHUTDOWN};

/// Arguments for `wirebind echo`.
#[derive(clap::Args)]
pub struct EchoArgs {
    /// Socket path of a running server.
    #[arg(short = 's', long)]
    pub socket: PathBuf,

    /// Number of round trips.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: u32,

    /// Output format.
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,

    /// Text to echo.
    pub message: String,
}

/// Arguments for `wirebind notify`.
#[derive(clap::Args)]
pub struct NotifyArgs {
    /// Socket path of a running server.
    #[arg(short = 's', long)]
    pub socket: PathBuf,

    /// Seconds to wait for the event to come back.
    #[arg(short = 't', long = "timeout", default_value_t = 5)]
    pub timeout: u64,

    /// Text to broadcast.
    pub message: String,
}

/// Arguments for `wirebind shutdown`.
#[derive(clap::Args)]
pub struct ShutdownArgs {
    /// Socket path of a running server.
    #[arg(short = 's', long)]
    pub socket: PathBuf,
}

/// One echo round trip.
#[derive(Serialize)]
struct RoundTrip {
    seq: u32,
    reply: String,
    micros: u128,
}

async fn connect(socket: &Path) -> Result<(Dispatcher, StreamTransport)> {
    let conn = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connect to {}", socket.display()))?;
    let dispatcher = Dispatcher::current();
    let transport = stream::bridge(conn, &dispatcher);
    Ok((dispatcher, transport))
}

pub async fn echo(args: &EchoArgs) -> Result<()> {
    let (dispatcher, transport) = connect(&args.socket).await?;
    let client = Client::bind(&dispatcher, transport);

    let mut trips = Vec::new();
    for seq in 0..args.count {
        let start = Instant::now();
        let reply: String = client
            .call(ECHO, args.message.as_str())
            .await
            .with_context(|| format!("echo #{seq}"))?;
        trips.push(RoundTrip {
            seq,
            reply,
            micros: start.elapsed().as_micros(),
        });
    }
    client.unbind();

    if matches!(args.format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&trips)?);
        return Ok(());
    }
    println!("{:<6} {:>10}  REPLY", "SEQ", "MICROS");
    for trip in &trips {
        println!("{:<6} {:>10}  {}", trip.seq, trip.micros, trip.reply);
    }
    Ok(())
}

/// Forwards `ON_NOTIFY` payloads; other events are unknown.
struct Forward(mpsc::UnboundedSender<String>);

impl EventHandler for Forward {
    fn on_event(&self, event: IncomingMessage) -> DispatchOutcome {
        if event.ordinal() != ON_NOTIFY {
            return DispatchOutcome::NotFound(event);
        }
        match event.decode::<String>() {
            Ok(text) => {
                let _ = self.0.send(text);
                DispatchOutcome::Handled
            }
            Err(_) => DispatchOutcome::Failed(UnbindInfo::decode_error(Status::INVALID_ARGS)),
        }
    }

    fn on_unknown_event(&self, ordinal: u64) {
        tracing::debug!(ordinal, "ignoring unknown event");
    }
}

pub async fn notify(args: &NotifyArgs) -> Result<()> {
    let (dispatcher, transport) = connect(&args.socket).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Client::builder(&dispatcher)
        .event_handler(Forward(tx))
        .bind(transport);

    client.send(NOTIFY, args.message.as_str())?;
    let event = tokio::time::timeout(Duration::from_secs(args.timeout), rx.recv())
        .await
        .context("timed out waiting for the event")?;
    let text = event.ok_or_else(|| match client.unbind_info() {
        Some(info) => anyhow::anyhow!("{}", info.format_description()),
        None => anyhow::anyhow!("event stream ended"),
    })?;
    client.unbind();
    println!("{text}");
    Ok(())
}

pub async fn shutdown(args: &ShutdownArgs) -> Result<()> {
    let (dispatcher, transport) = connect(&args.socket).await?;
    let (tx, rx) = oneshot::channel();
    let client = Client::builder(&dispatcher)
        .on_unbound(move |info| {
            let _ = tx.send(info);
        })
        .bind(transport);

    client.send(SHUTDOWN, &())?;
    let info = rx.await.context("binding dropped without an unbind report")?;
    if info != UnbindInfo::peer_closed(Status::OK) {
        anyhow::bail!("server did not close cleanly: {}", info.format_description());
    }
    println!("{}", info.format_description());
    Ok(())
}
