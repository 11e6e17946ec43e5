//! `wirebind serve`: accept Unix socket connections and bind each one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::sync::Notify;
use wirebind::{Dispatcher, ServerBuilder, stream};

use crate::protocol;

/// Time the stream pumps get to flush epitaphs before the runtime stops.
const DRAIN: Duration = Duration::from_millis(200);

/// Arguments for `wirebind serve`.
#[derive(clap::Args)]
pub struct ServeArgs {
    /// Socket path to listen on. A stale socket file is replaced.
    #[arg(short = 's', long)]
    pub socket: PathBuf,

    /// Runtime worker threads.
    #[arg(long, default_value_t = 2)]
    pub threads: usize,
}

pub async fn serve(args: &ServeArgs) -> Result<()> {
    if args.socket.exists() {
        std::fs::remove_file(&args.socket)
            .with_context(|| format!("remove stale socket {}", args.socket.display()))?;
    }
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("bind {}", args.socket.display()))?;
    let dispatcher = Dispatcher::current();
    let shutdown = Arc::new(Notify::new());
    tracing::info!(socket = %args.socket.display(), "listening");

    let mut accepted_total = 0u64;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (conn, _) = accepted.context("accept failed")?;
                accepted_total += 1;
                let id = accepted_total;
                let transport = stream::bridge(conn, &dispatcher);
                ServerBuilder::new(&dispatcher)
                    .on_unbound(move |info| {
                        tracing::info!(connection = id, "{}", info.format_description());
                    })
                    .bind(transport, protocol::router(Arc::clone(&shutdown)));
                tracing::info!(connection = id, "accepted");
            }
            () = shutdown.notified() => {
                tracing::info!("shutdown requested by a client");
                tokio::time::sleep(DRAIN).await;
                break;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("install ctrl-c handler")?;
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&args.socket);
    tracing::info!(connections = accepted_total, "stopped");
    Ok(())
}
