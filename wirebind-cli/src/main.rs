//! CLI for exercising wirebind bindings over Unix sockets.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod call;
mod protocol;
mod serve;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "wirebind", version, about = "Echo server and client over wirebind")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the echo protocol on a Unix socket.
    Serve(serve::ServeArgs),

    /// Call Echo on a running server.
    Echo(call::EchoArgs),

    /// Send Notify and print the event the server sends back.
    Notify(call::NotifyArgs),

    /// Ask a running server to close the connection and exit.
    Shutdown(call::ShutdownArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for reporting commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = Cli::parse().dispatch() {
        eprintln!("wirebind: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        let threads = match &self.command {
            Command::Completion { shell } => {
                clap_complete::generate(
                    *shell,
                    &mut Self::command(),
                    "wirebind",
                    &mut std::io::stdout(),
                );
                return Ok(());
            }
            Command::Serve(args) => args.threads.max(1),
            _ => 1,
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .enable_all()
            .build()
            .context("build runtime")?;

        runtime.block_on(async {
            match &self.command {
                Command::Serve(args) => serve::serve(args).await,
                Command::Echo(args) => call::echo(args).await,
                Command::Notify(args) => call::notify(args).await,
                Command::Shutdown(args) => call::shutdown(args).await,
                Command::Completion { .. } => Ok(()),
            }
        })
    }
}
