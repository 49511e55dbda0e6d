//! nox CLI entry point.
//!
//! Command output goes to stdout; logs go to stderr and are filtered by
//! `NOX_LOG` (same syntax as `RUST_LOG`).

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod commands;
mod output;

/// Default filter when `NOX_LOG` is unset.
const DEFAULT_FILTER: &str = "warn,nox_core=info,nox_vm=info,nox=info";

#[tokio::main]
async fn main() {
    // Usage errors exit with status 2 inside `parse`.
    let cli = cli::Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Error: invalid log filter: {e}");
        std::process::exit(1);
    }

    if let Err(e) = commands::run(cli).await {
        tracing::debug!(error = ?e, "Command failed");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let filter = match std::env::var("NOX_LOG") {
        Ok(directives) => EnvFilter::try_new(directives)?,
        Err(_) if verbose => EnvFilter::try_new(DEFAULT_FILTER)?
            .add_directive("nox_core=debug".parse()?)
            .add_directive("nox_vm=debug".parse()?),
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}
