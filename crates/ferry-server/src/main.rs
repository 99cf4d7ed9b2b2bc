//! File transfer UDP server.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use ferry_transfer::FileServer;

#[derive(Parser, Debug)]
#[command(name = "ferry-server", version, about = "File transfer UDP server")]
struct Args {
    /// Increase output verbosity.
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Decrease output verbosity.
    #[arg(short, long)]
    quiet: bool,

    /// Service IP address.
    #[arg(short = 'H', long, value_name = "ADDR", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Service port.
    #[arg(short, long, value_name = "PORT", default_value_t = 9999)]
    port: u16,

    /// Storage directory path.
    #[arg(short, long, value_name = "DIRPATH", default_value = "./storage")]
    storage: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.quiet);

    let bind = SocketAddr::new(args.host, args.port);
    let server = FileServer::new(bind, &args.storage)
        .with_context(|| format!("failed to start the server on {bind}"))?;

    let shutdown = server.shutdown_flag();
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        shutdown.store(true, Ordering::Relaxed);
    })
    .context("failed to install the signal handler")?;

    server.run().context("server terminated with an error")?;
    Ok(())
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default = if verbose {
        "ferry_transfer=debug,ferry_server=debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}
