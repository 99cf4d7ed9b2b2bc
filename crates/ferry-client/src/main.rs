//! File transfer client: upload and download against a ferry server.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use ferry_transfer::protocol::Protocol;
use ferry_transfer::{client, TransferReport};

#[derive(Parser, Debug)]
#[command(name = "ferry", version, about = "Reliable UDP file transfer client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file to the server.
    Upload(UploadArgs),
    /// Download a file from the server.
    Download(DownloadArgs),
}

#[derive(Args, Debug)]
struct Common {
    /// Increase output verbosity.
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Decrease output verbosity.
    #[arg(short, long)]
    quiet: bool,

    /// Server IP address.
    #[arg(short = 'H', long, value_name = "ADDR", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Server port.
    #[arg(short, long, value_name = "PORT", default_value_t = 9999)]
    port: u16,

    /// Error recovery protocol.
    #[arg(
        short = 'r',
        long,
        value_name = "PROTOCOL",
        value_parser = parse_protocol,
        default_value = "stop-and-wait"
    )]
    protocol: Protocol,
}

#[derive(Args, Debug)]
struct UploadArgs {
    #[command(flatten)]
    common: Common,

    /// Source file path.
    #[arg(short = 's', long = "src", value_name = "FILEPATH")]
    src: PathBuf,

    /// Name to store the file under on the server.
    #[arg(short, long, value_name = "FILENAME")]
    name: Option<String>,
}

#[derive(Args, Debug)]
struct DownloadArgs {
    #[command(flatten)]
    common: Common,

    /// Destination directory.
    #[arg(short = 'd', long = "dst", value_name = "DIRPATH", default_value = ".")]
    dst: PathBuf,

    /// Name of the file on the server.
    #[arg(short, long, value_name = "FILENAME")]
    name: String,
}

fn parse_protocol(raw: &str) -> Result<Protocol, String> {
    match raw {
        "stop-and-wait" | "sw" => Ok(Protocol::StopAndWait),
        "go-back-n" | "gbn" => Ok(Protocol::GoBackN),
        other => Err(format!(
            "unknown protocol '{other}' (expected stop-and-wait or go-back-n)"
        )),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Upload(args) => {
            init_tracing(args.common.verbose, args.common.quiet);
            let server = SocketAddr::new(args.common.host, args.common.port);
            let report = client::upload(
                server,
                &args.src,
                args.name.as_deref(),
                args.common.protocol,
            )
            .with_context(|| format!("upload of {} failed", args.src.display()))?;
            print_report("uploaded", &report, args.common.quiet);
        }
        Command::Download(args) => {
            init_tracing(args.common.verbose, args.common.quiet);
            let server = SocketAddr::new(args.common.host, args.common.port);
            let report = client::download(server, &args.name, &args.dst, args.common.protocol)
                .with_context(|| format!("download of {} failed", args.name))?;
            print_report("downloaded", &report, args.common.quiet);
        }
    }
    Ok(())
}

fn print_report(verb: &str, report: &TransferReport, quiet: bool) {
    if quiet {
        return;
    }
    println!(
        "{verb} {} bytes in {:.2}s ({} B/s, {} retransmissions)",
        report.bytes,
        report.elapsed.as_secs_f64(),
        report.throughput(),
        report.retransmissions,
    );
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default = if verbose {
        "ferry_transfer=debug,ferry=debug"
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
