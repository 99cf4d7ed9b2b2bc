//! Client-side session starts, consumed by the CLI.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

use tracing::{info, warn};

use crate::error::{Result, TransferError};
use crate::handshake;
use crate::protocol::{Operation, Protocol};
use crate::session::{Session, TransferReport};
use crate::socket::Endpoint;
use crate::storage;

/// Largest file the client will offer for upload: 5 MiB.
pub const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Upload `local_path` to the server, stored under `remote_name` (or the
/// source file's own name when none is given).
pub fn upload(
    server: SocketAddr,
    local_path: &Path,
    remote_name: Option<&str>,
    protocol: Protocol,
) -> Result<TransferReport> {
    let file = File::open(local_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            TransferError::FileNotFound(local_path.display().to_string())
        }
        _ => TransferError::FileIo(e),
    })?;
    let size = file.metadata().map_err(TransferError::FileIo)?.len();
    if size > MAX_FILE_SIZE {
        return Err(TransferError::FileTooLarge {
            size,
            limit: MAX_FILE_SIZE,
        });
    }
    let remote_name = resolve_remote_name(remote_name, local_path)?;
    info!(%server, name = %remote_name, size, ?protocol, "starting upload");

    let endpoint = bind_for(server)?;
    let reply = handshake::connect(&endpoint, server, Operation::Upload, protocol, &remote_name)?;
    let session = Session::new(endpoint, reply.session_peer, protocol);
    session.send_stream(BufReader::new(file))
}

/// Download `remote_name` from the server into `local_dir`, overwriting any
/// existing file of the same name.
pub fn download(
    server: SocketAddr,
    remote_name: &str,
    local_dir: &Path,
    protocol: Protocol,
) -> Result<TransferReport> {
    if !storage::valid_entry_name(remote_name) {
        return Err(TransferError::Malformed("invalid file name"));
    }
    std::fs::create_dir_all(local_dir).map_err(TransferError::FileIo)?;
    info!(%server, name = %remote_name, ?protocol, "starting download");

    let endpoint = bind_for(server)?;
    let reply = handshake::connect(&endpoint, server, Operation::Download, protocol, remote_name)?;

    let destination = local_dir.join(remote_name);
    let file = File::create(&destination).map_err(TransferError::FileIo)?;
    let mut sink = BufWriter::new(file);

    let session = Session::new(endpoint, reply.session_peer, protocol);
    let report = session.receive_stream(&mut sink)?;

    if let Some(advertised) = reply.file_size {
        if advertised != report.bytes {
            warn!(
                advertised,
                received = report.bytes,
                "received size differs from the server's advertisement"
            );
        }
    }
    Ok(report)
}

/// Bind an ephemeral local socket of the right address family for `server`.
fn bind_for(server: SocketAddr) -> Result<Endpoint> {
    let ip = match server {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    Endpoint::bind_ephemeral(ip)
}

/// Use the requested remote name when it is valid, falling back to the
/// source file's own name otherwise.
fn resolve_remote_name(requested: Option<&str>, local_path: &Path) -> Result<String> {
    let fallback = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(TransferError::Malformed("source path has no usable name"))?;
    match requested {
        Some(name) if storage::valid_entry_name(name) => Ok(name.to_string()),
        Some(name) => {
            warn!(name, fallback, "invalid remote name, using the source name");
            Ok(fallback.to_string())
        }
        None => Ok(fallback.to_string()),
    }
}
