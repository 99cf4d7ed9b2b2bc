//! Error taxonomy for the transfer core.
//!
//! Only handshake-phase failures travel to the peer as an ERROR packet;
//! everything else is handled locally, either by dropping the offending
//! datagram and carrying on, or by aborting the session and letting the
//! peer's own timeout path collapse it.

use std::io;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// A datagram that does not parse. Dropped by callers, never fatal on
    /// its own.
    #[error("malformed datagram: {0}")]
    Malformed(&'static str),

    /// A receive deadline expired. Drives retransmission.
    #[error("timed out waiting for a datagram")]
    Timeout,

    /// The peer stopped answering.
    #[error("peer unresponsive after {0} consecutive timeouts")]
    PeerUnresponsive(u32),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("file i/o failed: {0}")]
    FileIo(#[source] io::Error),

    #[error("network i/o failed: {0}")]
    Network(#[source] io::Error),

    /// A packet the state machine cannot interpret in its current state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The peer reported a failure in an ERROR packet.
    #[error("remote error: {0}")]
    Remote(String),
}
