//! One transfer's lifetime: a protocol engine bound to a socket, a peer
//! address, and a byte stream.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{Result, TransferError};
use crate::protocol::{Packet, Protocol};
use crate::receiver;
use crate::sender;
use crate::socket::Endpoint;

/// Summary of a completed transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferReport {
    /// Payload bytes moved, each counted once.
    pub bytes: u64,
    /// DATA packets handled, including retransmissions.
    pub packets: u64,
    /// Packets the sender had to send more than once.
    pub retransmissions: u64,
    /// Packets the receiver discarded as duplicate or out of order.
    pub duplicates: u64,
    pub elapsed: Duration,
}

impl TransferReport {
    /// Effective throughput in bytes per second.
    pub fn throughput(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes as f64 / secs) as u64
        } else {
            self.bytes
        }
    }
}

/// A live session: one endpoint socket, one peer, one protocol.
pub struct Session {
    endpoint: Endpoint,
    peer: SocketAddr,
    protocol: Protocol,
}

impl Session {
    pub fn new(endpoint: Endpoint, peer: SocketAddr, protocol: Protocol) -> Session {
        Session {
            endpoint,
            peer,
            protocol,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Drive the send side: stream `source` to the peer, then tear down.
    pub fn send_stream<R: Read>(&self, source: R) -> Result<TransferReport> {
        let start = Instant::now();
        match sender::run(&self.endpoint, self.peer, self.protocol, source) {
            Ok(stats) => {
                let report = TransferReport {
                    bytes: stats.bytes_sent,
                    packets: stats.packets_sent,
                    retransmissions: stats.retransmissions,
                    duplicates: 0,
                    elapsed: start.elapsed(),
                };
                info!(
                    peer = %self.peer,
                    bytes = report.bytes,
                    retransmissions = report.retransmissions,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "send complete"
                );
                Ok(report)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Drive the receive side: deliver the peer's stream into `sink`.
    pub fn receive_stream<W: Write>(&self, sink: &mut W) -> Result<TransferReport> {
        let start = Instant::now();
        match receiver::run(&self.endpoint, self.peer, sink) {
            Ok(stats) => {
                let report = TransferReport {
                    bytes: stats.bytes_received,
                    packets: stats.packets_accepted,
                    retransmissions: 0,
                    duplicates: stats.duplicates,
                    elapsed: start.elapsed(),
                };
                info!(
                    peer = %self.peer,
                    bytes = report.bytes,
                    duplicates = report.duplicates,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "receive complete"
                );
                Ok(report)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Report a fatal engine error. Conditions the peer could act on get a
    /// best-effort ERROR packet; the rest collapse through the peer's own
    /// timeout path.
    fn fail(&self, err: TransferError) -> TransferError {
        warn!(peer = %self.peer, error = %err, "session failed");
        if matches!(
            err,
            TransferError::PeerUnresponsive(_) | TransferError::FileIo(_)
        ) {
            let _ = self.endpoint.send(&Packet::error(&err.to_string()), self.peer);
        }
        err
    }
}
