//! Receive-side protocol engine.
//!
//! Both protocols use the same receiver: accept DATA strictly in order,
//! deliver it to the sink exactly once, and answer every DATA with the
//! cumulative ACK for the current boundary. Duplicates and out-of-order
//! packets just re-assert that boundary, which is all a Stop-and-Wait or
//! Go-Back-N sender needs to recover.

use std::io::Write;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::debug;

use crate::error::{Result, TransferError};
use crate::protocol::{Kind, Packet, LINGER, MAX_RETRIES, RTO};
use crate::socket::Endpoint;

/// Counters from a completed receive.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReceiverStats {
    /// Payload bytes delivered to the sink, in order, exactly once.
    pub bytes_received: u64,
    /// DATA packets accepted and delivered.
    pub packets_accepted: u64,
    /// DATA packets discarded as duplicate or out of order.
    pub duplicates: u64,
}

/// Receive one transfer from `peer` into `sink`. Returns after the final
/// DATA has been delivered, acknowledged, and the linger window has passed.
pub fn run<W: Write>(endpoint: &Endpoint, peer: SocketAddr, sink: &mut W) -> Result<ReceiverStats> {
    let mut stats = ReceiverStats::default();
    let mut expected: u32 = 0;
    let mut idle_timeouts: u32 = 0;
    let mut idle_deadline = Instant::now() + RTO;

    loop {
        // Liveness is judged on wall clock before every receive. Datagrams
        // that only get dropped (duplicates, malformed bytes, traffic from
        // another address) do not count as progress and cannot keep a dead
        // session open.
        let remaining = idle_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            idle_timeouts += 1;
            if idle_timeouts >= MAX_RETRIES {
                return Err(TransferError::PeerUnresponsive(idle_timeouts));
            }
            idle_deadline = Instant::now() + RTO;
            continue;
        }

        match endpoint.recv_from_peer(remaining, peer) {
            Ok(packet) => match packet.kind {
                Kind::Data if packet.seq == expected => {
                    sink.write_all(&packet.payload)
                        .map_err(TransferError::FileIo)?;
                    stats.bytes_received += packet.payload.len() as u64;
                    stats.packets_accepted += 1;
                    expected += 1;
                    idle_timeouts = 0;
                    idle_deadline = Instant::now() + RTO;
                    endpoint.send(&Packet::ack(expected), peer)?;
                    debug!(seq = packet.seq, len = packet.payload.len(), "data accepted");
                    if packet.last {
                        sink.flush().map_err(TransferError::FileIo)?;
                        linger(endpoint, peer, expected)?;
                        return Ok(stats);
                    }
                }
                Kind::Data => {
                    // Duplicate or future packet: re-assert the boundary
                    // without delivering anything.
                    stats.duplicates += 1;
                    debug!(seq = packet.seq, expected, "out-of-order data re-acked");
                    endpoint.send(&Packet::ack(expected), peer)?;
                }
                // A re-sent SYN-ACK means our handshake ACK was lost;
                // answer it again so the sender can start.
                Kind::SynAck => {
                    endpoint.send(&Packet::ack(expected), peer)?;
                }
                // The handshake ACK itself can trail into the data phase.
                Kind::Ack => {}
                Kind::Error => {
                    return Err(TransferError::Remote(
                        String::from_utf8_lossy(&packet.payload).into_owned(),
                    ));
                }
                Kind::Fin => {
                    // A FIN before the final DATA: state mismatch, drop it
                    // and let the sender's timeout sort itself out.
                    debug!("premature FIN dropped");
                }
                _ => debug!(kind = ?packet.kind, "unexpected packet dropped"),
            },
            Err(TransferError::Timeout) => {}
            Err(TransferError::Malformed(reason))
            | Err(TransferError::ProtocolViolation(reason)) => {
                debug!(reason, "datagram dropped");
            }
            Err(e) => return Err(e),
        }
    }
}

/// After the terminal ACK: keep answering duplicates of the final DATA and
/// the sender's FIN until things stay quiet for the linger window. The
/// sender closes best-effort, so an unanswered FIN here is not an error.
fn linger(endpoint: &Endpoint, peer: SocketAddr, terminal_ack: u32) -> Result<()> {
    let mut deadline = Instant::now() + LINGER;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        match endpoint.recv_from_peer(remaining, peer) {
            Ok(packet) => match packet.kind {
                Kind::Data => {
                    endpoint.send(&Packet::ack(terminal_ack), peer)?;
                }
                Kind::Fin => {
                    endpoint.send(&Packet::fin_ack(), peer)?;
                    deadline = Instant::now() + LINGER;
                }
                _ => {}
            },
            Err(TransferError::Timeout) => return Ok(()),
            Err(TransferError::Malformed(_)) | Err(TransferError::ProtocolViolation(_)) => {}
            Err(e) => return Err(e),
        }
    }
}
