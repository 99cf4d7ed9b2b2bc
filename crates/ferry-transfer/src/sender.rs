//! Send-side protocol engine.
//!
//! Both protocols share the same machinery: a sliding window of
//! unacknowledged DATA packets, cumulative acknowledgements that slide it
//! forward, and a single retransmit deadline armed off the oldest
//! unacknowledged packet. Stop-and-Wait is the window-of-one instance;
//! Go-Back-N runs with a window of five and resends everything in flight
//! when the deadline expires.
//!
//! The engine pulls bytes from any [`Read`] source, so the file handling
//! stays with the caller.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{Result, TransferError};
use crate::protocol::{Kind, Packet, Protocol, MAX_PAYLOAD, MAX_RETRIES, RTO};
use crate::socket::Endpoint;

/// Counters from a completed send.
#[derive(Debug, Default, Clone, Copy)]
pub struct SenderStats {
    /// Payload bytes streamed, each counted once.
    pub bytes_sent: u64,
    /// DATA transmissions, including retransmissions.
    pub packets_sent: u64,
    /// DATA packets that had to be sent more than once.
    pub retransmissions: u64,
}

/// Sliding send window.
///
/// ```text
///   base              next_seq
///     |                  |
///  ---+------------------+------> sequence space
///     | <-- in flight -->|
/// ```
///
/// `base` is the oldest unacknowledged sequence number; `next_seq` the next
/// one to assign. Invariant: `base <= next_seq <= base + size`, and every
/// buffered packet has a sequence number in `[base, next_seq)`.
struct SendWindow {
    base: u32,
    next_seq: u32,
    size: usize,
    inflight: VecDeque<Packet>,
}

impl SendWindow {
    fn new(size: usize) -> SendWindow {
        SendWindow {
            base: 0,
            next_seq: 0,
            size,
            inflight: VecDeque::with_capacity(size),
        }
    }

    fn has_room(&self) -> bool {
        self.inflight.len() < self.size
    }

    fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    fn len(&self) -> usize {
        self.inflight.len()
    }

    /// Place a just-transmitted packet into the window and advance `next_seq`.
    fn push(&mut self, packet: Packet) {
        debug_assert!(self.has_room());
        debug_assert_eq!(packet.seq, self.next_seq);
        self.inflight.push_back(packet);
        self.next_seq += 1;
    }

    /// Apply a cumulative ACK: every packet with sequence number below `ack`
    /// is acknowledged. Returns how many packets that released. Stale ACKs
    /// (at or below `base`) and ACKs beyond `next_seq` release nothing.
    fn acknowledge(&mut self, ack: u32) -> usize {
        if ack <= self.base || ack > self.next_seq {
            return 0;
        }
        let mut released = 0;
        while let Some(front) = self.inflight.front() {
            if front.seq < ack {
                self.inflight.pop_front();
                released += 1;
            } else {
                break;
            }
        }
        self.base = ack;
        released
    }

    /// In-flight packets, oldest first.
    fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.inflight.iter()
    }
}

/// Splits a byte source into payload-sized chunks, reading one chunk ahead
/// so the final chunk is known before the source reports end of input. An
/// empty source yields exactly one empty final chunk.
struct Chunker<R> {
    source: R,
    pending: Option<Vec<u8>>,
    done: bool,
}

impl<R: Read> Chunker<R> {
    fn new(source: R) -> Chunker<R> {
        Chunker {
            source,
            pending: None,
            done: false,
        }
    }

    /// The next chunk and whether it is the last one. `None` once the source
    /// is exhausted.
    fn next_chunk(&mut self) -> io::Result<Option<(Vec<u8>, bool)>> {
        if self.done {
            return Ok(None);
        }
        let current = match self.pending.take() {
            Some(chunk) => chunk,
            None => self.read_chunk()?,
        };
        // A short chunk already proves the source is exhausted.
        if current.len() < MAX_PAYLOAD {
            self.done = true;
            return Ok(Some((current, true)));
        }
        let lookahead = self.read_chunk()?;
        if lookahead.is_empty() {
            self.done = true;
            Ok(Some((current, true)))
        } else {
            self.pending = Some(lookahead);
            Ok(Some((current, false)))
        }
    }

    fn read_chunk(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_PAYLOAD];
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

/// Stream `source` to `peer` reliably and in order, then run the FIN
/// exchange. Returns once the peer has acknowledged every byte.
pub fn run<R: Read>(
    endpoint: &Endpoint,
    peer: SocketAddr,
    protocol: Protocol,
    source: R,
) -> Result<SenderStats> {
    let mut window = SendWindow::new(protocol.window());
    let mut chunker = Chunker::new(source);
    let mut stats = SenderStats::default();
    let mut exhausted = false;
    let mut retries: u32 = 0;
    let mut deadline = Instant::now() + RTO;

    loop {
        // Fill the window eagerly.
        while window.has_room() && !exhausted {
            match chunker.next_chunk().map_err(TransferError::FileIo)? {
                Some((chunk, last)) => {
                    let packet = Packet::data(window.next_seq, chunk, last);
                    endpoint.send(&packet, peer)?;
                    stats.packets_sent += 1;
                    stats.bytes_sent += packet.payload.len() as u64;
                    if window.is_empty() {
                        deadline = Instant::now() + RTO;
                    }
                    debug!(seq = packet.seq, len = packet.payload.len(), last = packet.last, "data sent");
                    window.push(packet);
                }
                None => exhausted = true,
            }
        }
        if exhausted && window.is_empty() {
            break;
        }

        // The retransmit deadline is judged on wall clock before every
        // receive, so a stream of droppable datagrams (malformed bytes, or
        // traffic from some other address) cannot stall the timeout path.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            retries += 1;
            if retries >= MAX_RETRIES {
                return Err(TransferError::PeerUnresponsive(retries));
            }
            warn!(base = window.base, inflight = window.len(), retry = retries, "timeout, resending window");
            for packet in window.iter() {
                endpoint.send(packet, peer)?;
                stats.packets_sent += 1;
                stats.retransmissions += 1;
            }
            deadline = Instant::now() + RTO;
            continue;
        }

        match endpoint.recv_from_peer(remaining, peer) {
            Ok(packet) => match packet.kind {
                Kind::Ack => {
                    let released = window.acknowledge(packet.seq);
                    if released > 0 {
                        retries = 0;
                        deadline = Instant::now() + RTO;
                        debug!(ack = packet.seq, released, inflight = window.len(), "window advanced");
                    }
                }
                Kind::Error => {
                    return Err(TransferError::Remote(
                        String::from_utf8_lossy(&packet.payload).into_owned(),
                    ));
                }
                // Handshake stragglers and the like; not ours to answer.
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

    teardown(endpoint, peer)?;
    Ok(stats)
}

/// FIN / FIN-ACK exchange. Best effort: if the FIN-ACK never arrives the
/// sender closes anyway, since every data byte is already acknowledged.
fn teardown(endpoint: &Endpoint, peer: SocketAddr) -> Result<()> {
    for _ in 0..MAX_RETRIES {
        endpoint.send(&Packet::fin(), peer)?;
        let deadline = Instant::now() + RTO;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match endpoint.recv_from_peer(remaining, peer) {
                Ok(packet) if packet.kind == Kind::FinAck => {
                    debug!("teardown complete");
                    return Ok(());
                }
                // Stale terminal ACKs and duplicates drift in here.
                Ok(_)
                | Err(TransferError::Malformed(_))
                | Err(TransferError::ProtocolViolation(_)) => continue,
                Err(TransferError::Timeout) => break,
                Err(e) => return Err(e),
            }
        }
    }
    debug!("closing without FIN-ACK");
    Ok(())
}
