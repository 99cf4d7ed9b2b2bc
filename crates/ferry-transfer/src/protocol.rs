//! Wire format and protocol constants.
//!
//! Every UDP datagram exchanged between peers is one [`Packet`]. This module
//! defines the on-wire binary layout and converts between packets and raw
//! bytes. No I/O happens here.
//!
//! Packet layout (big-endian):
//!
//! ```text
//! [0]      kind (SYN, SYN-ACK, ACK, DATA, FIN, FIN-ACK, ERROR)
//! [1]      operation (upload / download, meaningful on SYN)
//! [2]      protocol (stop-and-wait / go-back-n, meaningful on SYN)
//! [3]      flags (bit 0 = last DATA of the transfer)
//! [4..8]   sequence number (u32); on ACK, the next expected sequence number
//! [8..10]  payload length (u16)
//! [10..]   payload (up to 1024 bytes)
//! ```
//!
//! 10-byte header + up to 1024 bytes payload = 1034 bytes max, comfortably
//! within common MTUs.

use std::time::Duration;

use crate::error::TransferError;

/// Maximum payload bytes per DATA packet.
pub const MAX_PAYLOAD: usize = 1024;

/// Header size in bytes.
pub const HEADER_LEN: usize = 10;

/// Maximum datagram size (header + payload).
pub const MAX_DATAGRAM: usize = HEADER_LEN + MAX_PAYLOAD;

/// Retransmission timeout: how long a sender waits for an acknowledgement
/// before resending its window.
pub const RTO: Duration = Duration::from_millis(500);

/// Consecutive unanswered timeouts before a session declares the peer gone.
pub const MAX_RETRIES: u32 = 10;

/// How long a receiver keeps answering duplicates after its terminal ACK,
/// so the peer can observe the acknowledgement even if the first copy is lost.
pub const LINGER: Duration = Duration::from_millis(1000);

/// Go-Back-N window size.
pub const GO_BACK_N_WINDOW: usize = 5;

const FLAG_LAST: u8 = 1 << 0;

/// Packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Syn = 0,
    SynAck = 1,
    Ack = 2,
    Data = 3,
    Fin = 4,
    FinAck = 5,
    Error = 6,
}

impl Kind {
    fn from_byte(byte: u8) -> Option<Kind> {
        match byte {
            0 => Some(Kind::Syn),
            1 => Some(Kind::SynAck),
            2 => Some(Kind::Ack),
            3 => Some(Kind::Data),
            4 => Some(Kind::Fin),
            5 => Some(Kind::FinAck),
            6 => Some(Kind::Error),
            _ => None,
        }
    }
}

/// Transfer direction requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Upload = 0,
    Download = 1,
}

impl Operation {
    fn from_byte(byte: u8) -> Option<Operation> {
        match byte {
            0 => Some(Operation::Upload),
            1 => Some(Operation::Download),
            _ => None,
        }
    }
}

/// Error recovery protocol, chosen by the client in its SYN and authoritative
/// for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    StopAndWait = 0,
    GoBackN = 1,
}

impl Protocol {
    fn from_byte(byte: u8) -> Option<Protocol> {
        match byte {
            0 => Some(Protocol::StopAndWait),
            1 => Some(Protocol::GoBackN),
            _ => None,
        }
    }

    /// Maximum number of unacknowledged DATA packets in flight.
    pub fn window(self) -> usize {
        match self {
            Protocol::StopAndWait => 1,
            Protocol::GoBackN => GO_BACK_N_WINDOW,
        }
    }
}

/// A parsed transfer datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: Kind,
    pub operation: Operation,
    pub protocol: Protocol,
    /// Set on the final DATA packet of a transfer.
    pub last: bool,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    fn control(kind: Kind, seq: u32, payload: Vec<u8>) -> Packet {
        Packet {
            kind,
            operation: Operation::Upload,
            protocol: Protocol::StopAndWait,
            last: false,
            seq,
            payload,
        }
    }

    /// The client's opening request: operation, protocol, and the remote
    /// file name as payload.
    pub fn syn(operation: Operation, protocol: Protocol, remote_name: &str) -> Packet {
        Packet {
            kind: Kind::Syn,
            operation,
            protocol,
            last: false,
            seq: 0,
            payload: remote_name.as_bytes().to_vec(),
        }
    }

    /// The server's acceptance. Empty payload for uploads; for downloads the
    /// payload carries the file size as 8 big-endian bytes.
    pub fn syn_ack(payload: Vec<u8>) -> Packet {
        Packet::control(Kind::SynAck, 0, payload)
    }

    /// Cumulative acknowledgement: every DATA with sequence number below
    /// `next_expected` has been received.
    pub fn ack(next_expected: u32) -> Packet {
        Packet::control(Kind::Ack, next_expected, Vec::new())
    }

    pub fn data(seq: u32, payload: Vec<u8>, last: bool) -> Packet {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Packet {
            kind: Kind::Data,
            operation: Operation::Upload,
            protocol: Protocol::StopAndWait,
            last,
            seq,
            payload,
        }
    }

    pub fn fin() -> Packet {
        Packet::control(Kind::Fin, 0, Vec::new())
    }

    pub fn fin_ack() -> Packet {
        Packet::control(Kind::FinAck, 0, Vec::new())
    }

    /// An error report carrying a human-readable message.
    pub fn error(message: &str) -> Packet {
        Packet::control(Kind::Error, 0, message.as_bytes().to_vec())
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind as u8);
        buf.push(self.operation as u8);
        buf.push(self.protocol as u8);
        buf.push(if self.last { FLAG_LAST } else { 0 });
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse from wire format, rejecting anything structurally invalid.
    pub fn decode(raw: &[u8]) -> Result<Packet, TransferError> {
        if raw.len() < HEADER_LEN {
            return Err(TransferError::Malformed("datagram shorter than header"));
        }
        let kind =
            Kind::from_byte(raw[0]).ok_or(TransferError::Malformed("unknown packet kind"))?;
        let operation = Operation::from_byte(raw[1])
            .ok_or(TransferError::Malformed("unknown operation"))?;
        let protocol =
            Protocol::from_byte(raw[2]).ok_or(TransferError::Malformed("unknown protocol"))?;
        let flags = raw[3];
        if flags & !FLAG_LAST != 0 {
            return Err(TransferError::Malformed("unknown flag bits"));
        }
        let last = flags & FLAG_LAST != 0;
        if last && kind != Kind::Data {
            return Err(TransferError::Malformed("last flag on a control packet"));
        }
        let seq = u32::from_be_bytes(raw[4..8].try_into().unwrap());
        let payload_len = u16::from_be_bytes(raw[8..10].try_into().unwrap()) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(TransferError::Malformed("payload exceeds maximum"));
        }
        if raw.len() - HEADER_LEN != payload_len {
            return Err(TransferError::Malformed("payload length mismatch"));
        }
        Ok(Packet {
            kind,
            operation,
            protocol,
            last,
            seq,
            payload: raw[HEADER_LEN..].to_vec(),
        })
    }
}
