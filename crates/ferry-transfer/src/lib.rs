//! Reliable file transfer over UDP.
//!
//! A server accepts concurrent sessions on a well-known port and
//! demultiplexes each client onto its own ephemeral socket and worker
//! thread. A session moves one file in one direction, upload or download,
//! using one of two selectable ARQ protocols: Stop-and-Wait (one packet in
//! flight) or Go-Back-N (a window of five). Loss, reordering, and
//! duplication are absorbed by cumulative acknowledgements and
//! retransmission on a fixed timeout, so the bytes written on the far side
//! always match the bytes read on the near side, in order.

pub mod client;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;
pub mod socket;
pub mod storage;

pub use error::TransferError;
pub use protocol::{Operation, Packet, Protocol, MAX_PAYLOAD, RTO};
pub use server::FileServer;
pub use session::{Session, TransferReport};
pub use socket::Endpoint;
