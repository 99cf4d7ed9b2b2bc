//! Session establishment: SYN, SYN-ACK, ACK.
//!
//! The client sends its SYN to the server's well-known port. The server
//! answers from a freshly bound per-session socket, so the SYN-ACK's source
//! address tells the client where the rest of the session lives. A final ACK
//! from the client completes the exchange. SYN retries are idempotent on the
//! server side: a duplicate SYN gets the original SYN-ACK back, never a
//! second session.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info};

use crate::error::{Result, TransferError};
use crate::protocol::{Kind, Operation, Packet, Protocol, MAX_RETRIES, RTO};
use crate::socket::Endpoint;
use crate::storage;

/// What the server's SYN-ACK told us.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeReply {
    /// The server's per-session address, learned from the SYN-ACK source.
    pub session_peer: SocketAddr,
    /// Advertised file size; present on downloads.
    pub file_size: Option<u64>,
}

/// A validated SYN.
#[derive(Debug, Clone)]
pub struct SynRequest {
    pub operation: Operation,
    pub protocol: Protocol,
    pub remote_name: String,
}

/// Client side: run the full handshake against `server`.
pub fn connect(
    endpoint: &Endpoint,
    server: SocketAddr,
    operation: Operation,
    protocol: Protocol,
    remote_name: &str,
) -> Result<HandshakeReply> {
    let syn = Packet::syn(operation, protocol, remote_name);
    for attempt in 0..MAX_RETRIES {
        if attempt > 0 {
            debug!(attempt, "re-sending SYN");
        }
        endpoint.send(&syn, server)?;
        let deadline = Instant::now() + RTO;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match endpoint.recv(remaining) {
                Ok((packet, src)) => {
                    if src.ip() != server.ip() {
                        debug!(%src, "reply from unexpected host dropped");
                        continue;
                    }
                    match packet.kind {
                        Kind::SynAck => {
                            let file_size = match operation {
                                Operation::Download => Some(parse_file_size(&packet)?),
                                Operation::Upload => None,
                            };
                            endpoint.send(&Packet::ack(0), src)?;
                            info!(session = %src, ?file_size, "handshake complete");
                            return Ok(HandshakeReply {
                                session_peer: src,
                                file_size,
                            });
                        }
                        Kind::Error => {
                            return Err(TransferError::Remote(
                                String::from_utf8_lossy(&packet.payload).into_owned(),
                            ));
                        }
                        _ => debug!(kind = ?packet.kind, "unexpected packet during handshake"),
                    }
                }
                Err(TransferError::Timeout) => break,
                Err(TransferError::Malformed(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }
    Err(TransferError::PeerUnresponsive(MAX_RETRIES))
}

/// Server side: validate an incoming SYN's contents. The dispatcher routes
/// only SYNs here; the kind is the caller's guarantee.
pub fn parse_syn(packet: &Packet) -> Result<SynRequest> {
    debug_assert_eq!(packet.kind, Kind::Syn);
    let remote_name = std::str::from_utf8(&packet.payload)
        .map_err(|_| TransferError::Malformed("file name is not utf-8"))?;
    if !storage::valid_entry_name(remote_name) {
        return Err(TransferError::Malformed("invalid file name"));
    }
    Ok(SynRequest {
        operation: packet.operation,
        protocol: packet.protocol,
        remote_name: remote_name.to_string(),
    })
}

/// Server side: the SYN-ACK for an accepted request. Downloads advertise the
/// file size so the client knows what to expect.
pub fn accept_reply(operation: Operation, file_size: u64) -> Packet {
    match operation {
        Operation::Upload => Packet::syn_ack(Vec::new()),
        Operation::Download => Packet::syn_ack(file_size.to_be_bytes().to_vec()),
    }
}

/// Server side, downloads only: wait for the client's handshake ACK before
/// streaming, re-sending the SYN-ACK on each timeout in case it was lost.
/// The retry deadline runs on wall clock, so datagrams that only get
/// dropped cannot postpone it.
pub fn await_client_ack(endpoint: &Endpoint, peer: SocketAddr, syn_ack: &Packet) -> Result<()> {
    let mut retries: u32 = 0;
    let mut deadline = Instant::now() + RTO;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            retries += 1;
            if retries >= MAX_RETRIES {
                return Err(TransferError::PeerUnresponsive(retries));
            }
            debug!(retry = retries, "re-sending SYN-ACK");
            endpoint.send(syn_ack, peer)?;
            deadline = Instant::now() + RTO;
            continue;
        }
        match endpoint.recv_from_peer(remaining, peer) {
            Ok(packet) if packet.kind == Kind::Ack => return Ok(()),
            Ok(packet) => {
                debug!(kind = ?packet.kind, "unexpected packet while awaiting handshake ACK")
            }
            Err(TransferError::Timeout) => {}
            Err(TransferError::Malformed(_)) | Err(TransferError::ProtocolViolation(_)) => {}
            Err(e) => return Err(e),
        }
    }
}

fn parse_file_size(packet: &Packet) -> Result<u64> {
    let raw: [u8; 8] = packet
        .payload
        .as_slice()
        .try_into()
        .map_err(|_| TransferError::Malformed("SYN-ACK without a file size"))?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0u8; 2048];
        let (len, src) = socket.recv_from(&mut buf).unwrap();
        (Packet::decode(&buf[..len]).unwrap(), src)
    }

    fn scripted_server() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        socket
    }

    fn spawn_connect(
        server: SocketAddr,
        operation: Operation,
    ) -> std::thread::JoinHandle<Result<HandshakeReply>> {
        std::thread::spawn(move || {
            let endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            connect(&endpoint, server, operation, Protocol::StopAndWait, "f.txt")
        })
    }

    #[test]
    fn connect_learns_the_session_address() {
        let listener = scripted_server();
        let handle = spawn_connect(listener.local_addr().unwrap(), Operation::Upload);

        let (syn, client_addr) = recv_packet(&listener);
        assert_eq!(syn.kind, Kind::Syn);
        assert_eq!(syn.payload, b"f.txt");

        // Answer from a different socket, as the real server does.
        let session = scripted_server();
        session
            .send_to(&Packet::syn_ack(Vec::new()).encode(), client_addr)
            .unwrap();

        let (ack, _) = recv_packet(&session);
        assert_eq!(ack.kind, Kind::Ack);
        assert_eq!(ack.seq, 0);

        let reply = handle.join().unwrap().unwrap();
        assert_eq!(reply.session_peer, session.local_addr().unwrap());
        assert_eq!(reply.file_size, None);
    }

    #[test]
    fn connect_retries_the_syn() {
        let listener = scripted_server();
        let handle = spawn_connect(listener.local_addr().unwrap(), Operation::Upload);

        // Ignore the first SYN; the retry must arrive after the timeout.
        let (first, _) = recv_packet(&listener);
        let (second, client_addr) = recv_packet(&listener);
        assert_eq!(first.kind, Kind::Syn);
        assert_eq!(second.kind, Kind::Syn);

        let session = scripted_server();
        session
            .send_to(&Packet::syn_ack(Vec::new()).encode(), client_addr)
            .unwrap();
        recv_packet(&session);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn connect_surfaces_a_server_error() {
        let listener = scripted_server();
        let handle = spawn_connect(listener.local_addr().unwrap(), Operation::Download);

        let (_, client_addr) = recv_packet(&listener);
        listener
            .send_to(
                &Packet::error("file not found: f.txt").encode(),
                client_addr,
            )
            .unwrap();

        match handle.join().unwrap() {
            Err(TransferError::Remote(message)) => assert!(message.contains("not found")),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn download_reply_carries_the_file_size() {
        let listener = scripted_server();
        let handle = spawn_connect(listener.local_addr().unwrap(), Operation::Download);

        let (_, client_addr) = recv_packet(&listener);
        let session = scripted_server();
        session
            .send_to(
                &accept_reply(Operation::Download, 5200).encode(),
                client_addr,
            )
            .unwrap();
        recv_packet(&session);

        let reply = handle.join().unwrap().unwrap();
        assert_eq!(reply.file_size, Some(5200));
    }

    #[test]
    fn await_client_ack_retransmits_the_syn_ack_until_answered() {
        let endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let endpoint_addr = endpoint.local_addr().unwrap();
        let client = scripted_server();
        let client_addr = client.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let syn_ack = Packet::syn_ack(Vec::new());
            await_client_ack(&endpoint, client_addr, &syn_ack)
        });

        // The original SYN-ACK "was lost": the first thing the client sees
        // is a re-send, driven purely by the deadline.
        let (resent, src) = recv_packet(&client);
        assert_eq!(resent.kind, Kind::SynAck);
        assert_eq!(src, endpoint_addr);

        client
            .send_to(&Packet::ack(0).encode(), endpoint_addr)
            .unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn parse_syn_rejects_bad_names() {
        let sneaky = Packet::syn(Operation::Upload, Protocol::StopAndWait, "../etc/passwd");
        assert!(parse_syn(&sneaky).is_err());
        let empty = Packet::syn(Operation::Upload, Protocol::StopAndWait, "");
        assert!(parse_syn(&empty).is_err());
        let ok = Packet::syn(Operation::Upload, Protocol::GoBackN, "report.pdf");
        let request = parse_syn(&ok).unwrap();
        assert_eq!(request.remote_name, "report.pdf");
        assert_eq!(request.protocol, Protocol::GoBackN);
    }
}
