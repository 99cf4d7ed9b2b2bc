//! A thin wrapper around one UDP socket.
//!
//! Every session owns exactly one [`Endpoint`]; the server dispatcher owns
//! one more for the well-known listening port. Receive is the only blocking
//! operation, and its timeout doubles as the retransmit timer for the
//! protocol engines.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol as IpProtocol, Socket, Type};
use tracing::trace;

use crate::error::{Result, TransferError};
use crate::protocol::{Packet, MAX_DATAGRAM};

/// A bound UDP endpoint.
pub struct Endpoint {
    socket: UdpSocket,
}

impl Endpoint {
    /// Bind to the given local address.
    pub fn bind(addr: SocketAddr) -> Result<Endpoint> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(IpProtocol::UDP))
            .map_err(TransferError::Network)?;
        socket.set_nonblocking(false).map_err(TransferError::Network)?;
        socket.bind(&addr.into()).map_err(TransferError::Network)?;
        Ok(Endpoint {
            socket: socket.into(),
        })
    }

    /// Bind to an OS-assigned port on the given address.
    pub fn bind_ephemeral(ip: IpAddr) -> Result<Endpoint> {
        Endpoint::bind(SocketAddr::new(ip, 0))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TransferError::Network)
    }

    /// Encode and emit one packet to `peer`.
    pub fn send(&self, packet: &Packet, peer: SocketAddr) -> Result<()> {
        let raw = packet.encode();
        self.socket
            .send_to(&raw, peer)
            .map_err(TransferError::Network)?;
        trace!(kind = ?packet.kind, seq = packet.seq, len = raw.len(), %peer, "sent");
        Ok(())
    }

    /// Wait up to `timeout` for one datagram.
    ///
    /// Fails with [`TransferError::Timeout`] on expiry and
    /// [`TransferError::Malformed`] for bytes that do not decode; callers
    /// choose whether to retry.
    pub fn recv(&self, timeout: Duration) -> Result<(Packet, SocketAddr)> {
        // A zero read timeout means "block forever" to the OS.
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(TransferError::Network)?;
        // One spare byte so an oversized datagram fails the length check
        // instead of being silently truncated to a valid-looking one.
        let mut buf = [0u8; MAX_DATAGRAM + 1];
        match self.socket.recv_from(&mut buf) {
            Ok((len, src)) => {
                let packet = Packet::decode(&buf[..len])?;
                trace!(kind = ?packet.kind, seq = packet.seq, len, %src, "received");
                Ok((packet, src))
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Err(TransferError::Timeout)
            }
            // ICMP port unreachable surfaces as ConnectionReset on some
            // platforms. Treat it as loss; retransmission covers it.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Err(TransferError::Timeout),
            Err(e) => Err(TransferError::Network(e)),
        }
    }

    /// Like [`Endpoint::recv`], but accepts only datagrams from `peer`.
    /// Anything from another source fails with
    /// [`TransferError::ProtocolViolation`]; session engines drop those and
    /// keep their own deadlines running, so a flood of them still ends in
    /// the peer being declared unresponsive.
    pub fn recv_from_peer(&self, timeout: Duration, peer: SocketAddr) -> Result<Packet> {
        let (packet, src) = self.recv(timeout)?;
        if src != peer {
            trace!(%src, %peer, "datagram from another source");
            return Err(TransferError::ProtocolViolation(
                "datagram from an address other than the session peer",
            ));
        }
        Ok(packet)
    }

    /// Clone the underlying socket handle. The dispatcher keeps a clone of
    /// each session's socket so it can answer a duplicate SYN from the
    /// session's own address.
    pub fn try_clone(&self) -> Result<Endpoint> {
        Ok(Endpoint {
            socket: self.socket.try_clone().map_err(TransferError::Network)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Kind;

    fn loopback() -> Endpoint {
        Endpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn send_and_receive_roundtrip() {
        let a = loopback();
        let b = loopback();
        let packet = Packet::data(3, vec![9, 9, 9], false);
        a.send(&packet, b.local_addr().unwrap()).unwrap();
        let (received, src) = b.recv(Duration::from_secs(1)).unwrap();
        assert_eq!(received, packet);
        assert_eq!(src, a.local_addr().unwrap());
    }

    #[test]
    fn recv_times_out() {
        let endpoint = loopback();
        match endpoint.recv(Duration::from_millis(50)) {
            Err(TransferError::Timeout) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn recv_from_peer_rejects_other_sources() {
        let a = loopback();
        let b = loopback();
        let stranger = loopback();
        let b_addr = b.local_addr().unwrap();
        let a_addr = a.local_addr().unwrap();

        stranger.send(&Packet::ack(9), b_addr).unwrap();
        a.send(&Packet::ack(1), b_addr).unwrap();

        match b.recv_from_peer(Duration::from_secs(1), a_addr) {
            Err(TransferError::ProtocolViolation(_)) => {}
            other => panic!("expected a protocol violation, got {other:?}"),
        }
        let packet = b.recv_from_peer(Duration::from_secs(1), a_addr).unwrap();
        assert_eq!(packet, Packet::ack(1));
    }

    #[test]
    fn malformed_datagram_is_reported_not_fatal() {
        let a = loopback();
        let b = loopback();
        let b_addr = b.local_addr().unwrap();
        // Raw garbage first, then a valid packet.
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(&[0xFF, 0xFF, 0xFF], b_addr).unwrap();
        a.send(&Packet::fin(), b_addr).unwrap();

        match b.recv(Duration::from_secs(1)) {
            Err(TransferError::Malformed(_)) => {}
            other => panic!("expected malformed, got {other:?}"),
        }
        let (packet, _) = b.recv(Duration::from_secs(1)).unwrap();
        assert_eq!(packet.kind, Kind::Fin);
    }
}
