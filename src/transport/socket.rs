//! UDP socket wrapper for the RTMFP engine.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::core::MAX_DATAGRAM_SIZE;

/// The engine's UDP socket.
///
/// One socket carries every session and flow; inbound datagrams are
/// demultiplexed by session id before any flow-level processing.
#[derive(Debug)]
pub struct RtmfpSocket {
    socket: UdpSocket,
    recv_buffer: Vec<u8>,
}

impl RtmfpSocket {
    /// Bind a socket with the requested kernel buffer sizes.
    ///
    /// `local` defaults to the IPv4 (or IPv6, matching `remote`) wildcard
    /// with an ephemeral port when no bind address was configured.
    pub fn bind(
        local: Option<SocketAddr>,
        remote_is_ipv6: bool,
        receive_size: usize,
        send_size: usize,
    ) -> io::Result<Self> {
        let local = local.unwrap_or_else(|| {
            if remote_is_ipv6 {
                "[::]:0".parse().unwrap()
            } else {
                "0.0.0.0:0".parse().unwrap()
            }
        });

        let domain = if local.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(receive_size)?;
        socket.set_send_buffer_size(send_size)?;
        socket.set_nonblocking(true)?;
        socket.bind(&local.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket,
            recv_buffer: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    /// Local address after binding.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one datagram.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr).await
    }

    /// Await the next datagram; returns the bytes and the sender address.
    pub async fn recv_from(&mut self) -> io::Result<(&[u8], SocketAddr)> {
        let (len, addr) = self.socket.recv_from(&mut self.recv_buffer).await?;
        Ok((&self.recv_buffer[..len], addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_and_loopback() {
        let mut a = RtmfpSocket::bind(None, false, 65536, 65536).unwrap();
        let b = RtmfpSocket::bind(None, false, 65536, 65536).unwrap();
        let addr_a = a.local_addr().unwrap();
        assert!(addr_a.port() != 0);

        b.send_to(b"ping", addr_a).await.unwrap();
        let (data, from) = a.recv_from().await.unwrap();
        assert_eq!(data, b"ping");
        assert_eq!(from.port(), b.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn wildcard_matches_remote_family() {
        let v6 = RtmfpSocket::bind(None, true, 65536, 65536).unwrap();
        assert!(v6.local_addr().unwrap().is_ipv6());
    }
}
