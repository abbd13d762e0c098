//! One-shot UDP request/response exchange with the peer.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::trace;

use crate::error::TransportError;
use crate::sync::protocol::MAX_DATAGRAM;

/// Resolve `peer` (`host:port`) to its first address.
pub async fn resolve(peer: &str) -> Result<SocketAddr, TransportError> {
    lookup_host(peer)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| TransportError::Resolve(peer.to_string()))
}

/// Send `request` to `peer` and wait for exactly one reply datagram.
///
/// A fresh socket is opened per call so a late reply from an earlier exchange
/// can never be read as this one's. The send and the receive are each bounded
/// by `limit`; a missing reply is [`TransportError::Timeout`].
pub async fn send_and_receive(
    peer: &str,
    request: &str,
    limit: Duration,
) -> Result<String, TransportError> {
    let addr = resolve(peer).await?;
    let local: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;

    timeout(limit, socket.send(request.as_bytes()))
        .await
        .map_err(|_| TransportError::Timeout(limit))??;

    let mut buf = [0u8; MAX_DATAGRAM];
    let len = timeout(limit, socket.recv(&mut buf))
        .await
        .map_err(|_| TransportError::Timeout(limit))??;

    let reply = String::from_utf8_lossy(&buf[..len])
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string();
    trace!("{} -> {:?} <- {:?}", addr, request, reply);
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], b"READY");
            server.send_to(b"OK\0", from).await.unwrap();
        });

        let reply = send_and_receive(&peer, "READY", Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply, "OK");
    }

    #[tokio::test]
    async fn silent_peer_is_a_timeout() {
        // Bound but never answers.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = server.local_addr().unwrap().to_string();

        let err = send_and_receive(&peer, "READY", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        drop(server);
    }

    #[tokio::test]
    async fn unresolvable_peer_is_not_a_timeout() {
        let err = send_and_receive("not a host", "READY", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Resolve(_)));
    }
}
