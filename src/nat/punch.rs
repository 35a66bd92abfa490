//! UDP hole punching
//!
//! Both sides fire short probe datagrams at each other's public endpoint
//! from the WireGuard port, so both NATs mint outbound mappings for the
//! pair. Whichever side hears the other first acknowledges; either the
//! ack or an acknowledged probe counts as success. The socket is dropped
//! before returning so WireGuard can claim the port.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};

use crate::error::NatError;

/// Probe payload, sent as a bare UDP datagram
pub const PUNCH_PROBE: &[u8] = b"LANRAGE_PUNCH";
/// Acknowledgement payload
pub const PUNCH_ACK: &[u8] = b"LANRAGE_PUNCH_ACK";

/// Hole-punch timing parameters
#[derive(Debug, Clone, Copy)]
pub struct PunchConfig {
    /// Local UDP port, shared with WireGuard
    pub local_port: u16,
    pub probe_count: u32,
    pub spacing: Duration,
    pub ack_window: Duration,
}

/// Run one hole-punch exchange against a peer's public endpoint
pub async fn punch(peer: SocketAddr, config: PunchConfig) -> Result<(), NatError> {
    let socket = UdpSocket::bind(("0.0.0.0", config.local_port))
        .await
        .map_err(NatError::PunchSocket)?;

    for i in 0..config.probe_count {
        socket.send_to(PUNCH_PROBE, peer).await?;
        if i + 1 < config.probe_count {
            sleep(config.spacing).await;
        }
    }

    let deadline = Instant::now() + config.ack_window;
    let mut buf = [0u8; 64];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(NatError::HolePunchFailed { peer });
        }
        let (len, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => return Err(NatError::Io(e)),
            Err(_) => return Err(NatError::HolePunchFailed { peer }),
        };
        if from != peer {
            continue;
        }
        match &buf[..len] {
            payload if payload == PUNCH_ACK => {
                tracing::debug!(%peer, "Hole punch acknowledged by peer");
                return Ok(());
            }
            payload if payload == PUNCH_PROBE => {
                // peer's probe arrived first: acknowledge and we're done
                socket.send_to(PUNCH_ACK, peer).await?;
                tracing::debug!(%peer, "Acknowledged peer-initiated hole punch");
                return Ok(());
            }
            _ => {
                // stray traffic on the WireGuard port, keep waiting
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: u16) -> PunchConfig {
        PunchConfig {
            local_port: port,
            probe_count: 3,
            spacing: Duration::from_millis(10),
            ack_window: Duration::from_millis(500),
        }
    }

    async fn free_port() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_mutual_punch_succeeds() {
        let port_a = free_port().await;
        let port_b = free_port().await;
        let addr_a: SocketAddr = format!("127.0.0.1:{port_a}").parse().unwrap();
        let addr_b: SocketAddr = format!("127.0.0.1:{port_b}").parse().unwrap();

        let side_a = tokio::spawn(punch(addr_b, config(port_a)));
        let side_b = tokio::spawn(punch(addr_a, config(port_b)));

        side_a.await.unwrap().unwrap();
        side_b.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let port = free_port().await;
        // a peer that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = silent.local_addr().unwrap();

        let err = punch(peer, config(port)).await.unwrap_err();
        assert!(matches!(err, NatError::HolePunchFailed { .. }));
    }

    #[tokio::test]
    async fn test_socket_released_after_punch() {
        let port = free_port().await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = silent.local_addr().unwrap();

        let _ = punch(peer, config(port)).await;

        // WireGuard must be able to bind the port afterwards
        UdpSocket::bind(("0.0.0.0", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stray_datagrams_are_ignored() {
        let port = free_port().await;
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = peer_socket.local_addr().unwrap();
        let local: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

        let peer_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            // swallow the probes, answer garbage, then the real ack
            let (_, from) = peer_socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(from, local);
            peer_socket.send_to(b"unrelated", local).await.unwrap();
            peer_socket.send_to(PUNCH_ACK, local).await.unwrap();
        });

        punch(peer, config(port)).await.unwrap();
        peer_task.await.unwrap();
    }
}
