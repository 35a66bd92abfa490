//! NAT discovery and traversal
//!
//! STUN-based public endpoint probing, a coarse NAT classification, and
//! UDP hole punching. The orchestrator turns everything recoverable here
//! into a relay decision.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::NatError;
use crate::settings::Settings;

pub mod punch;
pub mod stun;

pub use punch::PunchConfig;

/// Coarse classification of the host's outbound NAT mapping behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    Unknown,
    Open,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
}

impl NatType {
    /// Whether a host behind this NAT can take part in a direct tunnel
    pub fn direct_capable(&self) -> bool {
        matches!(
            self,
            NatType::Open | NatType::FullCone | NatType::RestrictedCone | NatType::PortRestrictedCone
        )
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NatType::Unknown => "unknown",
            NatType::Open => "open",
            NatType::FullCone => "full cone",
            NatType::RestrictedCone => "restricted cone",
            NatType::PortRestrictedCone => "port restricted cone",
            NatType::Symmetric => "symmetric",
        };
        f.write_str(name)
    }
}

/// A pair can go direct only when both ends are demonstrably cone-like;
/// symmetric or unprobed hosts force a relay.
pub fn direct_compatible(a: NatType, b: NatType) -> bool {
    a.direct_capable() && b.direct_capable()
}

/// Outcome of one successful STUN Binding exchange
///
/// `local_*` describe the socket the probe actually ran on; the result is
/// only meaningful for that socket's NAT mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunResult {
    pub nat_type: NatType,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub public_ip: Ipv4Addr,
    pub public_port: u16,
}

impl StunResult {
    pub fn nat_info(&self) -> PeerNatInfo {
        PeerNatInfo {
            nat_type: self.nat_type,
            public_ip: self.public_ip,
            public_port: self.public_port,
        }
    }
}

/// The NAT facts a peer publishes to the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNatInfo {
    pub nat_type: NatType,
    pub public_ip: Ipv4Addr,
    pub public_port: u16,
}

impl PeerNatInfo {
    /// Placeholder published when no STUN server was reachable
    pub fn unknown() -> Self {
        PeerNatInfo {
            nat_type: NatType::Unknown,
            public_ip: Ipv4Addr::UNSPECIFIED,
            public_port: 0,
        }
    }

    pub fn public_endpoint(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.public_ip, self.public_port))
    }
}

/// Classify the NAT from a single Binding exchange
///
/// Single-exchange probing cannot tell symmetric NATs apart from
/// port-restricted cones, nor restricted cones from port-restricted ones;
/// that would take a second server and a changed-address test. Anything
/// that is not demonstrably open or full-cone is therefore reported as
/// `PortRestrictedCone`, the most conservative classification that still
/// allows a punch attempt.
pub fn classify(local_ip: Ipv4Addr, local_port: u16, public: SocketAddrV4) -> NatType {
    if *public.ip() == local_ip {
        NatType::Open
    } else if public.port() == local_port {
        NatType::FullCone
    } else {
        NatType::PortRestrictedCone
    }
}

/// STUN prober and hole puncher
pub struct NatProber {
    servers: Vec<String>,
    stun_timeout: Duration,
    punch: PunchConfig,
}

impl NatProber {
    pub fn new(settings: &Settings) -> Self {
        NatProber {
            servers: settings.nat.stun_servers.clone(),
            stun_timeout: settings.stun_timeout(),
            punch: PunchConfig {
                local_port: settings.network.listen_port,
                probe_count: settings.nat.punch_probe_count,
                spacing: settings.punch_spacing(),
                ack_window: settings.punch_ack_window(),
            },
        }
    }

    /// Discover the host's public endpoint and NAT type
    ///
    /// Servers are tried in order; a timeout, malformed answer, or
    /// transaction-id mismatch falls through to the next one.
    pub async fn discover(&self) -> Result<StunResult, NatError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let local_port = socket.local_addr()?.port();
        let local_ip = local_ipv4().await?;

        for server in &self.servers {
            match self.query(&socket, server).await {
                Some(public) => {
                    let nat_type = classify(local_ip, local_port, public);
                    tracing::info!(
                        %nat_type,
                        public = %public,
                        local = %format!("{local_ip}:{local_port}"),
                        server,
                        "STUN discovery complete"
                    );
                    return Ok(StunResult {
                        nat_type,
                        local_ip,
                        local_port,
                        public_ip: *public.ip(),
                        public_port: public.port(),
                    });
                }
                None => {
                    tracing::debug!(server, "STUN server did not produce a usable answer");
                }
            }
        }

        Err(NatError::StunFailed {
            attempted: self.servers.len(),
        })
    }

    async fn query(&self, socket: &UdpSocket, server: &str) -> Option<SocketAddrV4> {
        let transaction_id = stun::new_transaction_id();
        let request = stun::encode_binding_request(&transaction_id);

        // send_to resolves the hostname; failure falls through to the next server
        socket.send_to(&request, server).await.ok()?;

        let mut buf = [0u8; 512];
        let len = match timeout(self.stun_timeout, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => len,
            _ => return None,
        };
        stun::decode_binding_response(&buf[..len], &transaction_id)
    }

    /// Punch a UDP hole towards a peer's public endpoint
    pub async fn hole_punch(&self, peer: SocketAddr) -> Result<(), NatError> {
        punch::punch(peer, self.punch).await
    }
}

/// The LAN-facing IPv4 address of this host
///
/// A connected UDP socket never sends anything; the OS just picks the
/// outbound interface and reveals its address.
pub async fn local_ipv4() -> Result<Ipv4Addr, NatError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    if socket.connect("8.8.8.8:80").await.is_err() {
        // no default route; loopback is the only honest answer
        return Ok(Ipv4Addr::LOCALHOST);
    }
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(_) => Ok(Ipv4Addr::LOCALHOST),
    }
}
