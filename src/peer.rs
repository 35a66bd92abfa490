//! Peer and party data model

use std::net::{Ipv4Addr, SocketAddr};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::nat::PeerNatInfo;

/// Stable identity of a party member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Opaque stable id, unique within a party
    pub peer_id: String,
    pub display_name: String,
    /// WireGuard public key, base64 interchange form
    pub public_key: String,
}

/// How a peer's tunnel reaches it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Pending,
    Direct,
    Relayed,
    Failed,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionType::Pending => "pending",
            ConnectionType::Direct => "direct",
            ConnectionType::Relayed => "relayed",
            ConnectionType::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Health state of one peer's tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Degraded,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// In-memory record of one party member, owned by the party runtime
#[derive(Debug, Clone)]
pub struct Peer {
    pub identity: PeerIdentity,
    pub virtual_ip: Option<Ipv4Addr>,
    /// Outer UDP destination WireGuard sends to (peer or relay)
    pub endpoint: Option<SocketAddr>,
    pub latency_ms: Option<u64>,
    pub connection_type: ConnectionType,
    pub nat_info: PeerNatInfo,
    pub joined_at: SystemTime,
}

impl Peer {
    pub fn new(identity: PeerIdentity, nat_info: PeerNatInfo) -> Self {
        Peer {
            identity,
            virtual_ip: None,
            endpoint: None,
            latency_ms: None,
            connection_type: ConnectionType::Pending,
            nat_info,
            joined_at: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::NatType;

    #[test]
    fn test_new_peer_starts_pending() {
        let peer = Peer::new(
            PeerIdentity {
                peer_id: "p1".to_string(),
                display_name: "alice".to_string(),
                public_key: "AAAA".to_string(),
            },
            PeerNatInfo::unknown(),
        );
        assert_eq!(peer.connection_type, ConnectionType::Pending);
        assert!(peer.virtual_ip.is_none());
        assert_eq!(peer.nat_info.nat_type, NatType::Unknown);
    }

    #[test]
    fn test_identity_serde_shape() {
        let identity = PeerIdentity {
            peer_id: "p1".to_string(),
            display_name: "alice".to_string(),
            public_key: "c29tZWtleQ==".to_string(),
        };
        let json = serde_json::to_string(&identity).unwrap();
        assert!(json.contains("\"peer_id\":\"p1\""));
        let back: PeerIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, identity);
    }

    #[test]
    fn test_state_rendering() {
        assert_eq!(ConnectionState::Degraded.to_string(), "degraded");
        assert_eq!(ConnectionType::Relayed.to_string(), "relayed");
    }
}
