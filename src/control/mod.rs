//! Control-plane interface
//!
//! The party registry, peer discovery and relay directory live in an
//! external service. The core consumes it through the `ControlPlane`
//! trait; production talks HTTP-JSON, tests use an in-memory registry.
//! An unreachable control plane is degraded operation, never fatal:
//! existing tunnels keep running on the last known state.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::nat::PeerNatInfo;
use crate::peer::PeerIdentity;

pub mod http;

/// A peer as published by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub identity: PeerIdentity,
    pub nat: PeerNatInfo,
}

/// Registry view of one party
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyInfo {
    pub party_id: String,
    pub name: String,
    pub host_id: String,
    pub peers: Vec<PeerDescriptor>,
}

/// One relay directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub public_ip: Ipv4Addr,
    pub port: u16,
    pub region: Option<String>,
}

impl RelayInfo {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.public_ip, self.port))
    }
}

/// Roster change derived from polling the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    PeerJoined(PeerDescriptor),
    PeerLeft(String),
    PeerUpdated(PeerDescriptor),
}

/// Operations the external control plane must provide
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn register_party(
        &self,
        party_id: &str,
        name: &str,
        host: &PeerIdentity,
        host_nat: &PeerNatInfo,
    ) -> Result<(), ControlError>;

    async fn join_party(
        &self,
        party_id: &str,
        peer: &PeerIdentity,
        peer_nat: &PeerNatInfo,
    ) -> Result<PartyInfo, ControlError>;

    async fn leave_party(&self, party_id: &str, peer_id: &str) -> Result<(), ControlError>;

    async fn update_peer(
        &self,
        party_id: &str,
        peer: &PeerIdentity,
        peer_nat: &PeerNatInfo,
    ) -> Result<(), ControlError>;

    async fn get_party(&self, party_id: &str) -> Result<Option<PartyInfo>, ControlError>;

    async fn discover_peer(
        &self,
        party_id: &str,
        peer_id: &str,
    ) -> Result<Option<PeerDescriptor>, ControlError>;

    async fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<(), ControlError>;

    async fn list_relays(&self) -> Result<Vec<RelayInfo>, ControlError>;
}

/// Diff a fresh registry roster against the locally known one
///
/// `known` is the set of peer descriptors currently driving tunnels; the
/// local host is excluded from the produced events. Event order is
/// leaves, then joins, then updates, so a peer id reused in one poll
/// interval tears down before it reconnects.
pub fn diff_roster(
    known: &[PeerDescriptor],
    fresh: &PartyInfo,
    local_peer_id: &str,
) -> Vec<ControlEvent> {
    let mut events = Vec::new();

    for old in known {
        let id = &old.identity.peer_id;
        if id == local_peer_id {
            continue;
        }
        if !fresh.peers.iter().any(|p| &p.identity.peer_id == id) {
            events.push(ControlEvent::PeerLeft(id.clone()));
        }
    }

    for new in &fresh.peers {
        let id = &new.identity.peer_id;
        if id == local_peer_id {
            continue;
        }
        match known.iter().find(|p| &p.identity.peer_id == id) {
            None => events.push(ControlEvent::PeerJoined(new.clone())),
            Some(old) if old != new => events.push(ControlEvent::PeerUpdated(new.clone())),
            Some(_) => {}
        }
    }

    events
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory registry for tests
    pub struct InMemoryControlPlane {
        parties: Mutex<HashMap<String, PartyInfo>>,
        relays: Mutex<Vec<RelayInfo>>,
        pub unreachable: AtomicBool,
    }

    impl InMemoryControlPlane {
        pub fn new() -> Self {
            InMemoryControlPlane {
                parties: Mutex::new(HashMap::new()),
                relays: Mutex::new(Vec::new()),
                unreachable: AtomicBool::new(false),
            }
        }

        pub fn set_relays(&self, relays: Vec<RelayInfo>) {
            *self.relays.lock().unwrap() = relays;
        }

        pub fn set_unreachable(&self, down: bool) {
            self.unreachable.store(down, Ordering::SeqCst);
        }

        /// Seed a peer into a party without going through join
        pub fn seed_peer(&self, party_id: &str, peer: PeerDescriptor) {
            let mut parties = self.parties.lock().unwrap();
            if let Some(party) = parties.get_mut(party_id) {
                party.peers.retain(|p| p.identity.peer_id != peer.identity.peer_id);
                party.peers.push(peer);
            }
        }

        pub fn remove_peer(&self, party_id: &str, peer_id: &str) {
            let mut parties = self.parties.lock().unwrap();
            if let Some(party) = parties.get_mut(party_id) {
                party.peers.retain(|p| p.identity.peer_id != peer_id);
            }
        }

        fn check_reachable(&self) -> Result<(), ControlError> {
            if self.unreachable.load(Ordering::SeqCst) {
                Err(ControlError::Unreachable {
                    message: "simulated outage".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ControlPlane for InMemoryControlPlane {
        async fn register_party(
            &self,
            party_id: &str,
            name: &str,
            host: &PeerIdentity,
            host_nat: &PeerNatInfo,
        ) -> Result<(), ControlError> {
            self.check_reachable()?;
            self.parties.lock().unwrap().insert(
                party_id.to_string(),
                PartyInfo {
                    party_id: party_id.to_string(),
                    name: name.to_string(),
                    host_id: host.peer_id.clone(),
                    peers: vec![PeerDescriptor {
                        identity: host.clone(),
                        nat: *host_nat,
                    }],
                },
            );
            Ok(())
        }

        async fn join_party(
            &self,
            party_id: &str,
            peer: &PeerIdentity,
            peer_nat: &PeerNatInfo,
        ) -> Result<PartyInfo, ControlError> {
            self.check_reachable()?;
            let mut parties = self.parties.lock().unwrap();
            let party = parties
                .get_mut(party_id)
                .ok_or_else(|| ControlError::PartyNotFound {
                    party_id: party_id.to_string(),
                })?;
            party.peers.retain(|p| p.identity.peer_id != peer.peer_id);
            party.peers.push(PeerDescriptor {
                identity: peer.clone(),
                nat: *peer_nat,
            });
            Ok(party.clone())
        }

        async fn leave_party(&self, party_id: &str, peer_id: &str) -> Result<(), ControlError> {
            self.check_reachable()?;
            self.remove_peer(party_id, peer_id);
            Ok(())
        }

        async fn update_peer(
            &self,
            party_id: &str,
            peer: &PeerIdentity,
            peer_nat: &PeerNatInfo,
        ) -> Result<(), ControlError> {
            self.check_reachable()?;
            self.seed_peer(
                party_id,
                PeerDescriptor {
                    identity: peer.clone(),
                    nat: *peer_nat,
                },
            );
            Ok(())
        }

        async fn get_party(&self, party_id: &str) -> Result<Option<PartyInfo>, ControlError> {
            self.check_reachable()?;
            Ok(self.parties.lock().unwrap().get(party_id).cloned())
        }

        async fn discover_peer(
            &self,
            party_id: &str,
            peer_id: &str,
        ) -> Result<Option<PeerDescriptor>, ControlError> {
            self.check_reachable()?;
            Ok(self
                .parties
                .lock()
                .unwrap()
                .get(party_id)
                .and_then(|party| {
                    party
                        .peers
                        .iter()
                        .find(|p| p.identity.peer_id == peer_id)
                        .cloned()
                }))
        }

        async fn heartbeat(&self, _party_id: &str, _peer_id: &str) -> Result<(), ControlError> {
            self.check_reachable()?;
            Ok(())
        }

        async fn list_relays(&self) -> Result<Vec<RelayInfo>, ControlError> {
            self.check_reachable()?;
            Ok(self.relays.lock().unwrap().clone())
        }
    }
}
