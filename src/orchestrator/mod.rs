//! Connection orchestration
//!
//! One state machine per peer, driven from "peer announced" to "tunnel
//! healthy" and kept there. Each peer's state is owned by its monitor
//! task; everyone else reads snapshots through a watch channel, so there
//! is exactly one writer per peer and no shared mutable peer map.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use ipnet::Ipv4Net;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::control::{ControlPlane, RelayInfo};
use crate::error::ConnectError;
use crate::ipam::Ipam;
use crate::keys::decode_public_key;
use crate::nat::{direct_compatible, NatProber, PeerNatInfo};
use crate::peer::{ConnectionState, ConnectionType};
use crate::settings::Settings;
use crate::wg::{PeerConfig, WireGuardController};

pub mod monitor;
pub mod relay;

/// What the runtime surfaces about one peer's tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub virtual_ip: Ipv4Addr,
    pub endpoint: SocketAddr,
    pub strategy: ConnectionType,
    pub last_latency_ms: Option<u64>,
    pub state: ConnectionState,
    /// When the current state was entered
    pub since: SystemTime,
}

/// Out-of-band notifications from monitor tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// A failed peer sat out its whole grace window and was reclaimed
    PeerExpired { peer_id: String },
}

pub(crate) enum MonitorCommand {
    Reconnect,
    Shutdown,
}

/// Thresholds and intervals the state machine runs on
#[derive(Debug, Clone)]
pub(crate) struct Timing {
    pub monitor_interval: Duration,
    pub cleanup_grace: Duration,
    pub degraded_ms: u64,
    pub failed_ms: u64,
    pub failure_strikes: u32,
    pub max_reconnects: u32,
    pub relay_probe_timeout: Duration,
    pub relay_improvement: f64,
    pub keepalive: u16,
}

impl From<&Settings> for Timing {
    fn from(settings: &Settings) -> Self {
        Timing {
            monitor_interval: settings.monitor_interval(),
            cleanup_grace: settings.cleanup_grace(),
            degraded_ms: settings.monitor.degraded_threshold_ms,
            failed_ms: settings.monitor.failed_threshold_ms,
            failure_strikes: settings.monitor.failure_strikes,
            max_reconnects: settings.monitor.max_reconnect_attempts,
            relay_probe_timeout: settings.relay_probe_timeout(),
            relay_improvement: settings.monitor.relay_switch_improvement,
            keepalive: settings.network.persistent_keepalive_s,
        }
    }
}

struct PeerHandle {
    public_key: String,
    snapshot: watch::Receiver<PeerSnapshot>,
    commands: mpsc::Sender<MonitorCommand>,
    task: JoinHandle<()>,
}

pub(crate) struct Shared {
    pub wg: Arc<WireGuardController>,
    pub ipam: Arc<Ipam>,
    pub prober: Arc<NatProber>,
    pub control: Arc<dyn ControlPlane>,
    pub timing: Timing,
    fallback_relay: Option<String>,
    default_relay: String,
    local_nat: StdMutex<PeerNatInfo>,
    relay_cache: StdMutex<Vec<RelayInfo>>,
    peers: Mutex<HashMap<String, PeerHandle>>,
    pub events: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl Shared {
    pub fn local_nat(&self) -> PeerNatInfo {
        *self.local_nat.lock().expect("nat lock")
    }

    /// Current relay list: directory first, then the last list that
    /// worked, then the configured fallback, then the built-in default
    pub async fn fetch_relays(&self) -> Vec<RelayInfo> {
        match self.control.list_relays().await {
            Ok(list) if !list.is_empty() => {
                *self.relay_cache.lock().expect("relay lock") = list.clone();
                return list;
            }
            Ok(_) => {
                tracing::debug!("Relay directory is empty");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Relay directory unreachable, using last known list");
            }
        }

        let cached = self.relay_cache.lock().expect("relay lock").clone();
        if !cached.is_empty() {
            return cached;
        }

        if let Some(configured) = &self.fallback_relay {
            if let Some(relay) = resolve_relay(configured).await {
                return vec![relay];
            }
        }
        match resolve_relay(&self.default_relay).await {
            Some(relay) => vec![relay],
            None => Vec::new(),
        }
    }

    /// Decide direct vs. relay and produce the outer endpoint
    pub async fn select_endpoint(
        &self,
        peer_id: &str,
        peer_nat: &PeerNatInfo,
    ) -> Result<(SocketAddr, ConnectionType), ConnectError> {
        let local = self.local_nat();
        if direct_compatible(local.nat_type, peer_nat.nat_type) {
            let target = peer_nat.public_endpoint();
            match self.prober.hole_punch(target).await {
                Ok(()) => {
                    tracing::info!(peer_id, endpoint = %target, "Direct path punched");
                    return Ok((target, ConnectionType::Direct));
                }
                Err(e) => {
                    tracing::info!(peer_id, error = %e, "Hole punch failed, falling back to relay");
                }
            }
        } else {
            tracing::debug!(
                peer_id,
                local_nat = %local.nat_type,
                peer_nat = %peer_nat.nat_type,
                "NAT pair not direct-capable"
            );
        }

        let relays = self.fetch_relays().await;
        let choice = relay::best_relay(&self.wg, &relays, self.timing.relay_probe_timeout, None)
            .await
            .ok_or(ConnectError::RelayUnreachable)?;
        tracing::info!(peer_id, relay = %choice.relay.endpoint(), rtt = ?choice.rtt, "Relay selected");
        Ok((choice.relay.endpoint(), ConnectionType::Relayed))
    }

    pub fn peer_wg_config(&self, public_key: &str, endpoint: SocketAddr, virtual_ip: Ipv4Addr) -> PeerConfig {
        PeerConfig {
            public_key: public_key.to_string(),
            endpoint,
            allowed_ips: vec![Ipv4Net::new(virtual_ip, 32).expect("a /32 is always valid")],
            persistent_keepalive: self.timing.keepalive,
        }
    }
}

async fn resolve_relay(endpoint: &str) -> Option<RelayInfo> {
    let mut addrs = match tokio::net::lookup_host(endpoint).await {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::debug!(endpoint, error = %e, "Relay endpoint did not resolve");
            return None;
        }
    };
    addrs.find_map(|addr| match addr {
        SocketAddr::V4(v4) => Some(RelayInfo {
            public_ip: *v4.ip(),
            port: v4.port(),
            region: None,
        }),
        SocketAddr::V6(_) => None,
    })
}

/// Per-peer connection driver
pub struct ConnectionOrchestrator {
    shared: Arc<Shared>,
}

impl ConnectionOrchestrator {
    pub fn new(
        wg: Arc<WireGuardController>,
        ipam: Arc<Ipam>,
        prober: Arc<NatProber>,
        control: Arc<dyn ControlPlane>,
        settings: &Settings,
    ) -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        Self::with_timing(wg, ipam, prober, control, settings, Timing::from(settings))
    }

    pub(crate) fn with_timing(
        wg: Arc<WireGuardController>,
        ipam: Arc<Ipam>,
        prober: Arc<NatProber>,
        control: Arc<dyn ControlPlane>,
        settings: &Settings,
        timing: Timing,
    ) -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            wg,
            ipam,
            prober,
            control,
            timing,
            fallback_relay: settings.control.fallback_relay.clone(),
            default_relay: settings.control.default_relay.clone(),
            local_nat: StdMutex::new(PeerNatInfo::unknown()),
            relay_cache: StdMutex::new(Vec::new()),
            peers: Mutex::new(HashMap::new()),
            events,
        });
        (ConnectionOrchestrator { shared }, events_rx)
    }

    /// Record the host's own NAT discovery result
    pub fn set_local_nat(&self, info: PeerNatInfo) {
        *self.shared.local_nat.lock().expect("nat lock") = info;
    }

    /// Drive a peer towards a healthy tunnel
    ///
    /// Idempotent for live peers; a peer sitting in its failure grace
    /// window is kicked back into reconnection instead.
    pub async fn connect(&self, party_id: &str, peer_id: &str) -> Result<PeerSnapshot, ConnectError> {
        {
            let peers = self.shared.peers.lock().await;
            if let Some(handle) = peers.get(peer_id) {
                let snapshot = handle.snapshot.borrow().clone();
                if snapshot.state == ConnectionState::Failed {
                    let _ = handle.commands.try_send(MonitorCommand::Reconnect);
                }
                return Ok(snapshot);
            }
        }

        let descriptor = self
            .shared
            .control
            .discover_peer(party_id, peer_id)
            .await?
            .ok_or_else(|| ConnectError::PeerNotFound {
                peer_id: peer_id.to_string(),
            })?;
        if decode_public_key(&descriptor.identity.public_key).is_none() {
            return Err(ConnectError::InvalidPublicKey {
                peer_id: peer_id.to_string(),
            });
        }

        let (endpoint, strategy) = self
            .shared
            .select_endpoint(peer_id, &descriptor.nat)
            .await?;
        let virtual_ip = self.shared.ipam.allocate(peer_id)?;
        self.shared
            .wg
            .add_peer(self.shared.peer_wg_config(
                &descriptor.identity.public_key,
                endpoint,
                virtual_ip,
            ))
            .await?;

        // initial health check; a miss just arms the monitor
        let latency = self.shared.wg.measure_latency(virtual_ip).await;
        let snapshot = PeerSnapshot {
            peer_id: peer_id.to_string(),
            virtual_ip,
            endpoint,
            strategy,
            last_latency_ms: latency,
            state: ConnectionState::Connected,
            since: SystemTime::now(),
        };
        tracing::info!(
            peer_id,
            virtual_ip = %virtual_ip,
            %endpoint,
            strategy = %strategy,
            latency_ms = ?latency,
            "Peer connected"
        );

        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());
        let (commands_tx, commands_rx) = mpsc::channel(4);
        let context = monitor::PeerContext {
            peer_id: peer_id.to_string(),
            public_key: descriptor.identity.public_key.clone(),
            virtual_ip,
            peer_nat: descriptor.nat,
            initial_endpoint: endpoint,
            initial_strategy: strategy,
            initial_latency: latency,
        };
        let task = tokio::spawn(monitor::run(
            self.shared.clone(),
            context,
            commands_rx,
            snapshot_tx,
        ));

        self.shared.peers.lock().await.insert(
            peer_id.to_string(),
            PeerHandle {
                public_key: descriptor.identity.public_key,
                snapshot: snapshot_rx,
                commands: commands_tx,
                task,
            },
        );
        Ok(snapshot)
    }

    /// Tear one peer down: monitor, WireGuard entry, virtual IP. Idempotent.
    pub async fn disconnect(&self, peer_id: &str) {
        let handle = self.shared.peers.lock().await.remove(peer_id);
        let Some(handle) = handle else { return };

        let _ = handle.commands.try_send(MonitorCommand::Shutdown);
        let _ = handle.task.await;

        if let Err(e) = self.shared.wg.remove_peer(&handle.public_key).await {
            tracing::warn!(peer_id, error = %e, "WireGuard peer removal failed");
        }
        self.shared.ipam.release(peer_id);
        tracing::info!(peer_id, "Peer disconnected");
    }

    /// Current snapshot for one peer
    pub async fn snapshot(&self, peer_id: &str) -> Option<PeerSnapshot> {
        let peers = self.shared.peers.lock().await;
        peers.get(peer_id).map(|handle| handle.snapshot.borrow().clone())
    }

    /// Current snapshots for every tracked peer
    pub async fn snapshots(&self) -> Vec<PeerSnapshot> {
        let peers = self.shared.peers.lock().await;
        peers
            .values()
            .map(|handle| handle.snapshot.borrow().clone())
            .collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.peers.lock().await.len()
    }

    /// Disconnect every peer
    pub async fn teardown(&self) {
        let peer_ids: Vec<String> = {
            let peers = self.shared.peers.lock().await;
            peers.keys().cloned().collect()
        };
        for peer_id in peer_ids {
            self.disconnect(&peer_id).await;
        }
    }
}
