//! Party runtime
//!
//! Thin façade over the five subsystems with exactly one active party at
//! a time. The control plane drives membership through the hooks here;
//! peer records and orchestrator handles are created and destroyed in the
//! same critical section so the two never drift apart.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::SystemTime;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::broadcast::{decode_frame, encode_frame, BroadcastForwarder};
use crate::control::{diff_roster, ControlEvent, ControlPlane, PeerDescriptor};
use crate::error::{LanrageError, PartyError, Result};
use crate::ipam::Ipam;
use crate::nat::{NatProber, PeerNatInfo};
use crate::orchestrator::{ConnectionOrchestrator, OrchestratorEvent, PeerSnapshot};
use crate::peer::{Peer, PeerIdentity};
use crate::settings::Settings;
use crate::wg::{Backend, WireGuardController};

/// The active party's static metadata and member records
#[derive(Debug, Clone)]
pub struct Party {
    pub party_id: String,
    pub name: String,
    pub host_peer_id: String,
    pub peers: HashMap<String, Peer>,
    pub created_at: SystemTime,
}

/// What the external API sees
#[derive(Debug, Clone)]
pub struct PartyStatus {
    pub party_id: String,
    pub name: String,
    pub host_peer_id: String,
    pub created_at: SystemTime,
    pub peers: Vec<PeerStatus>,
}

/// Per-peer roll-up of static identity and live tunnel state
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub identity: PeerIdentity,
    pub snapshot: Option<PeerSnapshot>,
}

struct PeerTasks {
    forward: JoinHandle<()>,
}

struct ActiveParty {
    party: Party,
    /// Roster as last seen from the registry, for reconcile diffing
    roster: Vec<PeerDescriptor>,
    tasks: HashMap<String, PeerTasks>,
    heartbeat: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

struct RuntimeInner {
    settings: Settings,
    control: Arc<dyn ControlPlane>,
    wg: Arc<WireGuardController>,
    ipam: Arc<Ipam>,
    prober: Arc<NatProber>,
    orchestrator: ConnectionOrchestrator,
    forwarder: Arc<BroadcastForwarder>,
    carrier: Arc<UdpSocket>,
    local_peer_id: String,
    display_name: StdMutex<String>,
    nat_info: StdMutex<PeerNatInfo>,
    active: Mutex<Option<ActiveParty>>,
}

/// Top-level runtime owning one party and all five subsystems
pub struct PartyRuntime {
    inner: Arc<RuntimeInner>,
    background: StdMutex<Vec<JoinHandle<()>>>,
    orchestrator_events: StdMutex<Option<mpsc::UnboundedReceiver<OrchestratorEvent>>>,
}

impl PartyRuntime {
    /// Wire the subsystems together; nothing touches the network yet
    pub async fn new(
        settings: Settings,
        control: Arc<dyn ControlPlane>,
        backend: Arc<dyn Backend>,
        keys_dir: PathBuf,
        display_name: &str,
    ) -> Result<Self> {
        settings.validate().map_err(LanrageError::Config)?;

        let wg = Arc::new(WireGuardController::new(&settings, keys_dir, backend)?);
        let ipam = Arc::new(Ipam::new(settings.network.base_subnet));
        let prober = Arc::new(NatProber::new(&settings));

        let local_ip = crate::nat::local_ipv4().await.unwrap_or(Ipv4Addr::LOCALHOST);
        let whitelist_path = crate::settings::config_dir()
            .map(|dir| dir.join(crate::broadcast::ports::WHITELIST_FILE))
            .unwrap_or_else(|_| PathBuf::from(crate::broadcast::ports::WHITELIST_FILE));
        let forwarder = Arc::new(BroadcastForwarder::new(
            &settings,
            whitelist_path,
            local_ip,
            Ipv4Addr::BROADCAST,
        ));

        let carrier = Arc::new(
            UdpSocket::bind(("0.0.0.0", settings.network.carrier_port))
                .await
                .map_err(LanrageError::System)?,
        );

        let (orchestrator, orchestrator_events) = ConnectionOrchestrator::new(
            wg.clone(),
            ipam.clone(),
            prober.clone(),
            control.clone(),
            &settings,
        );

        let local_peer_id = wg.public_key();
        let inner = Arc::new(RuntimeInner {
            settings,
            control,
            wg,
            ipam,
            prober,
            orchestrator,
            forwarder,
            carrier,
            local_peer_id,
            display_name: StdMutex::new(display_name.to_string()),
            nat_info: StdMutex::new(PeerNatInfo::unknown()),
            active: Mutex::new(None),
        });

        Ok(PartyRuntime {
            inner,
            background: StdMutex::new(Vec::new()),
            orchestrator_events: StdMutex::new(Some(orchestrator_events)),
        })
    }

    /// Discover NAT, start broadcast capture and the overlay carrier
    ///
    /// A host that cannot reach any STUN server keeps going in relay-only
    /// mode with an unknown NAT type.
    pub async fn start(&self) -> Result<()> {
        match self.inner.prober.discover().await {
            Ok(result) => {
                let info = result.nat_info();
                *self.inner.nat_info.lock().expect("nat lock") = info;
                self.inner.orchestrator.set_local_nat(info);
            }
            Err(e) => {
                tracing::warn!(error = %e, "NAT discovery failed, continuing relay-only");
            }
        }

        self.inner
            .forwarder
            .start()
            .await
            .map_err(LanrageError::Config)?;

        let mut tasks = self.background.lock().expect("background lock");
        tasks.push(spawn_carrier_listener(self.inner.clone()));
        if let Some(events) = self.orchestrator_events.lock().expect("events lock").take() {
            tasks.push(spawn_expiry_consumer(self.inner.clone(), events));
        }
        Ok(())
    }

    pub fn local_peer_id(&self) -> &str {
        &self.inner.local_peer_id
    }

    pub fn public_key(&self) -> String {
        self.inner.wg.public_key()
    }

    fn identity(&self) -> PeerIdentity {
        PeerIdentity {
            peer_id: self.inner.local_peer_id.clone(),
            display_name: self.inner.display_name.lock().expect("name lock").clone(),
            public_key: self.inner.wg.public_key(),
        }
    }

    /// Register a fresh party with this host as its first member
    pub async fn create_party(&self, name: &str) -> Result<String> {
        let mut active = self.inner.active.lock().await;
        if let Some(existing) = active.as_ref() {
            return Err(PartyError::AlreadyInParty {
                party_id: existing.party.party_id.clone(),
            }
            .into());
        }

        let party_id = uuid::Uuid::new_v4().to_string();
        let host_ip = self
            .inner
            .ipam
            .allocate(&self.inner.local_peer_id)
            .map_err(LanrageError::Ipam)?;
        self.inner
            .wg
            .initialize(host_ip)
            .await
            .map_err(LanrageError::Platform)?;

        let identity = self.identity();
        let nat = *self.inner.nat_info.lock().expect("nat lock");
        self.inner
            .control
            .register_party(&party_id, name, &identity, &nat)
            .await
            .map_err(|e| LanrageError::Party(PartyError::Control(e)))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut fresh = ActiveParty {
            party: Party {
                party_id: party_id.clone(),
                name: name.to_string(),
                host_peer_id: self.inner.local_peer_id.clone(),
                peers: HashMap::new(),
                created_at: SystemTime::now(),
            },
            roster: vec![PeerDescriptor { identity, nat }],
            tasks: HashMap::new(),
            heartbeat: None,
            shutdown,
        };
        fresh.heartbeat = Some(spawn_heartbeat(self.inner.clone(), party_id.clone(), shutdown_rx));
        *active = Some(fresh);

        tracing::info!(party_id, name, host_ip = %host_ip, "Party created");
        Ok(party_id)
    }

    /// Join an existing party and connect to every current member
    pub async fn join_party(&self, party_id: &str, display_name: &str) -> Result<()> {
        {
            let active = self.inner.active.lock().await;
            if let Some(existing) = active.as_ref() {
                return Err(PartyError::AlreadyInParty {
                    party_id: existing.party.party_id.clone(),
                }
                .into());
            }
        }
        *self.inner.display_name.lock().expect("name lock") = display_name.to_string();

        let identity = self.identity();
        let nat = *self.inner.nat_info.lock().expect("nat lock");
        let info = self
            .inner
            .control
            .join_party(party_id, &identity, &nat)
            .await
            .map_err(|e| LanrageError::Party(PartyError::Control(e)))?;

        // allocate the whole roster in registry order so every member
        // computes the same address for every peer
        let mut host_ip = None;
        for descriptor in &info.peers {
            let ip = self
                .inner
                .ipam
                .allocate(&descriptor.identity.peer_id)
                .map_err(LanrageError::Ipam)?;
            if descriptor.identity.peer_id == self.inner.local_peer_id {
                host_ip = Some(ip);
            }
        }
        let host_ip = host_ip.unwrap_or(
            self.inner
                .ipam
                .allocate(&self.inner.local_peer_id)
                .map_err(LanrageError::Ipam)?,
        );
        self.inner
            .wg
            .initialize(host_ip)
            .await
            .map_err(LanrageError::Platform)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        {
            let mut active = self.inner.active.lock().await;
            let mut fresh = ActiveParty {
                party: Party {
                    party_id: info.party_id.clone(),
                    name: info.name.clone(),
                    host_peer_id: info.host_id.clone(),
                    peers: HashMap::new(),
                    created_at: SystemTime::now(),
                },
                roster: info.peers.clone(),
                tasks: HashMap::new(),
                heartbeat: None,
                shutdown,
            };
            fresh.heartbeat = Some(spawn_heartbeat(
                self.inner.clone(),
                info.party_id.clone(),
                shutdown_rx,
            ));
            *active = Some(fresh);
        }

        for descriptor in &info.peers {
            if descriptor.identity.peer_id != self.inner.local_peer_id {
                self.inner.handle_peer_joined(descriptor.clone()).await;
            }
        }

        tracing::info!(party_id, host_ip = %host_ip, peers = info.peers.len().saturating_sub(1), "Joined party");
        Ok(())
    }

    /// Disconnect everyone, deregister, tear the overlay down. Idempotent.
    pub async fn leave_party(&self) -> Result<()> {
        let Some(mut active) = self.inner.active.lock().await.take() else {
            return Ok(());
        };
        let party_id = active.party.party_id.clone();

        let _ = active.shutdown.send(true);
        if let Some(heartbeat) = active.heartbeat.take() {
            let _ = heartbeat.await;
        }

        for (peer_id, tasks) in active.tasks.drain() {
            tasks.forward.abort();
            self.inner.forwarder.unregister_peer(&peer_id);
        }
        self.inner.orchestrator.teardown().await;

        if let Err(e) = self
            .inner
            .control
            .leave_party(&party_id, &self.inner.local_peer_id)
            .await
        {
            tracing::warn!(party_id, error = %e, "Deregistration failed, leaving anyway");
        }

        if let Err(e) = self.inner.wg.teardown().await {
            tracing::warn!(error = %e, "Interface teardown failed");
        }
        self.inner.ipam.release(&self.inner.local_peer_id);

        tracing::info!(party_id, "Left party");
        Ok(())
    }

    /// Control-plane hook: a peer appeared
    pub async fn on_peer_joined(&self, descriptor: PeerDescriptor) {
        self.inner.handle_peer_joined(descriptor).await;
    }

    /// Control-plane hook: a peer left
    pub async fn on_peer_left(&self, peer_id: &str) {
        self.inner.handle_peer_left(peer_id).await;
    }

    /// Control-plane hook: a peer's published facts changed
    pub async fn on_peer_updated(&self, descriptor: PeerDescriptor) {
        self.inner.handle_peer_updated(descriptor).await;
    }

    /// Poll the registry once and apply any roster changes
    pub async fn reconcile(&self) {
        let party_id = {
            let active = self.inner.active.lock().await;
            match active.as_ref() {
                Some(active) => active.party.party_id.clone(),
                None => return,
            }
        };
        self.inner.reconcile_party(&party_id).await;
    }

    /// Aggregate static party data with live per-peer snapshots
    pub async fn status(&self) -> Result<PartyStatus> {
        let active = self.inner.active.lock().await;
        let Some(active) = active.as_ref() else {
            return Err(PartyError::NoActiveParty.into());
        };

        let mut peers = Vec::with_capacity(active.party.peers.len());
        for (peer_id, peer) in &active.party.peers {
            peers.push(PeerStatus {
                identity: peer.identity.clone(),
                snapshot: self.inner.orchestrator.snapshot(peer_id).await,
            });
        }
        Ok(PartyStatus {
            party_id: active.party.party_id.clone(),
            name: active.party.name.clone(),
            host_peer_id: active.party.host_peer_id.clone(),
            created_at: active.party.created_at,
            peers,
        })
    }

    pub async fn in_party(&self) -> bool {
        self.inner.active.lock().await.is_some()
    }

    /// Shared access to the broadcast forwarder (port/profile management)
    pub fn forwarder(&self) -> &Arc<BroadcastForwarder> {
        &self.inner.forwarder
    }

    /// Leave the party if any and stop every background task
    pub async fn teardown(&self) {
        let _ = self.leave_party().await;
        self.inner.forwarder.shutdown().await;
        for task in self.background.lock().expect("background lock").drain(..) {
            task.abort();
        }
    }
}

impl RuntimeInner {
    async fn handle_peer_joined(&self, descriptor: PeerDescriptor) {
        let peer_id = descriptor.identity.peer_id.clone();
        let party_id = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(active) => active.party.party_id.clone(),
                None => return,
            }
        };

        let snapshot = match self.orchestrator.connect(&party_id, &peer_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(party_id, peer_id, error = %e, "Peer connect failed");
                return;
            }
        };

        let mut active = self.active.lock().await;
        let Some(active) = active.as_mut() else { return };

        let mut peer = Peer::new(descriptor.identity.clone(), descriptor.nat);
        peer.virtual_ip = Some(snapshot.virtual_ip);
        peer.endpoint = Some(snapshot.endpoint);
        peer.latency_ms = snapshot.last_latency_ms;
        peer.connection_type = snapshot.strategy;
        active.party.peers.insert(peer_id.clone(), peer);
        active.roster.retain(|d| d.identity.peer_id != peer_id);
        active.roster.push(descriptor);

        // forward captured broadcasts into this peer's tunnel
        let receiver = self.forwarder.register_peer(&peer_id);
        let forward = spawn_peer_forwarder(
            self.carrier.clone(),
            receiver,
            snapshot.virtual_ip,
            self.settings.network.carrier_port,
        );
        active.tasks.insert(peer_id, PeerTasks { forward });
    }

    async fn handle_peer_left(&self, peer_id: &str) {
        self.orchestrator.disconnect(peer_id).await;
        self.drop_peer_state(peer_id).await;
        tracing::info!(peer_id, "Peer left the party");
    }

    async fn handle_peer_updated(&self, descriptor: PeerDescriptor) {
        let peer_id = descriptor.identity.peer_id.clone();
        let changed_nat = {
            let active = self.active.lock().await;
            match active.as_ref().and_then(|a| a.party.peers.get(&peer_id)) {
                Some(existing) => existing.nat_info != descriptor.nat,
                None => true,
            }
        };
        if changed_nat {
            // published endpoint moved: rebuild the tunnel with a fresh
            // strategy decision
            tracing::info!(peer_id, "Peer NAT info changed, re-evaluating");
            self.orchestrator.disconnect(&peer_id).await;
            self.drop_peer_state(&peer_id).await;
        }
        self.handle_peer_joined(descriptor).await;
    }

    /// Forget runtime state for a peer (tunnel teardown handled elsewhere)
    async fn drop_peer_state(&self, peer_id: &str) {
        self.forwarder.unregister_peer(peer_id);
        let mut active = self.active.lock().await;
        if let Some(active) = active.as_mut() {
            active.party.peers.remove(peer_id);
            active.roster.retain(|d| d.identity.peer_id != peer_id);
            if let Some(tasks) = active.tasks.remove(peer_id) {
                tasks.forward.abort();
            }
        }
    }

    async fn reconcile_party(&self, party_id: &str) {
        let fresh = match self.control.get_party(party_id).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => {
                tracing::warn!(party_id, "Party vanished from the registry");
                return;
            }
            Err(e) => {
                // degraded but recoverable: keep serving existing tunnels
                tracing::warn!(party_id, error = %e, "Registry poll failed, keeping current state");
                return;
            }
        };

        let known = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(active) => active.roster.clone(),
                None => return,
            }
        };

        for event in diff_roster(&known, &fresh, &self.local_peer_id) {
            match event {
                ControlEvent::PeerJoined(descriptor) => {
                    tracing::info!(party_id, peer_id = %descriptor.identity.peer_id, "Peer joined");
                    self.handle_peer_joined(descriptor).await;
                }
                ControlEvent::PeerLeft(peer_id) => self.handle_peer_left(&peer_id).await,
                ControlEvent::PeerUpdated(descriptor) => {
                    self.handle_peer_updated(descriptor).await;
                }
            }
        }
    }
}

fn spawn_heartbeat(
    inner: Arc<RuntimeInner>,
    party_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = inner.settings.heartbeat_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + interval,
            interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = inner.control.heartbeat(&party_id, &inner.local_peer_id).await {
                        tracing::warn!(party_id, error = %e, "Heartbeat failed");
                    }
                    inner.reconcile_party(&party_id).await;
                }
            }
        }
    })
}

/// Pump one peer's broadcast queue into its tunnel as carrier frames
fn spawn_peer_forwarder(
    carrier: Arc<UdpSocket>,
    mut receiver: mpsc::Receiver<crate::broadcast::BroadcastPacket>,
    peer_ip: Ipv4Addr,
    carrier_port: u16,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(packet) = receiver.recv().await {
            let frame = encode_frame(packet.dest_port, *packet.source.ip(), &packet.payload);
            let destination = SocketAddr::from((peer_ip, carrier_port));
            if let Err(e) = carrier.send_to(&frame, destination).await {
                tracing::debug!(peer_ip = %peer_ip, error = %e, "Carrier send failed");
            }
        }
    })
}

/// Receive carrier frames from peers and re-inject them locally
fn spawn_carrier_listener(inner: Arc<RuntimeInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, from) = match inner.carrier.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(error = %e, "Carrier receive failed");
                    continue;
                }
            };
            match decode_frame(&buf[..len]) {
                Some((dest_port, source_ip, payload)) => {
                    tracing::trace!(%from, dest_port, len = payload.len(), "Carrier frame");
                    inner.forwarder.inject_remote(dest_port, source_ip, payload).await;
                }
                None => {
                    tracing::debug!(%from, len, "Malformed carrier frame dropped");
                }
            }
        }
    })
}

/// Consume expiry notifications so failed peers vanish from the party too
fn spawn_expiry_consumer(
    inner: Arc<RuntimeInner>,
    mut events: mpsc::UnboundedReceiver<OrchestratorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                OrchestratorEvent::PeerExpired { peer_id } => {
                    tracing::info!(peer_id, "Reclaiming expired peer");
                    inner.drop_peer_state(&peer_id).await;
                }
            }
        }
    })
}
