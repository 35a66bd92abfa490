//! LAN broadcast/multicast emulation
//!
//! Captures UDP discovery traffic on the monitored ports, deduplicates it
//! by content hash, and fans it out to per-peer bounded channels. Remote
//! packets arrive framed over the overlay and are re-injected on the
//! local interface so games see them as ordinary LAN traffic.
//!
//! Loop avoidance is two layered: the injector stamps a packet's hash
//! into the dedup set before sending, and injected packets leave this
//! host with its own source address rather than the original sender's.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::ConfigError;
use crate::settings::Settings;

pub mod dedup;
pub mod ports;

use dedup::{content_hash, DedupCache, ForwardMetrics};
use ports::{PortRegistry, USER_WHITELIST_OWNER};

/// mDNS multicast group and port
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;
/// SSDP multicast group and port
pub const SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;

/// Carrier frame header: dest_port (2) + source ip (4)
const FRAME_HEADER_LEN: usize = 6;
/// Payload budget per carrier frame; larger captures are dropped
pub const MAX_FRAME_PAYLOAD: usize = 1400;

/// One captured (or remotely received) discovery packet
#[derive(Debug, Clone)]
pub struct BroadcastPacket {
    pub payload: Vec<u8>,
    pub source: SocketAddrV4,
    pub dest_port: u16,
    pub received_at: Instant,
}

/// Where an injected packet should land on the local network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectScope {
    Broadcast,
    Multicast(Ipv4Addr),
}

/// Scope a port maps to on re-injection
pub fn scope_for_port(port: u16) -> InjectScope {
    match port {
        MDNS_PORT => InjectScope::Multicast(MDNS_GROUP),
        SSDP_PORT => InjectScope::Multicast(SSDP_GROUP),
        _ => InjectScope::Broadcast,
    }
}

/// Encode a packet for transport over the overlay
pub fn encode_frame(dest_port: u16, source_ip: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&dest_port.to_be_bytes());
    frame.extend_from_slice(&source_ip.octets());
    frame.extend_from_slice(payload);
    frame
}

/// Decode a carrier frame; `None` for anything shorter than the header
pub fn decode_frame(frame: &[u8]) -> Option<(u16, Ipv4Addr, &[u8])> {
    if frame.len() < FRAME_HEADER_LEN {
        return None;
    }
    let dest_port = u16::from_be_bytes([frame[0], frame[1]]);
    let source_ip = Ipv4Addr::new(frame[2], frame[3], frame[4], frame[5]);
    Some((dest_port, source_ip, &frame[FRAME_HEADER_LEN..]))
}

struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

type PeerSenders = Arc<RwLock<HashMap<String, mpsc::Sender<BroadcastPacket>>>>;

/// Broadcast capture, dedup, fan-out and re-injection
pub struct BroadcastForwarder {
    dedup: Arc<DedupCache>,
    metrics: Arc<ForwardMetrics>,
    peers: PeerSenders,
    registry: StdMutex<PortRegistry>,
    listeners: Mutex<HashMap<u16, ListenerHandle>>,
    cleanup: Mutex<Option<ListenerHandle>>,
    whitelist_path: PathBuf,
    whitelist_ports: StdMutex<Vec<u16>>,
    local_ip: Ipv4Addr,
    /// Destination of broadcast-scope injections
    broadcast_addr: Ipv4Addr,
    channel_capacity: usize,
    dedup_window: std::time::Duration,
}

impl BroadcastForwarder {
    pub fn new(
        settings: &Settings,
        whitelist_path: PathBuf,
        local_ip: Ipv4Addr,
        broadcast_addr: Ipv4Addr,
    ) -> Self {
        BroadcastForwarder {
            dedup: Arc::new(DedupCache::new(settings.dedup_window())),
            metrics: Arc::new(ForwardMetrics::default()),
            peers: Arc::new(RwLock::new(HashMap::new())),
            registry: StdMutex::new(PortRegistry::new()),
            listeners: Mutex::new(HashMap::new()),
            cleanup: Mutex::new(None),
            whitelist_path,
            whitelist_ports: StdMutex::new(Vec::new()),
            local_ip,
            broadcast_addr,
            channel_capacity: settings.broadcast.channel_capacity,
            dedup_window: settings.dedup_window(),
        }
    }

    /// Load the whitelist, start its listeners and the dedup cleanup task
    pub async fn start(&self) -> Result<(), ConfigError> {
        let whitelist = ports::load_whitelist(&self.whitelist_path)?;
        *self.whitelist_ports.lock().expect("whitelist lock") = whitelist.clone();
        for port in whitelist {
            self.add_port(port, USER_WHITELIST_OWNER).await;
        }

        let dedup = self.dedup.clone();
        let window = self.dedup_window;
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => dedup.prune(),
                }
            }
        });
        *self.cleanup.lock().await = Some(ListenerHandle { shutdown, task });
        Ok(())
    }

    /// Register interest in a UDP port
    ///
    /// A bind failure (typically the game itself holding the port without
    /// address reuse) is logged and skipped; it never aborts startup.
    pub async fn add_port(&self, port: u16, owner: &str) {
        let fresh = self.registry.lock().expect("registry lock").add(port, owner);
        if !fresh {
            return;
        }
        match bind_capture_socket(port) {
            Ok(socket) => {
                let handle = self.spawn_listener(port, socket);
                self.listeners.lock().await.insert(port, handle);
                tracing::info!(port, owner, "Broadcast listener started");
            }
            Err(e) => {
                tracing::warn!(port, owner, error = %e, "Cannot bind broadcast listener, skipping");
            }
        }
    }

    /// Release every port an owner holds, stopping orphaned listeners
    pub async fn release_owner(&self, owner: &str) {
        let released = self.registry.lock().expect("registry lock").release_owner(owner);
        for port in released {
            if let Some(handle) = self.listeners.lock().await.remove(&port) {
                let _ = handle.shutdown.send(true);
                let _ = handle.task.await;
                tracing::info!(port, owner, "Broadcast listener stopped");
            }
        }
    }

    /// Start capturing for a built-in game profile; false for unknown names
    pub async fn activate_profile(&self, name: &str) -> bool {
        let Some(profile) = ports::profile(name) else {
            tracing::warn!(game = name, "Unknown game profile");
            return false;
        };
        if !profile.broadcast {
            return true;
        }
        for &port in profile.ports {
            self.add_port(port, &format!("game:{name}")).await;
        }
        true
    }

    pub async fn deactivate_profile(&self, name: &str) {
        self.release_owner(&format!("game:{name}")).await;
    }

    /// Replace the user whitelist, persisting it atomically
    pub async fn set_whitelist(&self, new_ports: Vec<u16>) -> Result<(), ConfigError> {
        ports::save_whitelist(&self.whitelist_path, &new_ports)?;
        self.release_owner(USER_WHITELIST_OWNER).await;
        for &port in &new_ports {
            self.add_port(port, USER_WHITELIST_OWNER).await;
        }
        *self.whitelist_ports.lock().expect("whitelist lock") = new_ports;
        Ok(())
    }

    pub fn whitelist(&self) -> Vec<u16> {
        self.whitelist_ports.lock().expect("whitelist lock").clone()
    }

    /// Subscribe a peer to captured packets
    ///
    /// The channel is bounded: a peer that cannot keep up loses its own
    /// packets without slowing anyone else down.
    pub fn register_peer(&self, peer_id: &str) -> mpsc::Receiver<BroadcastPacket> {
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        self.peers
            .write()
            .expect("peers lock")
            .insert(peer_id.to_string(), sender);
        receiver
    }

    pub fn unregister_peer(&self, peer_id: &str) {
        self.peers.write().expect("peers lock").remove(peer_id);
    }

    /// Re-inject a packet received from a tunneled peer
    pub async fn inject_remote(&self, dest_port: u16, source_ip: Ipv4Addr, payload: &[u8]) {
        let packet = BroadcastPacket {
            payload: payload.to_vec(),
            source: SocketAddrV4::new(source_ip, 0),
            dest_port,
            received_at: Instant::now(),
        };
        self.inject(&packet, scope_for_port(dest_port)).await;
    }

    /// Synthesize the packet on the local network
    ///
    /// The hash is stamped before the send so the immediate local capture
    /// of our own injection is dropped as a duplicate. Send failures are
    /// counted, never propagated.
    pub async fn inject(&self, packet: &BroadcastPacket, scope: InjectScope) {
        let destination = match scope {
            InjectScope::Broadcast => self.broadcast_addr,
            InjectScope::Multicast(group) => group,
        };
        // the injected datagram leaves with our address as its source
        self.dedup
            .stamp(content_hash(&packet.payload, self.local_ip, packet.dest_port));

        match inject_datagram(&packet.payload, SocketAddrV4::new(destination, packet.dest_port))
            .await
        {
            Ok(()) => {
                self.metrics.injected.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    dest = %destination,
                    port = packet.dest_port,
                    len = packet.payload.len(),
                    "Injected packet"
                );
            }
            Err(e) => {
                self.metrics.inject_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(dest = %destination, port = packet.dest_port, error = %e, "Inject failed");
            }
        }
    }

    pub fn metrics(&self) -> &ForwardMetrics {
        &self.metrics
    }

    /// Ports currently registered (listening or not)
    pub fn monitored_ports(&self) -> Vec<u16> {
        self.registry.lock().expect("registry lock").ports()
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }

    /// Stop every listener and the cleanup task
    pub async fn shutdown(&self) {
        let handles: Vec<ListenerHandle> = {
            let mut listeners = self.listeners.lock().await;
            listeners.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.shutdown.send(true);
            let _ = handle.task.await;
        }
        if let Some(handle) = self.cleanup.lock().await.take() {
            let _ = handle.shutdown.send(true);
            let _ = handle.task.await;
        }
    }

    fn spawn_listener(&self, port: u16, socket: UdpSocket) -> ListenerHandle {
        let dedup = self.dedup.clone();
        let metrics = self.metrics.clone();
        let peers = self.peers.clone();
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    result = socket.recv_from(&mut buf) => {
                        let (len, from) = match result {
                            Ok(received) => received,
                            Err(e) => {
                                tracing::warn!(port, error = %e, "Listener receive failed");
                                continue;
                            }
                        };
                        let SocketAddr::V4(source) = from else { continue };
                        if len > MAX_FRAME_PAYLOAD {
                            tracing::trace!(port, len, "Oversized capture dropped");
                            continue;
                        }

                        metrics.total.fetch_add(1, Ordering::Relaxed);
                        let payload = buf[..len].to_vec();
                        let hash = content_hash(&payload, *source.ip(), port);
                        if !dedup.check_and_insert(hash) {
                            metrics.deduped.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        metrics.forwarded.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(
                            port,
                            source = %source,
                            hash = %hex::encode(&hash[..8]),
                            "Forwarding captured packet"
                        );

                        let packet = BroadcastPacket {
                            payload,
                            source,
                            dest_port: port,
                            received_at: Instant::now(),
                        };
                        let senders = peers.read().expect("peers lock");
                        for (peer_id, sender) in senders.iter() {
                            match sender.try_send(packet.clone()) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    metrics.backpressure_drops.fetch_add(1, Ordering::Relaxed);
                                    tracing::debug!(port, peer_id, "Peer queue full, packet dropped");
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {}
                            }
                        }
                    }
                }
            }
        });

        ListenerHandle { shutdown, task }
    }
}

/// Bind a capture socket with address reuse and broadcast enabled,
/// joining the well-known multicast group for mDNS/SSDP ports
fn bind_capture_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;

    if let InjectScope::Multicast(group) = scope_for_port(port) {
        if let Err(e) = socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
            tracing::warn!(port, %group, error = %e, "Multicast join failed");
        }
    }

    UdpSocket::from_std(socket.into())
}

async fn inject_datagram(payload: &[u8], destination: SocketAddrV4) -> std::io::Result<()> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    let socket = UdpSocket::from_std(socket.into())?;
    socket.send_to(payload, SocketAddr::V4(destination)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn test_settings(capacity: usize) -> Settings {
        let mut settings = Settings::default();
        settings.broadcast.channel_capacity = capacity;
        settings
    }

    fn forwarder(dir: &std::path::Path, capacity: usize) -> BroadcastForwarder {
        BroadcastForwarder::new(
            &test_settings(capacity),
            dir.join(ports::WHITELIST_FILE),
            Ipv4Addr::LOCALHOST,
            // loopback stands in for the directed broadcast in tests
            Ipv4Addr::LOCALHOST,
        )
    }

    async fn free_port() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap().port()
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = encode_frame(7777, Ipv4Addr::new(10, 66, 0, 3), b"announce");
        let (port, source_ip, payload) = decode_frame(&frame).unwrap();
        assert_eq!(port, 7777);
        assert_eq!(source_ip, Ipv4Addr::new(10, 66, 0, 3));
        assert_eq!(payload, b"announce");
    }

    #[test]
    fn test_truncated_frame_rejected() {
        assert!(decode_frame(&[0x1e, 0x61, 10, 66, 0]).is_none());
        assert!(decode_frame(&[]).is_none());
        // header-only frame is a valid empty payload
        let frame = encode_frame(1, Ipv4Addr::LOCALHOST, b"");
        let (_, _, payload) = decode_frame(&frame).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_scope_for_well_known_ports() {
        assert_eq!(scope_for_port(MDNS_PORT), InjectScope::Multicast(MDNS_GROUP));
        assert_eq!(scope_for_port(SSDP_PORT), InjectScope::Multicast(SSDP_GROUP));
        assert_eq!(scope_for_port(7777), InjectScope::Broadcast);
    }

    #[tokio::test]
    async fn test_capture_fans_out_to_all_peers() {
        let dir = tempdir().unwrap();
        let fwd = forwarder(dir.path(), 16);
        let port = free_port().await;
        fwd.add_port(port, "test").await;

        let mut rx_b = fwd.register_peer("peer-b");
        let mut rx_c = fwd.register_peer("peer-c");

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"game-announce", ("127.0.0.1", port)).await.unwrap();

        let got_b = timeout(Duration::from_secs(2), rx_b.recv()).await.unwrap().unwrap();
        let got_c = timeout(Duration::from_secs(2), rx_c.recv()).await.unwrap().unwrap();
        assert_eq!(got_b.payload, b"game-announce");
        assert_eq!(got_b.dest_port, port);
        assert_eq!(got_c.payload, b"game-announce");

        fwd.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_within_window_not_forwarded() {
        let dir = tempdir().unwrap();
        let fwd = forwarder(dir.path(), 16);
        let port = free_port().await;
        fwd.add_port(port, "test").await;
        let mut rx = fwd.register_peer("peer-b");

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"announce", ("127.0.0.1", port)).await.unwrap();
        client.send_to(b"announce", ("127.0.0.1", port)).await.unwrap();

        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.payload, b"announce");
        // the duplicate was eaten
        assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
        assert_eq!(fwd.metrics().deduped.load(Ordering::Relaxed), 1);

        fwd.shutdown().await;
    }

    #[tokio::test]
    async fn test_sender_nat_rebind_still_dedups() {
        let dir = tempdir().unwrap();
        let fwd = forwarder(dir.path(), 16);
        let port = free_port().await;
        fwd.add_port(port, "test").await;
        let mut rx = fwd.register_peer("peer-b");

        // same payload from two different source ports
        let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_a.send_to(b"announce", ("127.0.0.1", port)).await.unwrap();
        client_b.send_to(b"announce", ("127.0.0.1", port)).await.unwrap();

        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());

        fwd.shutdown().await;
    }

    #[tokio::test]
    async fn test_backpressure_drops_for_slow_peer_only() {
        let dir = tempdir().unwrap();
        let fwd = forwarder(dir.path(), 1);
        let port = free_port().await;
        fwd.add_port(port, "test").await;
        let _rx_slow = fwd.register_peer("slow");

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for i in 0..4u8 {
            client.send_to(&[b'p', i], ("127.0.0.1", port)).await.unwrap();
        }

        // wait for the listener to chew through the burst
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(fwd.metrics().backpressure_drops.load(Ordering::Relaxed) >= 1);

        fwd.shutdown().await;
    }

    #[tokio::test]
    async fn test_injected_packet_not_recaptured() {
        let dir = tempdir().unwrap();
        let fwd = forwarder(dir.path(), 16);
        let port = free_port().await;
        fwd.add_port(port, "test").await;
        let mut rx = fwd.register_peer("peer-b");

        // a packet that arrived from a tunneled peer gets re-injected; the
        // local capture of our own send must not bounce back to the party
        fwd.inject_remote(port, Ipv4Addr::new(10, 66, 0, 7), b"remote-announce").await;

        assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
        assert_eq!(fwd.metrics().injected.load(Ordering::Relaxed), 1);

        fwd.shutdown().await;
    }

    #[tokio::test]
    async fn test_unbindable_port_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let fwd = forwarder(dir.path(), 16);

        // hog a port without address reuse
        let hog = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = hog.local_addr().unwrap().port();

        fwd.add_port(port, "test").await;
        assert_eq!(fwd.listener_count().await, 0);
        // interest is still recorded
        assert_eq!(fwd.monitored_ports(), vec![port]);
    }

    #[tokio::test]
    async fn test_refcounted_release_stops_listener() {
        let dir = tempdir().unwrap();
        let fwd = forwarder(dir.path(), 16);
        let port = free_port().await;

        fwd.add_port(port, "game:terraria").await;
        fwd.add_port(port, USER_WHITELIST_OWNER).await;
        assert_eq!(fwd.listener_count().await, 1);

        fwd.release_owner("game:terraria").await;
        assert_eq!(fwd.listener_count().await, 1);

        fwd.release_owner(USER_WHITELIST_OWNER).await;
        assert_eq!(fwd.listener_count().await, 0);
    }

    #[tokio::test]
    async fn test_start_loads_whitelist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(ports::WHITELIST_FILE);
        let port = free_port().await;
        ports::save_whitelist(&path, &[port]).unwrap();

        let fwd = forwarder(dir.path(), 16);
        fwd.start().await.unwrap();
        assert_eq!(fwd.whitelist(), vec![port]);
        assert_eq!(fwd.monitored_ports(), vec![port]);

        fwd.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_peer_stops_receiving() {
        let dir = tempdir().unwrap();
        let fwd = forwarder(dir.path(), 16);
        let port = free_port().await;
        fwd.add_port(port, "test").await;

        let mut rx = fwd.register_peer("peer-b");
        fwd.unregister_peer("peer-b");

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"late", ("127.0.0.1", port)).await.unwrap();

        // sender side is gone, the channel just closes
        assert!(timeout(Duration::from_millis(300), rx.recv())
            .await
            .map(|msg| msg.is_none())
            .unwrap_or(true));

        fwd.shutdown().await;
    }

    #[tokio::test]
    async fn test_activate_profile_adds_its_ports() {
        let dir = tempdir().unwrap();
        let fwd = forwarder(dir.path(), 16);

        assert!(fwd.activate_profile("valheim").await);
        assert_eq!(fwd.monitored_ports(), vec![2456, 2457]);

        fwd.deactivate_profile("valheim").await;
        assert!(fwd.monitored_ports().is_empty());

        assert!(!fwd.activate_profile("not-a-game").await);
    }
}
