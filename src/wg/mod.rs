//! WireGuard data-plane management
//!
//! Owns the single overlay interface for the process lifetime and exposes
//! an abstract peer table. All mutations serialize on one lock; latency
//! probes run outside it so probes for distinct peers can overlap.
//!
//! The `Backend` trait is the platform seam: production uses subprocess
//! tooling (`ip`/`wg`/`wireguard-go`), tests swap in a recording mock.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::sync::Mutex;

use crate::error::{ConfigError, PlatformError};
use crate::keys::KeyPair;
use crate::settings::Settings;

pub mod platform;
pub mod probe;

/// One entry of the abstract peer table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer public key, base64 interchange form
    pub public_key: String,
    /// Outer UDP destination: the peer itself or a relay
    pub endpoint: SocketAddr,
    /// Exactly the peer's virtual /32 in this system
    pub allowed_ips: Vec<Ipv4Net>,
    /// Seconds; must be non-zero for peers behind NAT
    pub persistent_keepalive: u16,
}

impl PeerConfig {
    fn allowed_ips_arg(&self) -> String {
        self.allowed_ips
            .iter()
            .map(|net| net.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Platform operations the controller is built on
#[async_trait]
pub trait Backend: Send + Sync {
    /// Verify tooling and privileges before touching the system
    async fn prepare(&self) -> Result<(), PlatformError>;
    async fn create_interface(
        &self,
        name: &str,
        address: Ipv4Addr,
        prefix_len: u8,
        mtu: u16,
    ) -> Result<(), PlatformError>;
    async fn configure_device(
        &self,
        name: &str,
        private_key_file: &std::path::Path,
        listen_port: u16,
    ) -> Result<(), PlatformError>;
    async fn apply_peer(&self, name: &str, peer: &PeerConfig) -> Result<(), PlatformError>;
    async fn update_endpoint(
        &self,
        name: &str,
        public_key: &str,
        endpoint: SocketAddr,
    ) -> Result<(), PlatformError>;
    async fn remove_peer(&self, name: &str, public_key: &str) -> Result<(), PlatformError>;
    async fn destroy_interface(&self, name: &str) -> Result<(), PlatformError>;
    /// One ICMP echo round trip; `None` is "no measurement", never an error
    async fn measure_rtt(&self, target: Ipv4Addr, timeout: Duration) -> Option<Duration>;
}

/// Production backend: subprocess tooling plus a shared ICMP socket
pub struct SystemBackend {
    icmp: probe::IcmpProbe,
}

impl SystemBackend {
    pub fn new() -> Self {
        SystemBackend {
            icmp: probe::IcmpProbe::new(),
        }
    }
}

impl Default for SystemBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for SystemBackend {
    async fn prepare(&self) -> Result<(), PlatformError> {
        platform::check_privileges()?;
        platform::check_available().await
    }

    async fn create_interface(
        &self,
        name: &str,
        address: Ipv4Addr,
        prefix_len: u8,
        mtu: u16,
    ) -> Result<(), PlatformError> {
        platform::create_interface(name, address, prefix_len, mtu).await
    }

    async fn configure_device(
        &self,
        name: &str,
        private_key_file: &std::path::Path,
        listen_port: u16,
    ) -> Result<(), PlatformError> {
        platform::configure_device(name, private_key_file, listen_port).await
    }

    async fn apply_peer(&self, name: &str, peer: &PeerConfig) -> Result<(), PlatformError> {
        platform::apply_peer(
            name,
            &peer.public_key,
            peer.endpoint,
            &peer.allowed_ips_arg(),
            peer.persistent_keepalive,
        )
        .await
    }

    async fn update_endpoint(
        &self,
        name: &str,
        public_key: &str,
        endpoint: SocketAddr,
    ) -> Result<(), PlatformError> {
        platform::update_endpoint(name, public_key, endpoint).await
    }

    async fn remove_peer(&self, name: &str, public_key: &str) -> Result<(), PlatformError> {
        platform::remove_peer(name, public_key).await
    }

    async fn destroy_interface(&self, name: &str) -> Result<(), PlatformError> {
        platform::destroy_interface(name).await
    }

    async fn measure_rtt(&self, target: Ipv4Addr, timeout: Duration) -> Option<Duration> {
        self.icmp.rtt(IpAddr::V4(target), timeout).await
    }
}

struct Inner {
    initialized: bool,
    peers: HashMap<String, PeerConfig>,
}

/// The overlay interface controller
pub struct WireGuardController {
    backend: Arc<dyn Backend>,
    keypair: KeyPair,
    keys_dir: PathBuf,
    interface: String,
    prefix_len: u8,
    mtu: u16,
    listen_port: u16,
    latency_timeout: Duration,
    latency_samples: u32,
    inner: Mutex<Inner>,
}

impl WireGuardController {
    /// Load or create the host keypair and set up an uninitialized
    /// controller; no platform state is touched until `initialize`
    pub fn new(
        settings: &Settings,
        keys_dir: PathBuf,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, ConfigError> {
        let keypair = KeyPair::load_or_generate(&keys_dir)?;
        Ok(WireGuardController {
            backend,
            keypair,
            keys_dir,
            interface: settings.network.interface.clone(),
            prefix_len: settings.network.base_subnet.prefix_len(),
            mtu: settings.network.mtu,
            listen_port: settings.network.listen_port,
            latency_timeout: settings.latency_probe_timeout(),
            latency_samples: settings.monitor.latency_samples,
            inner: Mutex::new(Inner {
                initialized: false,
                peers: HashMap::new(),
            }),
        })
    }

    /// The host's public key, base64 interchange form
    pub fn public_key(&self) -> String {
        self.keypair.public_base64()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.keypair.public_bytes()
    }

    /// Bring the overlay interface up with the host's virtual IP
    pub async fn initialize(&self, host_ip: Ipv4Addr) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().await;
        if inner.initialized {
            return Ok(());
        }

        self.backend.prepare().await?;
        self.backend
            .create_interface(&self.interface, host_ip, self.prefix_len, self.mtu)
            .await?;

        let key_file = crate::keys::write_private_key_for_wg(&self.keys_dir, &self.keypair)?;
        self.backend
            .configure_device(&self.interface, &key_file, self.listen_port)
            .await?;

        inner.initialized = true;
        tracing::info!(
            interface = %self.interface,
            host_ip = %host_ip,
            mtu = self.mtu,
            listen_port = self.listen_port,
            "Overlay interface up"
        );
        Ok(())
    }

    /// Upsert a peer
    ///
    /// A failed apply leaves no table entry behind. Updating an existing
    /// key replaces endpoint and keepalive in place; the WireGuard session
    /// survives because the key is unchanged.
    pub async fn add_peer(&self, peer: PeerConfig) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().await;
        self.backend.apply_peer(&self.interface, &peer).await?;
        tracing::debug!(
            public_key = %peer.public_key,
            endpoint = %peer.endpoint,
            allowed_ips = %peer.allowed_ips_arg(),
            "Peer applied"
        );
        inner.peers.insert(peer.public_key.clone(), peer);
        Ok(())
    }

    /// Remove a peer; unknown keys are a no-op
    pub async fn remove_peer(&self, public_key: &str) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().await;
        if inner.peers.remove(public_key).is_none() {
            return Ok(());
        }
        self.backend.remove_peer(&self.interface, public_key).await?;
        tracing::debug!(public_key, "Peer removed");
        Ok(())
    }

    /// Swap a peer's outer endpoint in place, preserving the session
    pub async fn update_endpoint(
        &self,
        public_key: &str,
        endpoint: SocketAddr,
    ) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.peers.get_mut(public_key) else {
            tracing::warn!(public_key, "Endpoint update for unknown peer ignored");
            return Ok(());
        };
        self.backend
            .update_endpoint(&self.interface, public_key, endpoint)
            .await?;
        entry.endpoint = endpoint;
        tracing::debug!(public_key, %endpoint, "Peer endpoint updated");
        Ok(())
    }

    /// Median echo round trip to an overlay address, in milliseconds
    ///
    /// Intentionally lock-free so probes for distinct peers can run
    /// concurrently with each other and with table mutations.
    pub async fn measure_latency(&self, virtual_ip: Ipv4Addr) -> Option<u64> {
        let mut samples = Vec::with_capacity(self.latency_samples as usize);
        for _ in 0..self.latency_samples {
            if let Some(rtt) = self.backend.measure_rtt(virtual_ip, self.latency_timeout).await {
                samples.push(rtt);
            }
        }
        probe::median(&mut samples).map(|rtt| rtt.as_millis() as u64)
    }

    /// One echo round trip to an arbitrary address (relay probing)
    pub async fn probe_rtt(&self, target: Ipv4Addr, timeout: Duration) -> Option<Duration> {
        self.backend.measure_rtt(target, timeout).await
    }

    /// Remove every peer and destroy the interface. Idempotent.
    pub async fn teardown(&self) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().await;
        if !inner.initialized {
            inner.peers.clear();
            return Ok(());
        }
        for public_key in inner.peers.keys() {
            if let Err(e) = self.backend.remove_peer(&self.interface, public_key).await {
                tracing::warn!(public_key, error = %e, "Peer removal during teardown failed");
            }
        }
        inner.peers.clear();
        self.backend.destroy_interface(&self.interface).await?;
        inner.initialized = false;
        tracing::info!(interface = %self.interface, "Overlay interface destroyed");
        Ok(())
    }

    /// Snapshot of the peer table
    pub async fn peers(&self) -> Vec<PeerConfig> {
        self.inner.lock().await.peers.values().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.lock().await.peers.len()
    }
}
