//! Content-hash deduplication for broadcast forwarding
//!
//! Identity of a packet is `SHA-256(payload || source_ip || dest_port)`.
//! The source port is deliberately left out: a sender whose NAT rebinds
//! between retransmissions would otherwise defeat dedup.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Dedup identity of one packet
pub type ContentHash = [u8; 32];

pub fn content_hash(payload: &[u8], source_ip: Ipv4Addr, dest_port: u16) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(source_ip.octets());
    hasher.update(dest_port.to_be_bytes());
    hasher.finalize().into()
}

/// Time-windowed set of recently seen packet hashes
pub struct DedupCache {
    window: Duration,
    entries: Mutex<HashMap<ContentHash, Instant>>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        DedupCache {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record the hash and report whether it was fresh
    ///
    /// An entry seen strictly less than `window` ago is a duplicate; one
    /// exactly `window` old has expired and counts as fresh again.
    pub fn check_and_insert(&self, hash: ContentHash) -> bool {
        self.check_and_insert_at(hash, Instant::now())
    }

    pub(crate) fn check_and_insert_at(&self, hash: ContentHash, now: Instant) -> bool {
        let mut entries = self.entries.lock().expect("dedup lock");
        if let Some(first_seen) = entries.get(&hash) {
            if now.duration_since(*first_seen) < self.window {
                return false;
            }
        }
        entries.insert(hash, now);
        true
    }

    /// Pre-mark a hash so the next local capture of it is dropped
    ///
    /// Used by the injector: stamping happens before the send, closing the
    /// race against the capture path.
    pub fn stamp(&self, hash: ContentHash) {
        self.entries
            .lock()
            .expect("dedup lock")
            .insert(hash, Instant::now());
    }

    /// Drop entries older than the window
    pub fn prune(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("dedup lock")
            .retain(|_, first_seen| now.duration_since(*first_seen) < self.window);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("dedup lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Forwarding counters, shared across listeners and the injector
#[derive(Default)]
pub struct ForwardMetrics {
    pub total: AtomicU64,
    pub forwarded: AtomicU64,
    pub deduped: AtomicU64,
    /// Packets dropped because a peer's forward queue was full
    pub backpressure_drops: AtomicU64,
    pub injected: AtomicU64,
    pub inject_failures: AtomicU64,
}

impl ForwardMetrics {
    /// Fraction of observed packets that were duplicates
    pub fn dedup_rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.deduped.load(Ordering::Relaxed) as f64 / total as f64
    }
}
