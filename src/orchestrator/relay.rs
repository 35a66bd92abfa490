//! Relay probing and selection
//!
//! Relays are probed with ICMP under a short per-relay budget and the
//! lowest-latency reachable one wins. ICMP being blocked on a relay does
//! not disqualify it: when every measurement fails the first listed relay
//! is used as published.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::control::RelayInfo;
use crate::wg::WireGuardController;

/// A relay picked for a peer, with its probed round trip when available
#[derive(Debug, Clone)]
pub struct RelayChoice {
    pub relay: RelayInfo,
    pub rtt: Option<Duration>,
}

/// Pick the best relay, optionally excluding the one already in use
///
/// Returns `None` only for an empty candidate list. Probing is done one
/// relay at a time; the per-relay budget keeps the total bounded.
pub async fn best_relay(
    wg: &Arc<WireGuardController>,
    relays: &[RelayInfo],
    probe_timeout: Duration,
    exclude: Option<SocketAddr>,
) -> Option<RelayChoice> {
    let candidates: Vec<&RelayInfo> = relays
        .iter()
        .filter(|relay| Some(relay.endpoint()) != exclude)
        .collect();
    // a single relay stays in play even when it is the current one
    let candidates = if candidates.is_empty() {
        relays.iter().collect()
    } else {
        candidates
    };
    let first = *candidates.first()?;

    let mut best: Option<RelayChoice> = None;
    for relay in candidates {
        let rtt = wg.probe_rtt(relay.public_ip, probe_timeout).await;
        tracing::debug!(relay = %relay.endpoint(), ?rtt, "Relay probe");
        let Some(rtt) = rtt else { continue };
        let better = match &best {
            None => true,
            Some(current) => current.rtt.map(|c| rtt < c).unwrap_or(true),
        };
        if better {
            best = Some(RelayChoice {
                relay: relay.clone(),
                rtt: Some(rtt),
            });
        }
    }

    Some(best.unwrap_or(RelayChoice {
        relay: first.clone(),
        rtt: None,
    }))
}
