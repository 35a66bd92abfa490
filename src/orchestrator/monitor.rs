//! Per-peer health monitoring
//!
//! One task per peer owns that peer's connection state outright. Every
//! tick it probes tunnel latency and feeds the result into the state
//! machine; readers see the outcome through a watch channel. Errors from
//! lower layers become transitions here, never panics.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

use crate::error::ConnectError;
use crate::nat::PeerNatInfo;
use crate::peer::{ConnectionState, ConnectionType};

use super::{relay, MonitorCommand, OrchestratorEvent, PeerSnapshot, Shared};

/// Immutable facts about the monitored peer
pub(crate) struct PeerContext {
    pub peer_id: String,
    pub public_key: String,
    pub virtual_ip: Ipv4Addr,
    pub peer_nat: PeerNatInfo,
    pub initial_endpoint: SocketAddr,
    pub initial_strategy: ConnectionType,
    pub initial_latency: Option<u64>,
}

/// Mutable per-peer machine state, owned by the monitor task
struct Machine {
    state: ConnectionState,
    strategy: ConnectionType,
    endpoint: SocketAddr,
    latency: Option<u64>,
    since: SystemTime,
    /// Consecutive failed probes since the last success or reconnect
    fail_count: u32,
    /// Consecutive probes above the degraded threshold
    degraded_strikes: u32,
    /// Reconnects burned since the last time the peer was healthy
    reconnect_attempts: u32,
}

impl Machine {
    fn new(ctx: &PeerContext) -> Self {
        Machine {
            state: ConnectionState::Connected,
            strategy: ctx.initial_strategy,
            endpoint: ctx.initial_endpoint,
            latency: ctx.initial_latency,
            since: SystemTime::now(),
            fail_count: 0,
            degraded_strikes: 0,
            reconnect_attempts: 0,
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.since = SystemTime::now();
        }
    }

    fn snapshot(&self, ctx: &PeerContext) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: ctx.peer_id.clone(),
            virtual_ip: ctx.virtual_ip,
            endpoint: self.endpoint,
            strategy: self.strategy,
            last_latency_ms: self.latency,
            state: self.state,
            since: self.since,
        }
    }
}

enum TickResult {
    Alive,
    BudgetExhausted,
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    ctx: PeerContext,
    mut commands: mpsc::Receiver<MonitorCommand>,
    snapshot: watch::Sender<PeerSnapshot>,
) {
    let mut machine = Machine::new(&ctx);

    'lifecycle: loop {
        // healthy phase: probe on every tick until the budget runs out
        let mut ticker = interval_at(
            Instant::now() + shared.timing.monitor_interval,
            shared.timing.monitor_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(MonitorCommand::Reconnect) => {
                        machine.reconnect_attempts = 0;
                        machine.fail_count = 0;
                    }
                    Some(MonitorCommand::Shutdown) | None => return,
                },
                _ = ticker.tick() => {
                    match tick(&shared, &ctx, &mut machine).await {
                        TickResult::Alive => {
                            let _ = snapshot.send(machine.snapshot(&ctx));
                        }
                        TickResult::BudgetExhausted => {
                            let _ = snapshot.send(machine.snapshot(&ctx));
                            break;
                        }
                    }
                }
            }
        }

        // grace phase: a failed peer lingers so an explicit reconnect can
        // revive it; silence for the whole window reclaims everything
        tracing::warn!(
            peer_id = %ctx.peer_id,
            grace = ?shared.timing.cleanup_grace,
            "Peer failed, holding for reconnect"
        );
        loop {
            tokio::select! {
                _ = sleep(shared.timing.cleanup_grace) => {
                    expire(&shared, &ctx).await;
                    return;
                }
                command = commands.recv() => match command {
                    Some(MonitorCommand::Reconnect) => {
                        machine.reconnect_attempts = 0;
                        machine.fail_count = 0;
                        machine.degraded_strikes = 0;
                        match reconnect(&shared, &ctx, &mut machine).await {
                            Ok(()) => {
                                machine.set_state(ConnectionState::Connecting);
                                let _ = snapshot.send(machine.snapshot(&ctx));
                                continue 'lifecycle;
                            }
                            Err(e) => {
                                tracing::warn!(peer_id = %ctx.peer_id, error = %e, "Requested reconnect failed");
                                // stay in the grace window
                            }
                        }
                    }
                    Some(MonitorCommand::Shutdown) | None => return,
                }
            }
        }
    }
}

async fn tick(shared: &Arc<Shared>, ctx: &PeerContext, machine: &mut Machine) -> TickResult {
    let latency = shared.wg.measure_latency(ctx.virtual_ip).await;
    machine.latency = latency;

    let probe_failed = match latency {
        None => true,
        Some(ms) => ms > shared.timing.failed_ms,
    };

    if probe_failed {
        machine.degraded_strikes = 0;
        machine.fail_count += 1;
        tracing::debug!(
            peer_id = %ctx.peer_id,
            latency_ms = ?latency,
            fail_count = machine.fail_count,
            "Probe failed"
        );
        if machine.fail_count < shared.timing.failure_strikes {
            return TickResult::Alive;
        }
        machine.fail_count = 0;

        if machine.reconnect_attempts >= shared.timing.max_reconnects {
            tracing::warn!(peer_id = %ctx.peer_id, "Reconnect budget exhausted");
            machine.set_state(ConnectionState::Failed);
            machine.strategy = ConnectionType::Failed;
            return TickResult::BudgetExhausted;
        }
        machine.reconnect_attempts += 1;
        match reconnect(shared, ctx, machine).await {
            Ok(()) => {
                tracing::info!(
                    peer_id = %ctx.peer_id,
                    attempt = machine.reconnect_attempts,
                    endpoint = %machine.endpoint,
                    strategy = %machine.strategy,
                    "Reconnected"
                );
                machine.set_state(ConnectionState::Connecting);
            }
            Err(e) => {
                // the attempt is spent; the next strikes trigger another
                tracing::warn!(peer_id = %ctx.peer_id, error = %e, "Reconnect attempt failed");
            }
        }
        return TickResult::Alive;
    }

    let ms = latency.expect("a non-failed probe has a value");
    machine.fail_count = 0;

    if ms > shared.timing.degraded_ms {
        machine.degraded_strikes += 1;
        if machine.degraded_strikes < 2 {
            return TickResult::Alive;
        }
        if machine.state != ConnectionState::Degraded {
            tracing::info!(peer_id = %ctx.peer_id, latency_ms = ms, "Connection degraded");
        }
        machine.set_state(ConnectionState::Degraded);
        if machine.strategy == ConnectionType::Relayed {
            try_relay_switch(shared, ctx, machine).await;
        }
    } else {
        machine.degraded_strikes = 0;
        machine.reconnect_attempts = 0;
        machine.set_state(ConnectionState::Connected);
    }
    TickResult::Alive
}

/// Re-run strategy selection and re-point the WireGuard entry
async fn reconnect(
    shared: &Arc<Shared>,
    ctx: &PeerContext,
    machine: &mut Machine,
) -> Result<(), ConnectError> {
    let (endpoint, strategy) = shared.select_endpoint(&ctx.peer_id, &ctx.peer_nat).await?;
    shared
        .wg
        .add_peer(shared.peer_wg_config(&ctx.public_key, endpoint, ctx.virtual_ip))
        .await?;
    machine.endpoint = endpoint;
    machine.strategy = strategy;
    Ok(())
}

/// Swap to a clearly better relay without touching the session
///
/// The swap is a bare endpoint update: key and allowed-ips stay as they
/// are and the reconnect budget is not charged.
async fn try_relay_switch(shared: &Arc<Shared>, ctx: &PeerContext, machine: &mut Machine) {
    let Some(current_ms) = machine.latency else { return };
    let relays = shared.fetch_relays().await;
    let Some(candidate) =
        relay::best_relay(&shared.wg, &relays, shared.timing.relay_probe_timeout, Some(machine.endpoint)).await
    else {
        return;
    };
    let Some(rtt) = candidate.rtt else { return };
    let candidate_endpoint = candidate.relay.endpoint();
    if candidate_endpoint == machine.endpoint {
        return;
    }

    let candidate_ms = rtt.as_millis() as u64;
    let required = current_ms as f64 * (1.0 - shared.timing.relay_improvement);
    if (candidate_ms as f64) >= required {
        tracing::debug!(
            peer_id = %ctx.peer_id,
            candidate = %candidate_endpoint,
            candidate_ms,
            current_ms,
            "Candidate relay not better enough, staying"
        );
        return;
    }

    match shared.wg.update_endpoint(&ctx.public_key, candidate_endpoint).await {
        Ok(()) => {
            tracing::info!(
                peer_id = %ctx.peer_id,
                from = %machine.endpoint,
                to = %candidate_endpoint,
                candidate_ms,
                current_ms,
                "Switched relay"
            );
            machine.endpoint = candidate_endpoint;
        }
        Err(e) => {
            tracing::warn!(peer_id = %ctx.peer_id, error = %e, "Relay switch failed");
        }
    }
}

/// Silent reclamation after the grace window: WireGuard entry, virtual
/// IP, and the orchestrator's handle all go away
async fn expire(shared: &Arc<Shared>, ctx: &PeerContext) {
    shared.peers.lock().await.remove(&ctx.peer_id);
    if let Err(e) = shared.wg.remove_peer(&ctx.public_key).await {
        tracing::warn!(peer_id = %ctx.peer_id, error = %e, "WireGuard cleanup failed");
    }
    shared.ipam.release(&ctx.peer_id);
    let _ = shared.events.send(OrchestratorEvent::PeerExpired {
        peer_id: ctx.peer_id.clone(),
    });
    tracing::info!(peer_id = %ctx.peer_id, "Failed peer reclaimed");
}
