//! Node Manager loop.
//!
//! Keeps the node directory useful: tops it up from a random peer when it
//! runs low, probes a few non-peer nodes each round and drops the ones that
//! keep failing, and pings quiet peers so dead connections get noticed.

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::network::address::NetAddress;
use crate::network::gossip::request_nodes;
use crate::network::message::RpcId;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of one node manager round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NodeSweep {
    /// Nodes learned through the top-up request
    pub learned: usize,
    pub probed: usize,
    pub removed: Vec<NetAddress>,
    /// Peers dropped after an unanswered ping
    pub dropped_peers: usize,
}

pub async fn run(gateway: Arc<Gateway>, token: CancellationToken) {
    let period = gateway.settings().node_manager_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    sweep = gateway.maintain_nodes() => {
                        if !sweep.removed.is_empty() || sweep.learned > 0 {
                            debug!(
                                "Node sweep: {} learned, {} probed, {} removed",
                                sweep.learned,
                                sweep.probed,
                                sweep.removed.len()
                            );
                        }
                    }
                }
            }
        }
    }
    debug!("Node manager stopped");
}

impl Gateway {
    /// One node manager round.
    pub async fn maintain_nodes(self: &Arc<Self>) -> NodeSweep {
        let mut sweep = NodeSweep::default();
        let settings = self.settings();

        if self.node_count() < settings.min_node_threshold {
            match self.random_peer() {
                Ok(peer) => match request_nodes(self, &peer).await {
                    Ok(added) => sweep.learned = added,
                    Err(e) => debug!("Node top-up from {} failed: {}", peer.addr(), e),
                },
                Err(GatewayError::NoPeers) => {
                    debug!("Node directory below threshold and no peers to ask")
                }
                Err(e) => debug!("Node top-up skipped: {}", e),
            }
        }

        let batch = {
            let state = self.state.read();
            state
                .nodes
                .sample(settings.probe_batch, |addr| state.peers.contains_key(addr))
        };
        for addr in batch {
            if !self.is_running() {
                return sweep;
            }
            sweep.probed += 1;
            match self.probe(&addr).await {
                Ok(()) => self.state.write().nodes.record_probe_success(&addr),
                Err(GatewayError::SelfConnect(_)) => {
                    info!("Node {} is this gateway, removing", addr);
                    self.remove_node(&addr);
                    sweep.removed.push(addr);
                }
                Err(e) => {
                    let failures = self.state.write().nodes.record_probe_failure(&addr);
                    debug!("Probe of {} failed ({:?} in a row): {}", addr, failures, e);
                    if failures.unwrap_or(0) >= settings.max_probe_failures {
                        info!("Removing unreachable node {}", addr);
                        self.remove_node(&addr);
                        sweep.removed.push(addr);
                    }
                }
            }
        }

        sweep.dropped_peers = self.ping_quiet_peers().await;
        sweep
    }

    /// Ping peers we have not heard from for a full node manager interval;
    /// disconnect the ones that do not answer.
    async fn ping_quiet_peers(&self) -> usize {
        let quiet_after = self.settings().node_manager_interval.as_secs() as i64;
        let now = chrono::Utc::now().timestamp();
        let quiet: Vec<_> = self
            .state
            .read()
            .peers
            .values()
            .filter(|p| now - p.info().last_seen >= quiet_after)
            .cloned()
            .collect();

        let mut dropped = 0;
        for peer in quiet {
            let result: Result<(), GatewayError> =
                self.call_peer(&peer, RpcId::Ping, &()).await;
            match result {
                Ok(()) => {}
                Err(e @ GatewayError::Unreachable { .. }) | Err(e @ GatewayError::ConnectionClosed) => {
                    debug!("Ping to {} failed: {}", peer.addr(), e);
                    if self.disconnect(peer.addr()) {
                        dropped += 1;
                    }
                }
                Err(e) => debug!("Ping to {} answered with an error: {}", peer.addr(), e),
            }
        }
        dropped
    }
}
