//! Peer Manager loop.
//!
//! Every tick, work out how many outbound peers are missing and dial
//! candidates from the node directory until the gap is closed or the
//! candidates run out. A failed dial just moves on to the next candidate;
//! pruning dead nodes is the node manager's job.

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::network::address::NetAddress;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What one round of the loop should attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialPlan {
    pub deficit: usize,
    /// Dial order; already shuffled
    pub candidates: Vec<NetAddress>,
}

/// Pick dial candidates: known nodes that are neither peers nor ourselves.
pub fn plan_dials<F>(
    target: usize,
    outbound: usize,
    nodes: Vec<NetAddress>,
    is_peer: F,
    own: &NetAddress,
) -> DialPlan
where
    F: Fn(&NetAddress) -> bool,
{
    let deficit = target.saturating_sub(outbound);
    if deficit == 0 {
        return DialPlan {
            deficit,
            candidates: Vec::new(),
        };
    }

    let mut candidates: Vec<NetAddress> = nodes
        .into_iter()
        .filter(|addr| addr != own && !is_peer(addr))
        .collect();
    candidates.shuffle(&mut rand::thread_rng());
    DialPlan {
        deficit,
        candidates,
    }
}

pub async fn run(gateway: Arc<Gateway>, token: CancellationToken) {
    let period = gateway.settings().peer_manager_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    dialed = gateway.maintain_outbound() => {
                        if dialed > 0 {
                            debug!("Peer manager opened {} outbound connection(s)", dialed);
                        }
                    }
                }
            }
        }
    }
    debug!("Peer manager stopped");
}

impl Gateway {
    /// One peer manager round. Returns the number of new outbound peers.
    pub async fn maintain_outbound(self: &Arc<Self>) -> usize {
        let target = self.settings().target_outbound_peers;
        let plan = {
            let state = self.state.read();
            let outbound = state.peers.values().filter(|p| p.is_outbound()).count();
            plan_dials(
                target,
                outbound,
                state.nodes.addresses(),
                |addr| state.peers.contains_key(addr),
                &state.my_addr,
            )
        };
        if plan.deficit == 0 || plan.candidates.is_empty() {
            return 0;
        }
        debug!(
            "Need {} outbound peer(s), {} candidate(s)",
            plan.deficit,
            plan.candidates.len()
        );

        let mut connected = 0;
        for addr in plan.candidates {
            if !self.is_running() || self.outbound_count() >= target {
                break;
            }
            match self.connect(&addr).await {
                Ok(()) => connected += 1,
                Err(GatewayError::PeerLimitReached { limit }) => {
                    debug!("Peer limit {} reached, stopping dials", limit);
                    break;
                }
                Err(GatewayError::Closed) => break,
                Err(GatewayError::AlreadyConnected(_)) => {}
                Err(e @ GatewayError::SelfConnect(_)) | Err(e @ GatewayError::ProtocolViolation(_)) => {
                    info!("Dropping node {}: {}", addr, e);
                    self.remove_node(&addr);
                }
                Err(e) => debug!("Dial {} failed: {}", addr, e),
            }
        }
        connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr(i: u8) -> NetAddress {
        NetAddress::new(format!("203.0.113.{}", i), 9981).unwrap()
    }

    #[test]
    fn test_plan_skips_peers_and_self() {
        let own = addr(0);
        let nodes: Vec<NetAddress> = (0..=6).map(addr).collect();
        let peers: HashSet<NetAddress> = [addr(1), addr(2)].into_iter().collect();

        let plan = plan_dials(4, 0, nodes, |a| peers.contains(a), &own);
        assert_eq!(plan.deficit, 4);
        let got: HashSet<NetAddress> = plan.candidates.into_iter().collect();
        let want: HashSet<NetAddress> = (3..=6).map(addr).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_plan_at_target_is_empty() {
        let plan = plan_dials(4, 4, (1..=6).map(addr).collect(), |_| false, &addr(0));
        assert_eq!(plan.deficit, 0);
        assert!(plan.candidates.is_empty());

        let plan = plan_dials(4, 9, (1..=6).map(addr).collect(), |_| false, &addr(0));
        assert_eq!(plan.deficit, 0);
    }
}
