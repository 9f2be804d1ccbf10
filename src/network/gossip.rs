//! Node gossip: the `ShareNodes`, `RelayNode` and `Ping` procedures and the
//! connect call that pulls nodes from every new peer.

use crate::constants::gossip::MAX_MERGED_NODES;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::network::address::NetAddress;
use crate::network::message::{RemoteError, RpcId};
use crate::network::peer::Peer;
use crate::network::rpc::{
    decode_payload, encode_payload, ConnectCall, RpcHandler, RpcRegistry,
};
use std::sync::Arc;

/// Registry holding the gossip procedures every gateway serves.
pub(crate) fn builtin_registry() -> RpcRegistry {
    RpcRegistry::from_parts(
        [
            (RpcId::ShareNodes, Arc::new(ShareNodes) as Arc<dyn RpcHandler>),
            (RpcId::RelayNode, Arc::new(RelayNode) as Arc<dyn RpcHandler>),
            (RpcId::Ping, Arc::new(Ping) as Arc<dyn RpcHandler>),
        ],
        [(RpcId::ShareNodes, Arc::new(RequestNodes) as Arc<dyn ConnectCall>)],
    )
}

fn to_remote(e: GatewayError) -> RemoteError {
    RemoteError::new(e.to_string())
}

/// Answers with a random sample of known nodes, never including the caller.
pub struct ShareNodes;

#[async_trait::async_trait]
impl RpcHandler for ShareNodes {
    async fn handle(
        &self,
        gateway: &Arc<Gateway>,
        peer: &Arc<Peer>,
        _payload: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteError> {
        let cap = gateway.settings().share_nodes_cap;
        let sample = gateway
            .state
            .read()
            .nodes
            .sample(cap, |addr| addr == peer.addr());
        tracing::trace!("Sharing {} node(s) with {}", sample.len(), peer.addr());
        encode_payload(&sample).map_err(to_remote)
    }
}

/// Accepts a single pushed node; new nodes are passed on to other peers.
pub struct RelayNode;

#[async_trait::async_trait]
impl RpcHandler for RelayNode {
    async fn handle(
        &self,
        gateway: &Arc<Gateway>,
        peer: &Arc<Peer>,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteError> {
        let addr: NetAddress = decode_payload(&payload).map_err(to_remote)?;
        if !gateway.accepts_relayed(&addr) {
            return Err(RemoteError::new(format!("unroutable address {}", addr)));
        }

        if gateway.add_node(addr.clone()) {
            tracing::debug!("📨 Learned node {} from {}", addr, peer.addr());
            let gateway = gateway.clone();
            let source = peer.addr().clone();
            tokio::spawn(async move {
                gateway.relay_node(addr, &[source]).await;
            });
        }
        encode_payload(&()).map_err(to_remote)
    }
}

pub struct Ping;

#[async_trait::async_trait]
impl RpcHandler for Ping {
    async fn handle(
        &self,
        _gateway: &Arc<Gateway>,
        _peer: &Arc<Peer>,
        _payload: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteError> {
        encode_payload(&()).map_err(to_remote)
    }
}

/// Connect call: ask the new peer for nodes and merge them.
pub struct RequestNodes;

#[async_trait::async_trait]
impl ConnectCall for RequestNodes {
    async fn on_connect(
        &self,
        gateway: &Arc<Gateway>,
        peer: &Arc<Peer>,
    ) -> Result<(), GatewayError> {
        request_nodes(gateway, peer).await.map(|_| ())
    }
}

/// Call `ShareNodes` on `peer` and add what comes back. Returns how many
/// nodes were new.
pub async fn request_nodes(gateway: &Gateway, peer: &Peer) -> Result<usize, GatewayError> {
    let nodes: Vec<NetAddress> = gateway.call_peer(peer, RpcId::ShareNodes, &()).await?;
    let received = nodes.len();

    let added = nodes
        .into_iter()
        .take(MAX_MERGED_NODES)
        .filter(|addr| gateway.accepts_relayed(addr))
        .filter(|addr| gateway.add_node(addr.clone()))
        .count();

    tracing::debug!(
        "🔍 {} shared {} node(s), {} new",
        peer.addr(),
        received,
        added
    );
    Ok(added)
}
