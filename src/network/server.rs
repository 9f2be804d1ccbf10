//! Inbound side of the peer connection manager: the accept loop and the
//! acceptor half of the handshake.

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::network::address::NetAddress;
use crate::network::handshake;
use crate::network::message::{ConnectIntent, RejectReason, RpcId};
use crate::network::peer::{ConnectionDirection, Peer};
use crate::network::rpc::encode_payload;
use crate::network::session;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::peers::OUTBOUND_QUEUE;

impl Gateway {
    /// Accept connections until shutdown. The listener is dropped (and the
    /// port closed) when this returns.
    pub(crate) async fn accept_loop(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let gateway = self.clone();
                        tokio::spawn(async move {
                            gateway.handle_inbound(stream, remote).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                        }
                    }
                },
            }
        }
        tracing::debug!("Accept loop on {} stopped", self.address());
    }

    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream, remote: SocketAddr) {
        let timeout = self.settings().handshake_timeout;
        let theirs = match tokio::time::timeout(timeout, handshake::receive(&mut stream)).await {
            Ok(Ok(theirs)) => theirs,
            Ok(Err(e)) => {
                tracing::debug!("🚫 Handshake from {} failed: {}", remote, e);
                return;
            }
            Err(_) => {
                tracing::debug!("🚫 Handshake from {} timed out", remote);
                return;
            }
        };

        if let Err(e) = handshake::check_version(&theirs) {
            tracing::debug!("🚫 Rejecting {}: {}", remote, e);
            let _ = tokio::time::timeout(
                timeout,
                handshake::reject(&mut stream, RejectReason::IncompatibleVersion),
            )
            .await;
            return;
        }
        if theirs.node_id == self.node_id() {
            let _ = tokio::time::timeout(
                timeout,
                handshake::reject(&mut stream, RejectReason::SelfConnect),
            )
            .await;
            return;
        }

        let ours = self.handshake(ConnectIntent::Peer);
        if theirs.intent == ConnectIntent::Probe {
            match tokio::time::timeout(timeout, handshake::accept(&mut stream, &ours)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::trace!("Probe reply to {} failed: {}", remote, e),
                Err(_) => tracing::trace!("Probe reply to {} timed out", remote),
            }
            return;
        }

        // Trust the socket for the host, the handshake for the port.
        let addr = match NetAddress::new(remote.ip().to_string(), theirs.listen_addr.port()) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::debug!("🚫 Unusable address for {}: {}", remote, e);
                return;
            }
        };

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let peer = Arc::new(Peer::new(
            addr.clone(),
            ConnectionDirection::Inbound,
            theirs.protocol_version,
            tx,
            self.child_token(),
        ));
        if let Err(e) = self.admit_peer(&peer) {
            tracing::debug!("🚫 Rejecting inbound {}: {}", addr, e);
            let reason = match e {
                GatewayError::SelfConnect(_) => Some(RejectReason::SelfConnect),
                GatewayError::AlreadyConnected(_) => Some(RejectReason::AlreadyConnected),
                GatewayError::PeerLimitReached { .. } => Some(RejectReason::PeerLimitReached),
                _ => None,
            };
            if let Some(reason) = reason {
                let _ = tokio::time::timeout(timeout, handshake::reject(&mut stream, reason)).await;
            }
            return;
        }

        match tokio::time::timeout(timeout, handshake::accept(&mut stream, &ours)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("Handshake reply to {} failed: {}", addr, e);
                self.forget_peer(&peer);
                return;
            }
            Err(_) => {
                tracing::debug!("Handshake reply to {} timed out", addr);
                self.forget_peer(&peer);
                return;
            }
        }

        // Must happen before the session starts dispatching this peer's calls.
        let is_new = self.accepts_relayed(&addr) && self.add_node(addr.clone());

        tokio::spawn(session::run(self.clone(), peer.clone(), stream, rx));
        tracing::info!("🔗 Accepted peer {} (inbound)", addr);

        self.run_connect_calls(&peer).await;

        if is_new && !peer.is_closed() {
            self.relay_node(addr, &[]).await;
        }
    }

    /// Tell every other peer about a node we just learned of. `addr` itself
    /// is never sent its own address.
    pub(crate) async fn relay_node(&self, addr: NetAddress, also_skip: &[NetAddress]) {
        let payload = match encode_payload(&addr) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Cannot relay {}: {}", addr, e);
                return;
            }
        };
        let mut exclude = also_skip.to_vec();
        exclude.push(addr.clone());
        let delivered = self.broadcast(RpcId::RelayNode, payload, &exclude).await;
        tracing::debug!("📢 Relayed {} to {} peer(s)", addr, delivered);
    }
}
