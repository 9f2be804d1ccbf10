//! Outbound side of the peer connection manager: dialing, admitting a
//! handshaken connection as a peer, liveness probes and disconnects.

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::network::address::NetAddress;
use crate::network::handshake;
use crate::network::message::{ConnectIntent, Handshake};
use crate::network::peer::{ConnectionDirection, Peer};
use crate::network::session;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::constants::peers::OUTBOUND_QUEUE;

impl Gateway {
    /// Dial `addr`, handshake, and promote the connection to a peer. The
    /// connect calls have run against the new peer by the time this returns.
    pub async fn connect(self: &Arc<Self>, addr: &NetAddress) -> Result<(), GatewayError> {
        if !self.is_running() {
            return Err(GatewayError::Closed);
        }
        if *addr == self.address() {
            return Err(GatewayError::SelfConnect(addr.clone()));
        }
        {
            let state = self.state.read();
            if state.peers.contains_key(addr) {
                return Err(GatewayError::AlreadyConnected(addr.clone()));
            }
            if state.peers.len() >= self.settings().max_peers {
                return Err(GatewayError::PeerLimitReached {
                    limit: self.settings().max_peers,
                });
            }
        }

        let (stream, theirs) = self.dial_and_handshake(addr, ConnectIntent::Peer).await?;

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let peer = Arc::new(Peer::new(
            addr.clone(),
            ConnectionDirection::Outbound,
            theirs.protocol_version,
            tx,
            self.child_token(),
        ));
        self.admit_peer(&peer)?;
        tokio::spawn(session::run(self.clone(), peer.clone(), stream, rx));
        tracing::info!("🔗 Connected to peer {} (outbound)", addr);

        self.add_node(addr.clone());
        self.run_connect_calls(&peer).await;
        Ok(())
    }

    /// Close the connection to `addr`. No-op (returns false) if there is
    /// no such peer.
    pub fn disconnect(&self, addr: &NetAddress) -> bool {
        let removed = self.state.write().peers.remove(addr);
        match removed {
            Some(peer) => {
                peer.close();
                tracing::info!("🔌 Disconnected from {}", addr);
                true
            }
            None => false,
        }
    }

    /// Check that `addr` is a live gateway without making it a peer.
    pub async fn probe(&self, addr: &NetAddress) -> Result<(), GatewayError> {
        if *addr == self.address() {
            return Err(GatewayError::SelfConnect(addr.clone()));
        }
        let (_stream, _theirs) = self.dial_and_handshake(addr, ConnectIntent::Probe).await?;
        Ok(())
    }

    async fn dial_and_handshake(
        &self,
        addr: &NetAddress,
        intent: ConnectIntent,
    ) -> Result<(TcpStream, Handshake), GatewayError> {
        let settings = self.settings();
        let mut stream =
            match tokio::time::timeout(settings.dial_timeout, TcpStream::connect(addr.to_string()))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(GatewayError::unreachable(addr, e.to_string())),
                Err(_) => return Err(GatewayError::unreachable(addr, "dial timed out")),
            };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!("set_nodelay on {} failed: {}", addr, e);
        }

        let ours = self.handshake(intent);
        let theirs = tokio::time::timeout(
            settings.handshake_timeout,
            handshake::initiate(&mut stream, &ours, addr),
        )
        .await
        .map_err(|_| GatewayError::unreachable(addr, "handshake timed out"))??;

        if theirs.node_id == self.node_id() {
            return Err(GatewayError::SelfConnect(addr.clone()));
        }
        Ok((stream, theirs))
    }

    /// Insert a handshaken peer, re-checking uniqueness and limits under
    /// the write lock.
    pub(crate) fn admit_peer(&self, peer: &Arc<Peer>) -> Result<(), GatewayError> {
        if !self.is_running() {
            return Err(GatewayError::Closed);
        }
        let settings = self.settings();
        let mut state = self.state.write();
        let addr = peer.addr();

        if *addr == state.my_addr {
            return Err(GatewayError::SelfConnect(addr.clone()));
        }
        if state.peers.contains_key(addr) {
            return Err(GatewayError::AlreadyConnected(addr.clone()));
        }
        match peer.direction() {
            ConnectionDirection::Outbound => {
                if state.peers.len() >= settings.max_peers {
                    return Err(GatewayError::PeerLimitReached {
                        limit: settings.max_peers,
                    });
                }
            }
            ConnectionDirection::Inbound => {
                let inbound = state.peers.values().filter(|p| !p.is_outbound()).count();
                if inbound >= settings.max_inbound_peers {
                    return Err(GatewayError::PeerLimitReached {
                        limit: settings.max_inbound_peers,
                    });
                }
            }
        }

        state.peers.insert(addr.clone(), peer.clone());
        Ok(())
    }

    /// Undo `admit_peer` if the connection fails before its session starts.
    pub(crate) fn forget_peer(&self, peer: &Arc<Peer>) {
        let mut state = self.state.write();
        if let Some(current) = state.peers.get(peer.addr()) {
            if Arc::ptr_eq(current, peer) {
                state.peers.remove(peer.addr());
            }
        }
    }

    pub(crate) async fn run_connect_calls(self: &Arc<Self>, peer: &Arc<Peer>) {
        for (id, call) in self.registry().connect_calls() {
            if let Err(e) = call.on_connect(self, peer).await {
                tracing::debug!("Connect call {} to {} failed: {}", id, peer.addr(), e);
                if e.is_protocol_violation() {
                    peer.close();
                    return;
                }
            }
        }
    }
}
