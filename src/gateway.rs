//! The gateway aggregate: own address, live peers, known nodes, the RPC
//! registry and the shutdown signal.
//!
//! All mutable state sits behind a single `RwLock` that is only ever held
//! for in-memory updates, never across an `.await`.

use crate::config::GatewaySettings;
use crate::constants;
use crate::error::GatewayError;
use crate::nat::{AddressDiscovery, ConfiguredAddress, NoPortForwarding, PortForwarder};
use crate::network::address::NetAddress;
use crate::network::gossip;
use crate::network::message::{ConnectIntent, Handshake, RpcId};
use crate::network::peer::{Peer, PeerInfo};
use crate::network::rpc::{decode_payload, encode_payload, ConnectCall, RpcHandler, RpcRegistry};
use crate::node_directory::NodeDirectory;
use crate::node_manager;
use crate::peer_manager;
use crate::shutdown::ShutdownManager;
use crate::storage::{NodeStore, SledNodeStore};
use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Closing,
    Closed,
}

pub(crate) struct GatewayState {
    pub(crate) my_addr: NetAddress,
    pub(crate) peers: HashMap<NetAddress, Arc<Peer>>,
    pub(crate) nodes: NodeDirectory,
}

pub struct Gateway {
    node_id: u64,
    settings: GatewaySettings,
    pub(crate) state: RwLock<GatewayState>,
    registry: RpcRegistry,
    store: Arc<dyn NodeStore>,
    port_forwarder: Arc<dyn PortForwarder>,
    discovery: Arc<dyn AddressDiscovery>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: ShutdownManager,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Collects handlers and collaborators before the gateway starts serving.
/// Once `start` returns the registry can no longer change.
pub struct GatewayBuilder {
    settings: GatewaySettings,
    registry: RpcRegistry,
    store: Option<Arc<dyn NodeStore>>,
    port_forwarder: Option<Arc<dyn PortForwarder>>,
    discovery: Option<Arc<dyn AddressDiscovery>>,
}

impl GatewayBuilder {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            settings,
            registry: gossip::builtin_registry(),
            store: None,
            port_forwarder: None,
            discovery: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn port_forwarder(mut self, forwarder: Arc<dyn PortForwarder>) -> Self {
        self.port_forwarder = Some(forwarder);
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn AddressDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn register_rpc(
        mut self,
        id: RpcId,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<Self, GatewayError> {
        self.registry.register_rpc(id, handler)?;
        Ok(self)
    }

    pub fn register_connect_call(
        mut self,
        id: RpcId,
        call: Arc<dyn ConnectCall>,
    ) -> Result<Self, GatewayError> {
        self.registry.register_connect_call(id, call)?;
        Ok(self)
    }

    /// Bind `listen`, load the node directory (seeding it on a cold start)
    /// and launch the accept loop and both manager loops.
    pub async fn start(self, listen: &str) -> Result<Arc<Gateway>, GatewayError> {
        let store = self
            .store
            .ok_or_else(|| GatewayError::Startup("no node store configured".to_string()))?;

        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| GatewayError::Startup(format!("failed to bind {}: {}", listen, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| GatewayError::Startup(format!("no local address for {}: {}", listen, e)))?;
        let my_addr = NetAddress::from(local);

        let discovery = self.discovery.unwrap_or_else(|| {
            Arc::new(ConfiguredAddress::new(self.settings.external_address.clone()))
                as Arc<dyn AddressDiscovery>
        });
        let gateway = Arc::new(Gateway {
            node_id: rand::random(),
            settings: self.settings,
            state: RwLock::new(GatewayState {
                my_addr: my_addr.clone(),
                peers: HashMap::new(),
                nodes: NodeDirectory::new(),
            }),
            registry: self.registry,
            store,
            port_forwarder: self
                .port_forwarder
                .unwrap_or_else(|| Arc::new(NoPortForwarding) as Arc<dyn PortForwarder>),
            discovery,
            lifecycle: Mutex::new(Lifecycle::Running),
            shutdown: ShutdownManager::new(),
        });

        gateway.load_nodes().await?;

        let token = gateway.shutdown.token();
        gateway.shutdown.spawn(
            "accept-loop",
            gateway.clone().accept_loop(listener, token.clone()),
        );
        gateway.shutdown.spawn(
            "peer-manager",
            peer_manager::run(gateway.clone(), token.clone()),
        );
        gateway.shutdown.spawn(
            "node-manager",
            node_manager::run(gateway.clone(), token.clone()),
        );

        if !gateway.settings.isolated {
            gateway.spawn_side_tasks();
        }

        tracing::info!(
            "🌐 Gateway listening on {} ({} known nodes)",
            my_addr,
            gateway.node_count()
        );
        Ok(gateway)
    }
}

impl Gateway {
    /// Create the data directory, open the on-disk node store and start a
    /// gateway listening on `listen`.
    pub async fn new(
        listen: &str,
        persist_dir: impl AsRef<Path>,
        settings: GatewaySettings,
    ) -> Result<Arc<Self>, GatewayError> {
        let dir = persist_dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            GatewayError::Startup(format!("failed to create {}: {}", dir.display(), e))
        })?;
        let store = SledNodeStore::open(dir)?;
        GatewayBuilder::new(settings)
            .store(Arc::new(store))
            .start(listen)
            .await
    }

    async fn load_nodes(&self) -> Result<(), GatewayError> {
        let loaded = self.store.load().await?;
        let count = loaded.len();
        for addr in loaded {
            self.add_node(addr);
        }
        tracing::debug!("Loaded {} persisted node(s)", count);

        if self.node_count() == 0 && !self.settings.isolated {
            for seed in &self.settings.bootstrap_peers {
                self.add_node(seed.clone());
            }
            tracing::info!(
                "🌱 Seeded node directory with {} bootstrap node(s) (list v{})",
                self.node_count(),
                constants::bootstrap::BOOTSTRAP_LIST_VERSION
            );
            self.store.save(&self.nodes()).await?;
        }
        Ok(())
    }

    fn spawn_side_tasks(self: &Arc<Self>) {
        if self.settings.enable_upnp {
            let forwarder = self.port_forwarder.clone();
            let port = self.address().port();
            self.shutdown.spawn("port-forward", async move {
                match forwarder.forward_port(port).await {
                    Ok(()) => tracing::info!("🔀 Forwarded port {}", port),
                    Err(e) => tracing::warn!("Port forwarding for {} failed: {}", port, e),
                }
            });
        }

        let gateway = self.clone();
        self.shutdown.spawn("address-discovery", async move {
            match gateway.discovery.external_host().await {
                Ok(host) => {
                    if let Err(e) = gateway.set_host(&host) {
                        tracing::warn!("Discovered unusable external host {}: {}", host, e);
                    }
                }
                Err(e) => tracing::debug!("External address discovery unavailable: {}", e),
            }
        });
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub(crate) fn registry(&self) -> &RpcRegistry {
        &self.registry
    }

    /// The address this gateway advertises to others.
    pub fn address(&self) -> NetAddress {
        self.state.read().my_addr.clone()
    }

    /// Replace the host part of the advertised address, keeping the port.
    pub fn set_host(&self, host: &str) -> Result<(), GatewayError> {
        let mut state = self.state.write();
        let addr = state.my_addr.with_host(host)?;
        state.nodes.remove(&addr);
        tracing::info!("📍 Advertised address is now {}", addr);
        state.my_addr = addr;
        Ok(())
    }

    pub(crate) fn handshake(&self, intent: ConnectIntent) -> Handshake {
        Handshake {
            protocol_version: constants::protocol::PROTOCOL_VERSION,
            node_id: self.node_id,
            listen_addr: self.address(),
            intent,
        }
    }

    pub fn is_running(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Running
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    // ---- peers ----

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state.read().peers.values().map(|p| p.info()).collect()
    }

    pub fn peer(&self, addr: &NetAddress) -> Option<Arc<Peer>> {
        self.state.read().peers.get(addr).cloned()
    }

    pub fn is_connected(&self, addr: &NetAddress) -> bool {
        self.state.read().peers.contains_key(addr)
    }

    pub fn peer_count(&self) -> usize {
        self.state.read().peers.len()
    }

    pub fn outbound_count(&self) -> usize {
        self.state
            .read()
            .peers
            .values()
            .filter(|p| p.is_outbound())
            .count()
    }

    pub fn inbound_count(&self) -> usize {
        self.state
            .read()
            .peers
            .values()
            .filter(|p| !p.is_outbound())
            .count()
    }

    pub fn random_peer(&self) -> Result<Arc<Peer>, GatewayError> {
        self.state
            .read()
            .peers
            .values()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(GatewayError::NoPeers)
    }

    /// Called by a session task once its connection is gone. Only removes
    /// the mapping if it still points at this exact peer.
    pub(crate) fn on_peer_closed(&self, peer: &Arc<Peer>, untrusted: bool) {
        let running = self.is_running();
        let mut guard = self.state.write();
        let state = &mut *guard;
        let still_mapped = state
            .peers
            .get(peer.addr())
            .map(|current| Arc::ptr_eq(current, peer))
            .unwrap_or(false);
        if still_mapped {
            state.peers.remove(peer.addr());
        }

        if !running {
            return;
        }
        if untrusted {
            state.nodes.remove(peer.addr());
        } else if peer.is_outbound() || self.accepts_relayed(peer.addr()) {
            state.nodes.add(peer.addr().clone(), &state.my_addr);
        }
    }

    // ---- nodes ----

    /// Insert `addr` unless present or our own address. Returns whether the
    /// directory changed.
    pub fn add_node(&self, addr: NetAddress) -> bool {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.nodes.add(addr, &state.my_addr)
    }

    pub fn remove_node(&self, addr: &NetAddress) -> bool {
        self.state.write().nodes.remove(addr)
    }

    pub fn has_node(&self, addr: &NetAddress) -> bool {
        self.state.read().nodes.contains(addr)
    }

    pub fn nodes(&self) -> Vec<NetAddress> {
        self.state.read().nodes.addresses()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Whether an address learned from gossip is worth keeping.
    pub(crate) fn accepts_relayed(&self, addr: &NetAddress) -> bool {
        self.settings.allows_local_addresses() || addr.is_routable()
    }

    // ---- calls ----

    /// Call `rpc` on the connected peer at `addr`.
    pub async fn call<Req, Resp>(
        &self,
        addr: &NetAddress,
        rpc: RpcId,
        request: &Req,
    ) -> Result<Resp, GatewayError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let peer = self
            .peer(addr)
            .ok_or_else(|| GatewayError::NotConnected(addr.clone()))?;
        self.call_peer(&peer, rpc, request).await
    }

    pub async fn call_peer<Req, Resp>(
        &self,
        peer: &Peer,
        rpc: RpcId,
        request: &Req,
    ) -> Result<Resp, GatewayError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = encode_payload(request)?;
        let response = peer
            .call_raw(rpc, payload, self.settings.rpc_timeout)
            .await?;
        decode_payload(&response).map_err(|e| {
            tracing::warn!("Bad {} response from {}: {}", rpc, peer.addr(), e);
            peer.close();
            e
        })
    }

    /// Send `rpc` to every peer not in `exclude`, waiting for all of them.
    /// Returns how many peers acknowledged.
    pub async fn broadcast(&self, rpc: RpcId, payload: Vec<u8>, exclude: &[NetAddress]) -> usize {
        let targets: Vec<Arc<Peer>> = self
            .state
            .read()
            .peers
            .values()
            .filter(|p| !exclude.contains(p.addr()))
            .cloned()
            .collect();

        let mut calls = JoinSet::new();
        for peer in targets {
            let payload = payload.clone();
            let timeout = self.settings.rpc_timeout;
            calls.spawn(async move {
                let result = peer.call_raw(rpc, payload, timeout).await;
                (peer, result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((_, Ok(_))) => delivered += 1,
                Ok((peer, Err(e))) => {
                    tracing::debug!("Broadcast of {} to {} failed: {}", rpc, peer.addr(), e)
                }
                Err(e) => tracing::warn!("Broadcast task failed: {}", e),
            }
        }
        delivered
    }

    // ---- lifecycle ----

    /// Persist the node directory, stop every task and close every
    /// connection. Cleanup runs even when saving fails; the save error is
    /// what gets returned.
    pub async fn close(&self) -> Result<(), GatewayError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Running {
                return Err(GatewayError::Closed);
            }
            *lifecycle = Lifecycle::Closing;
        }
        tracing::info!("🛑 Closing gateway {}", self.address());

        let snapshot = self.nodes();
        let saved = self.store.save(&snapshot).await;
        if let Err(e) = &saved {
            tracing::error!("Failed to persist node directory: {}", e);
        }

        let peers: Vec<Arc<Peer>> = self
            .state
            .write()
            .peers
            .drain()
            .map(|(_, peer)| peer)
            .collect();
        for peer in &peers {
            peer.close();
        }

        if !self
            .shutdown
            .shutdown(constants::timing::SHUTDOWN_GRACE)
            .await
        {
            tracing::warn!("Some gateway tasks did not stop within the grace period");
        }

        if self.settings.enable_upnp && !self.settings.isolated {
            let port = self.address().port();
            if let Err(e) = self.port_forwarder.clear_port(port).await {
                tracing::warn!("Failed to release port mapping for {}: {}", port, e);
            }
        }

        *self.lifecycle.lock() = Lifecycle::Closed;
        tracing::info!("✓ Gateway closed ({} nodes saved)", snapshot.len());
        saved.map_err(GatewayError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryNodeStore;

    fn addr(s: &str) -> NetAddress {
        NetAddress::parse(s).unwrap()
    }

    async fn isolated_gateway() -> Arc<Gateway> {
        GatewayBuilder::new(GatewaySettings::isolated())
            .store(Arc::new(InMemoryNodeStore::new()))
            .start("127.0.0.1:0")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_os_chosen_port_becomes_address() {
        let gateway = isolated_gateway().await;
        let own = gateway.address();
        assert_eq!(own.host(), "127.0.0.1");
        assert_ne!(own.port(), 0);
        gateway.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_node_excludes_own_address() {
        let gateway = isolated_gateway().await;
        assert!(!gateway.add_node(gateway.address()));
        assert!(gateway.add_node(addr("203.0.113.5:9981")));
        assert!(!gateway.add_node(addr("203.0.113.5:9981")));
        assert!(gateway.remove_node(&addr("203.0.113.5:9981")));
        assert!(!gateway.remove_node(&addr("203.0.113.5:9981")));
        gateway.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_host_purges_new_own_address() {
        let gateway = isolated_gateway().await;
        let port = gateway.address().port();
        let future_self = NetAddress::new("198.51.100.7", port).unwrap();
        assert!(gateway.add_node(future_self.clone()));

        gateway.set_host("198.51.100.7").unwrap();
        assert_eq!(gateway.address(), future_self);
        assert!(!gateway.has_node(&future_self));
        gateway.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_random_peer_without_peers() {
        let gateway = isolated_gateway().await;
        assert!(matches!(gateway.random_peer(), Err(GatewayError::NoPeers)));
        gateway.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_single_shot() {
        let gateway = isolated_gateway().await;
        gateway.close().await.unwrap();
        assert!(!gateway.is_running());
        assert!(matches!(gateway.close().await, Err(GatewayError::Closed)));
    }

    #[tokio::test]
    async fn test_duplicate_builtin_registration_fails() {
        struct Nothing;
        #[async_trait::async_trait]
        impl RpcHandler for Nothing {
            async fn handle(
                &self,
                _gateway: &Arc<Gateway>,
                _peer: &Arc<Peer>,
                _payload: Vec<u8>,
            ) -> Result<Vec<u8>, crate::network::message::RemoteError> {
                Ok(vec![])
            }
        }

        let result =
            GatewayBuilder::new(GatewaySettings::isolated()).register_rpc(RpcId::ShareNodes, Arc::new(Nothing));
        assert!(matches!(
            result,
            Err(GatewayError::DuplicateHandler(RpcId::ShareNodes))
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_is_startup_error() {
        let gateway = isolated_gateway().await;
        let taken = gateway.address().to_string();
        let result = GatewayBuilder::new(GatewaySettings::isolated())
            .store(Arc::new(InMemoryNodeStore::new()))
            .start(&taken)
            .await;
        assert!(matches!(result, Err(GatewayError::Startup(_))));
        gateway.close().await.unwrap();
    }
}
