//! RPC handler registry.
//!
//! Handlers are registered while the gateway is being built and the
//! registry is frozen once the gateway starts, so dispatch never takes a
//! lock.

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::network::message::{RemoteError, RpcId};
use crate::network::peer::Peer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Serves one procedure for remote callers.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(
        &self,
        gateway: &Arc<Gateway>,
        peer: &Arc<Peer>,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteError>;
}

/// Runs against every newly established peer, in either direction.
#[async_trait::async_trait]
pub trait ConnectCall: Send + Sync {
    async fn on_connect(&self, gateway: &Arc<Gateway>, peer: &Arc<Peer>)
        -> Result<(), GatewayError>;
}

#[derive(Default, Clone)]
pub struct RpcRegistry {
    handlers: HashMap<RpcId, Arc<dyn RpcHandler>>,
    // Ordered so connect calls run in a stable order
    connect_calls: BTreeMap<RpcId, Arc<dyn ConnectCall>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from handler tables known to be free of duplicates.
    pub(crate) fn from_parts(
        handlers: impl IntoIterator<Item = (RpcId, Arc<dyn RpcHandler>)>,
        connect_calls: impl IntoIterator<Item = (RpcId, Arc<dyn ConnectCall>)>,
    ) -> Self {
        Self {
            handlers: handlers.into_iter().collect(),
            connect_calls: connect_calls.into_iter().collect(),
        }
    }

    pub fn register_rpc(
        &mut self,
        id: RpcId,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<(), GatewayError> {
        if self.handlers.contains_key(&id) {
            return Err(GatewayError::DuplicateHandler(id));
        }
        self.handlers.insert(id, handler);
        Ok(())
    }

    pub fn register_connect_call(
        &mut self,
        id: RpcId,
        call: Arc<dyn ConnectCall>,
    ) -> Result<(), GatewayError> {
        if self.connect_calls.contains_key(&id) {
            return Err(GatewayError::DuplicateHandler(id));
        }
        self.connect_calls.insert(id, call);
        Ok(())
    }

    pub fn handler(&self, id: RpcId) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.get(&id).cloned()
    }

    pub fn connect_calls(&self) -> Vec<(RpcId, Arc<dyn ConnectCall>)> {
        self.connect_calls
            .iter()
            .map(|(id, call)| (*id, call.clone()))
            .collect()
    }
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, GatewayError> {
    bincode::serialize(value)
        .map_err(|e| GatewayError::ProtocolViolation(format!("unencodable payload: {}", e)))
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, GatewayError> {
    bincode::deserialize(bytes)
        .map_err(|e| GatewayError::ProtocolViolation(format!("malformed payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait::async_trait]
    impl RpcHandler for Echo {
        async fn handle(
            &self,
            _gateway: &Arc<Gateway>,
            _peer: &Arc<Peer>,
            payload: Vec<u8>,
        ) -> Result<Vec<u8>, RemoteError> {
            Ok(payload)
        }
    }

    struct Noop;

    #[async_trait::async_trait]
    impl ConnectCall for Noop {
        async fn on_connect(
            &self,
            _gateway: &Arc<Gateway>,
            _peer: &Arc<Peer>,
        ) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = RpcRegistry::new();
        registry.register_rpc(RpcId::Ping, Arc::new(Echo)).unwrap();
        let err = registry
            .register_rpc(RpcId::Ping, Arc::new(Echo))
            .unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateHandler(RpcId::Ping)));

        registry
            .register_connect_call(RpcId::ShareNodes, Arc::new(Noop))
            .unwrap();
        assert!(registry
            .register_connect_call(RpcId::ShareNodes, Arc::new(Noop))
            .is_err());
    }

    #[test]
    fn test_lookup() {
        let mut registry = RpcRegistry::new();
        registry.register_rpc(RpcId::Ping, Arc::new(Echo)).unwrap();
        assert!(registry.handler(RpcId::Ping).is_some());
        assert!(registry.handler(RpcId::RelayBlock).is_none());

        registry
            .register_connect_call(RpcId::RelayNode, Arc::new(Noop))
            .unwrap();
        registry
            .register_connect_call(RpcId::ShareNodes, Arc::new(Noop))
            .unwrap();
        let order: Vec<RpcId> = registry.connect_calls().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![RpcId::ShareNodes, RpcId::RelayNode]);
    }

    #[test]
    fn test_payload_codec() {
        let bytes = encode_payload(&vec!["a".to_string()]).unwrap();
        let back: Vec<String> = decode_payload(&bytes).unwrap();
        assert_eq!(back, vec!["a".to_string()]);
        assert!(decode_payload::<Vec<String>>(&[0xff; 3]).unwrap_err().is_protocol_violation());
    }
}
