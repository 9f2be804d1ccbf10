//! Transaction pool interface.
//!
//! The gateway does not pool transactions itself. This module defines what a
//! pool looks like to the rest of the node, and `TransactionSetRelay` wires a
//! pool into the gateway as the `RelayTransactionSet` handler.

use crate::error::GatewayError;
use crate::gateway::{Gateway, GatewayBuilder};
use crate::network::message::{RemoteError, RpcId};
use crate::network::peer::Peer;
use crate::network::rpc::{decode_payload, RpcHandler};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Largest single transaction a pool accepts, in encoded bytes.
pub const TRANSACTION_SIZE_LIMIT: usize = 16_000;
/// Largest transaction set a pool accepts, in encoded bytes.
pub const TRANSACTION_SET_SIZE_LIMIT: usize = 250_000;
/// Arbitrary-data specifier that marks data the pool treats as non-standard.
pub const PREFIX_NON_SIA: [u8; 16] = *b"NonSia\0\0\0\0\0\0\0\0\0\0";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("transaction is a duplicate")]
    Duplicate,

    #[error("transaction is too large for this transaction pool")]
    LargeTransaction,

    #[error("transaction set is too large for this transaction pool")]
    LargeTransactionSet,

    #[error("transaction contains non-standard arbitrary data")]
    InvalidArbitraryPrefix,

    /// Double spend or consensus rule violation; unlikely to ever be valid.
    #[error("consensus conflict: {0}")]
    ConsensusConflict(String),
}

/// Notified whenever the unconfirmed set changes.
pub trait TransactionPoolSubscriber<T, C>: Send + Sync {
    fn receive_updated_unconfirmed_transactions(&self, transactions: &[T], change: &C);
}

#[async_trait::async_trait]
pub trait TransactionPool: Send + Sync + 'static {
    type Transaction: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type ConsensusChange: Clone + Send + Sync + 'static;

    /// Accept a set of possibly interdependent transactions.
    async fn accept_transaction_set(
        &self,
        transactions: Vec<Self::Transaction>,
    ) -> Result<(), PoolError>;

    fn is_standard_transaction(&self, transaction: &Self::Transaction) -> Result<(), PoolError>;

    /// Drop every unconfirmed transaction.
    fn purge(&self);

    /// Unconfirmed transactions in an order that can go into a block.
    fn transaction_list(&self) -> Vec<Self::Transaction>;

    fn subscribe(
        &self,
        subscriber: Arc<dyn TransactionPoolSubscriber<Self::Transaction, Self::ConsensusChange>>,
    );
}

/// Size check shared by pools: encoded set and each member must fit.
pub fn check_set_size<T: Serialize>(transactions: &[T]) -> Result<(), PoolError> {
    let mut total = 0usize;
    for tx in transactions {
        let size = bincode::serialized_size(tx).map_err(|_| PoolError::LargeTransaction)? as usize;
        if size > TRANSACTION_SIZE_LIMIT {
            return Err(PoolError::LargeTransaction);
        }
        total = total.saturating_add(size);
    }
    if total > TRANSACTION_SET_SIZE_LIMIT {
        return Err(PoolError::LargeTransactionSet);
    }
    Ok(())
}

/// Serves `RelayTransactionSet` by handing incoming sets to a pool and
/// passing accepted sets on to the other peers.
pub struct TransactionSetRelay<P> {
    pool: Arc<P>,
}

impl<P: TransactionPool> TransactionSetRelay<P> {
    pub fn new(pool: Arc<P>) -> Self {
        Self { pool }
    }

    /// Register `pool` on a gateway that has not started yet.
    pub fn register(builder: GatewayBuilder, pool: Arc<P>) -> Result<GatewayBuilder, GatewayError> {
        builder.register_rpc(RpcId::RelayTransactionSet, Arc::new(Self::new(pool)))
    }
}

#[async_trait::async_trait]
impl<P: TransactionPool> RpcHandler for TransactionSetRelay<P> {
    async fn handle(
        &self,
        gateway: &Arc<Gateway>,
        peer: &Arc<Peer>,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteError> {
        if payload.len() > TRANSACTION_SET_SIZE_LIMIT {
            return Err(RemoteError::new(PoolError::LargeTransactionSet.to_string()));
        }
        let set: Vec<P::Transaction> =
            decode_payload(&payload).map_err(|e| RemoteError::new(e.to_string()))?;
        check_set_size(&set).map_err(|e| RemoteError::new(e.to_string()))?;

        self.pool
            .accept_transaction_set(set)
            .await
            .map_err(|e| RemoteError::new(e.to_string()))?;

        let gateway = gateway.clone();
        let source = peer.addr().clone();
        tokio::spawn(async move {
            let delivered = gateway
                .broadcast(RpcId::RelayTransactionSet, payload, &[source])
                .await;
            tracing::debug!("📢 Relayed transaction set to {} peer(s)", delivered);
        });
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaySettings;
    use crate::storage::InMemoryNodeStore;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct MockPool {
        seen: Mutex<HashSet<Vec<u8>>>,
        accepted: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl TransactionPool for MockPool {
        type Transaction = Vec<u8>;
        type ConsensusChange = ();

        async fn accept_transaction_set(&self, transactions: Vec<Vec<u8>>) -> Result<(), PoolError> {
            for tx in &transactions {
                self.is_standard_transaction(tx)?;
            }
            let mut seen = self.seen.lock();
            if transactions.iter().all(|tx| seen.contains(tx)) {
                return Err(PoolError::Duplicate);
            }
            seen.extend(transactions.iter().cloned());
            self.accepted.lock().extend(transactions);
            Ok(())
        }

        fn is_standard_transaction(&self, tx: &Vec<u8>) -> Result<(), PoolError> {
            if tx.starts_with(&PREFIX_NON_SIA) {
                return Err(PoolError::InvalidArbitraryPrefix);
            }
            Ok(())
        }

        fn purge(&self) {
            self.accepted.lock().clear();
        }

        fn transaction_list(&self) -> Vec<Vec<u8>> {
            self.accepted.lock().clone()
        }

        fn subscribe(&self, _subscriber: Arc<dyn TransactionPoolSubscriber<Vec<u8>, ()>>) {}
    }

    #[test]
    fn test_size_limits() {
        assert!(check_set_size(&[vec![0u8; 100]]).is_ok());
        assert_eq!(
            check_set_size(&[vec![0u8; TRANSACTION_SIZE_LIMIT + 1]]),
            Err(PoolError::LargeTransaction)
        );
        let many = vec![vec![0u8; 10_000]; 30];
        assert_eq!(check_set_size(&many), Err(PoolError::LargeTransactionSet));
    }

    #[test]
    fn test_non_sia_specifier() {
        assert_eq!(&PREFIX_NON_SIA[..6], b"NonSia");
        assert!(PREFIX_NON_SIA[6..].iter().all(|b| *b == 0));

        let pool = MockPool::default();
        let mut tagged = PREFIX_NON_SIA.to_vec();
        tagged.extend_from_slice(b"payload");
        assert_eq!(
            pool.is_standard_transaction(&tagged),
            Err(PoolError::InvalidArbitraryPrefix)
        );
        assert!(pool.is_standard_transaction(&b"NonStandard".to_vec()).is_ok());
    }

    #[test]
    fn test_consensus_conflict_message() {
        let err = PoolError::ConsensusConflict("double spend".into());
        assert_eq!(err.to_string(), "consensus conflict: double spend");
    }

    #[tokio::test]
    async fn test_relayed_set_reaches_pool() {
        let pool = Arc::new(MockPool::default());
        let builder = GatewayBuilder::new(GatewaySettings::isolated())
            .store(Arc::new(InMemoryNodeStore::new()));
        let receiver = TransactionSetRelay::register(builder, pool.clone())
            .unwrap()
            .start("127.0.0.1:0")
            .await
            .unwrap();
        let sender = GatewayBuilder::new(GatewaySettings::isolated())
            .store(Arc::new(InMemoryNodeStore::new()))
            .start("127.0.0.1:0")
            .await
            .unwrap();

        sender.connect(&receiver.address()).await.unwrap();
        let set = vec![vec![1u8, 2, 3], vec![4u8]];
        let _: () = sender
            .call(&receiver.address(), RpcId::RelayTransactionSet, &set)
            .await
            .unwrap();
        assert_eq!(pool.transaction_list(), set);

        let err = sender
            .call::<_, ()>(&receiver.address(), RpcId::RelayTransactionSet, &set)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Remote(msg) if msg.contains("duplicate")));

        sender.close().await.unwrap();
        receiver.close().await.unwrap();
    }
}
