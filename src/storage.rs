//! Persistence for the node directory.
//!
//! The directory is saved and loaded as a whole set. A store that has never
//! been written loads as an empty set; that is a cold start, not an error.

use crate::constants;
use crate::error::StorageError;
use crate::network::address::NetAddress;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[async_trait::async_trait]
pub trait NodeStore: Send + Sync {
    async fn load(&self) -> Result<Vec<NetAddress>, StorageError>;
    async fn save(&self, nodes: &[NetAddress]) -> Result<(), StorageError>;
}

/// Store for tests and for running without a data directory
#[derive(Default)]
pub struct InMemoryNodeStore {
    nodes: RwLock<Vec<NetAddress>>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: Vec<NetAddress>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
        }
    }
}

#[async_trait::async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn load(&self) -> Result<Vec<NetAddress>, StorageError> {
        Ok(self.nodes.read().clone())
    }

    async fn save(&self, nodes: &[NetAddress]) -> Result<(), StorageError> {
        *self.nodes.write() = nodes.to_vec();
        Ok(())
    }
}

/// One persisted node. Keyed by its address string in the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    address: NetAddress,
    saved_at: i64,
}

pub struct SledNodeStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledNodeStore {
    /// Open (or create) the gateway database under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = data_dir.as_ref().join(constants::storage::GATEWAY_DB);
        let db = sled::Config::new()
            .path(&path)
            .mode(sled::Mode::LowSpace)
            .open()
            .map_err(|e| {
                tracing::error!(path = %path.display(), "Failed to open gateway database");
                StorageError::DatabaseOpen {
                    name: constants::storage::GATEWAY_DB.to_string(),
                    source: e,
                }
            })?;
        let tree = db.open_tree(constants::storage::NODES_TREE)?;
        Ok(Self { db, tree })
    }
}

#[async_trait::async_trait]
impl NodeStore for SledNodeStore {
    async fn load(&self) -> Result<Vec<NetAddress>, StorageError> {
        let mut nodes = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            let record = bincode::deserialize::<NodeRecord>(&value).map_err(|e| {
                StorageError::Serialization(format!(
                    "node record {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ))
            })?;
            nodes.push(record.address);
        }
        Ok(nodes)
    }

    async fn save(&self, nodes: &[NetAddress]) -> Result<(), StorageError> {
        let keep: HashSet<String> = nodes.iter().map(|n| n.to_string()).collect();
        let saved_at = chrono::Utc::now().timestamp();

        let mut batch = sled::Batch::default();
        for key in self.tree.iter().keys() {
            let key = key?;
            if !keep.contains(String::from_utf8_lossy(&key).as_ref()) {
                batch.remove(key);
            }
        }
        for node in nodes {
            let record = NodeRecord {
                address: node.clone(),
                saved_at,
            };
            let value = bincode::serialize(&record)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            batch.insert(node.to_string().as_bytes(), value);
        }

        self.tree.apply_batch(batch)?;
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NetAddress {
        NetAddress::parse(s).unwrap()
    }

    fn as_set(nodes: Vec<NetAddress>) -> HashSet<NetAddress> {
        nodes.into_iter().collect()
    }

    #[tokio::test]
    async fn test_fresh_store_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledNodeStore::open(dir.path()).unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_reopen_reproduces_set() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = vec![
            addr("203.0.113.1:9981"),
            addr("203.0.113.2:9981"),
            addr("[2001:db8::7]:9981"),
        ];

        {
            let store = SledNodeStore::open(dir.path()).unwrap();
            store.save(&nodes).await.unwrap();
        }

        let store = SledNodeStore::open(dir.path()).unwrap();
        assert_eq!(as_set(store.load().await.unwrap()), as_set(nodes));
    }

    #[tokio::test]
    async fn test_save_replaces_previous_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledNodeStore::open(dir.path()).unwrap();
        store
            .save(&[addr("203.0.113.1:9981"), addr("203.0.113.2:9981")])
            .await
            .unwrap();
        store.save(&[addr("203.0.113.3:9981")]).await.unwrap();

        assert_eq!(
            as_set(store.load().await.unwrap()),
            as_set(vec![addr("203.0.113.3:9981")])
        );
    }

    #[tokio::test]
    async fn test_corrupt_record_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledNodeStore::open(dir.path()).unwrap();
        store.save(&[addr("203.0.113.1:9981")]).await.unwrap();
        store
            .tree
            .insert("203.0.113.2:9981", &[0xffu8, 0x01][..])
            .unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization(msg) if msg.contains("203.0.113.2:9981")));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryNodeStore::new();
        assert!(store.load().await.unwrap().is_empty());
        store.save(&[addr("203.0.113.9:9981")]).await.unwrap();
        assert_eq!(store.load().await.unwrap(), vec![addr("203.0.113.9:9981")]);
    }
}
