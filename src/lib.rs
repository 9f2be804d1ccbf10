//! gatewayd: the peer-to-peer gateway of a node.
//!
//! Keeps a directory of known nodes, holds a bounded set of live peer
//! connections, serves RPCs over them and gossips node addresses. Two
//! background loops keep the outbound peer count at target and prune nodes
//! that stop answering.

pub mod config;
pub mod constants;
pub mod error;
pub mod gateway;
pub mod nat;
pub mod network;
pub mod node_directory;
pub mod node_manager;
pub mod peer_manager;
pub mod shutdown;
pub mod storage;
pub mod transaction_pool;

pub use config::{Config, GatewaySettings};
pub use error::{AppError, GatewayError, StorageError, WireError};
pub use gateway::{Gateway, GatewayBuilder};
pub use network::address::NetAddress;
pub use network::message::{RemoteError, RpcId};
pub use network::peer::{ConnectionDirection, Peer, PeerInfo};
pub use network::rpc::{ConnectCall, RpcHandler};
pub use storage::{InMemoryNodeStore, NodeStore, SledNodeStore};
