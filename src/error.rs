use crate::network::address::{AddressError, NetAddress};
use crate::network::message::RpcId;
use thiserror::Error;

/// Errors surfaced by gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("no peers")]
    NoPeers,

    #[error("{addr} unreachable: {reason}")]
    Unreachable { addr: NetAddress, reason: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("already connected to {0}")]
    AlreadyConnected(NetAddress),

    #[error("peer limit reached ({limit} peers)")]
    PeerLimitReached { limit: usize },

    #[error("refusing to connect to own address {0}")]
    SelfConnect(NetAddress),

    #[error("not connected to {0}")]
    NotConnected(NetAddress),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StorageError),

    #[error("Startup failure: {0}")]
    Startup(String),

    #[error("handler already registered for {0}")]
    DuplicateHandler(RpcId),

    #[error("gateway is closed")]
    Closed,

    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

impl GatewayError {
    pub(crate) fn unreachable(addr: &NetAddress, reason: impl Into<String>) -> Self {
        GatewayError::Unreachable {
            addr: addr.clone(),
            reason: reason.into(),
        }
    }

    /// Whether the remote misbehaved badly enough that its address should
    /// not be offered as a candidate again.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, GatewayError::ProtocolViolation(_))
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open {name} database: {source}")]
    DatabaseOpen {
        name: String,
        #[source]
        source: sled::Error,
    },

    #[error("Database operation failed: {0}")]
    DatabaseOp(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Framing and codec failures on a peer connection.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Frame too large: {len} bytes (max: {max})")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for the daemon binary.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML decode error: {0}")]
    TomlDecode(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),
}
