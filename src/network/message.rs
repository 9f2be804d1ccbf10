use crate::network::address::NetAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Procedure identifiers understood on the wire.
///
/// The set is closed: a tag that does not decode, or that has no handler
/// registered on the receiving side, terminates the connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RpcId {
    // Gossip
    ShareNodes,
    RelayNode,
    Ping,
    // Reserved for the consensus and transaction pool modules
    SendBlocks,
    RelayBlock,
    RelayTransactionSet,
}

impl RpcId {
    pub const ALL: [RpcId; 6] = [
        RpcId::ShareNodes,
        RpcId::RelayNode,
        RpcId::Ping,
        RpcId::SendBlocks,
        RpcId::RelayBlock,
        RpcId::RelayTransactionSet,
    ];

    /// Wire-contract name of the procedure.
    pub fn name(&self) -> &'static str {
        match self {
            RpcId::ShareNodes => "ShareNodes",
            RpcId::RelayNode => "RelayNode",
            RpcId::Ping => "Ping",
            RpcId::SendBlocks => "SendBlocks",
            RpcId::RelayBlock => "RelayBlock",
            RpcId::RelayTransactionSet => "RelayTransactionSet",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.name() == name)
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the dialing side wants from the connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectIntent {
    /// Become a long-lived peer.
    Peer,
    /// Liveness check only; the acceptor answers and hangs up.
    Probe,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    /// Random per-process identity, used to catch self-connections that
    /// arrive under a different address.
    pub node_id: u64,
    /// The address the sender accepts connections on.
    pub listen_addr: NetAddress,
    pub intent: ConnectIntent,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    SelfConnect,
    AlreadyConnected,
    PeerLimitReached,
    IncompatibleVersion,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::SelfConnect => "self-connection",
            RejectReason::AlreadyConnected => "already connected",
            RejectReason::PeerLimitReached => "peer limit reached",
            RejectReason::IncompatibleVersion => "incompatible protocol version",
        };
        f.write_str(s)
    }
}

/// Failure reported by the remote handler, as opposed to a dropped connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Frame {
    // First frame in each direction
    Handshake(Handshake),
    HandshakeReject(RejectReason),
    // After the handshake
    Call {
        call_id: u64,
        rpc: RpcId,
        payload: Vec<u8>,
    },
    Response {
        call_id: u64,
        result: Result<Vec<u8>, RemoteError>,
    },
}

impl Frame {
    /// Frame type name (for logging)
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Handshake(_) => "Handshake",
            Frame::HandshakeReject(_) => "HandshakeReject",
            Frame::Call { .. } => "Call",
            Frame::Response { .. } => "Response",
        }
    }
}
