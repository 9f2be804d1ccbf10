//! Global constants for the gateway
//!
//! Policy values here are defaults; the ones an operator may reasonably tune
//! are also exposed through `[network]` in the config file.

/// Wire protocol constants
pub mod protocol {
    /// Version advertised in the handshake
    pub const PROTOCOL_VERSION: u32 = 1;

    /// Oldest remote version we still talk to
    pub const MIN_PROTOCOL_VERSION: u32 = 1;

    /// Default gateway port
    pub const DEFAULT_PORT: u16 = 9981;
}

/// Gossip policy
pub mod gossip {
    /// Max addresses returned by one ShareNodes response
    pub const SHARE_NODES_CAP: usize = 10;

    /// Max addresses merged from one ShareNodes response, whatever the
    /// remote's own cap is
    pub const MAX_MERGED_NODES: usize = 100;

    /// Below this many known nodes the node manager asks a peer for more
    pub const MIN_NODE_THRESHOLD: usize = 20;
}

/// Connection limits
pub mod peers {
    /// Outbound peers the peer manager works toward
    pub const TARGET_OUTBOUND: usize = 8;

    /// Total peers beyond which Connect refuses to dial
    pub const MAX_PEERS: usize = 32;

    /// Inbound peers accepted, counted separately so we stay reachable
    pub const MAX_INBOUND: usize = 64;

    /// Per-peer outbound frame queue depth
    pub const OUTBOUND_QUEUE: usize = 64;

    /// Calls from one peer we serve at once. Our own calls to a peer are
    /// serialized, so a well-behaved remote stays far below this.
    pub const MAX_INFLIGHT_CALLS: usize = 32;
}

/// Background loop timing
pub mod timing {
    use std::time::Duration;

    pub const PEER_MANAGER_INTERVAL: Duration = Duration::from_secs(10);
    pub const NODE_MANAGER_INTERVAL: Duration = Duration::from_secs(30);
    pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

    /// How long `close` waits for background tasks to finish
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

    /// Consecutive failed probes before a node is dropped
    pub const MAX_PROBE_FAILURES: u32 = 3;

    /// Nodes probed per node manager tick
    pub const PROBE_BATCH: usize = 3;
}

/// Seed nodes used when the persisted directory is empty
pub mod bootstrap {
    /// Bumped whenever the list below changes
    pub const BOOTSTRAP_LIST_VERSION: u32 = 3;

    pub const BOOTSTRAP_PEERS: &[&str] = &[
        "101.200.214.115:9981",
        "109.172.42.157:9981",
        "109.206.33.225:9981",
        "113.98.98.164:9981",
        "115.187.229.102:9981",
        "116.62.118.3:9981",
        "119.12.174.140:9981",
        "120.25.198.251:9981",
        "138.201.12.47:9981",
        "147.135.23.200:9981",
    ];
}

/// Persistence layout
pub mod storage {
    /// Gateway database directory inside the data dir
    pub const GATEWAY_DB: &str = "gateway.db";

    /// Tree holding the node directory
    pub const NODES_TREE: &str = "nodes";

    /// Daily-rolled log file prefix inside the data dir
    pub const LOG_FILE: &str = "gateway.log";
}
