pub mod address;
pub mod client;
pub mod gossip;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod rpc;
pub mod server;
pub(crate) mod session;
pub mod wire;
