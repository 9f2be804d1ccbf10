//! A live, handshaken connection to a remote gateway.
//!
//! The socket itself is owned by the session task (`session::run`); a `Peer`
//! is the handle everyone else uses: it queues frames for the session's
//! writer, tracks in-flight calls, and can ask the session to stop.

use crate::error::GatewayError;
use crate::network::address::NetAddress;
use crate::network::message::{Frame, RemoteError, RpcId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

type ResponseSender = oneshot::Sender<Result<Vec<u8>, RemoteError>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

pub struct Peer {
    addr: NetAddress,
    direction: ConnectionDirection,
    remote_version: u32,
    connected_at: i64,
    last_seen: AtomicI64,
    outbound: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<u64, ResponseSender>>,
    next_call_id: AtomicU64,
    /// Held for the whole of an outgoing call so calls on one connection
    /// never overlap.
    call_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl Peer {
    pub(crate) fn new(
        addr: NetAddress,
        direction: ConnectionDirection,
        remote_version: u32,
        outbound: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            addr,
            direction,
            remote_version,
            connected_at: now,
            last_seen: AtomicI64::new(now),
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            call_lock: tokio::sync::Mutex::new(()),
            cancel,
        }
    }

    pub fn addr(&self) -> &NetAddress {
        &self.addr
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == ConnectionDirection::Outbound
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            address: self.addr.clone(),
            direction: self.direction,
            remote_version: self.remote_version,
            connected_at: self.connected_at,
            last_seen: self.last_seen.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn touch(&self) {
        self.last_seen
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Issue `rpc` and wait for the response. Calls on the same peer are
    /// serialized; a call that outlives `timeout`, queueing included, fails
    /// as unreachable.
    pub async fn call_raw(
        &self,
        rpc: RpcId,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, GatewayError> {
        if self.cancel.is_cancelled() {
            return Err(GatewayError::ConnectionClosed);
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let frame = Frame::Call {
            call_id,
            rpc,
            payload,
        };

        let exchange = async move {
            let _turn = self.call_lock.lock().await;
            if self.cancel.is_cancelled() {
                return Err(GatewayError::ConnectionClosed);
            }
            self.pending.lock().insert(call_id, tx);
            if self.outbound.send(frame).await.is_err() {
                return Err(GatewayError::ConnectionClosed);
            }
            // The session may have failed pending calls before ours went in.
            tokio::select! {
                biased;
                response = rx => match response {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(remote)) => Err(GatewayError::Remote(remote.message)),
                    Err(_) => Err(GatewayError::ConnectionClosed),
                },
                _ = self.cancel.cancelled() => Err(GatewayError::ConnectionClosed),
            }
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::unreachable(
                &self.addr,
                format!("{} timed out after {:?}", rpc, timeout),
            )),
        };
        self.pending.lock().remove(&call_id);
        result
    }

    /// Queue a response to a call the remote made. A remote that leaves the
    /// queue full past `timeout` is treated as unreachable.
    pub(crate) async fn respond(
        &self,
        call_id: u64,
        result: Result<Vec<u8>, RemoteError>,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        match tokio::time::timeout(timeout, self.outbound.send(Frame::Response { call_id, result }))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
            Err(_) => Err(GatewayError::unreachable(
                &self.addr,
                format!("response {} not sent within {:?}", call_id, timeout),
            )),
        }
    }

    /// Route a response to the call waiting for it. Returns false if no
    /// call was waiting (it already timed out, or the id is bogus).
    pub(crate) fn complete(&self, call_id: u64, result: Result<Vec<u8>, RemoteError>) -> bool {
        match self.pending.lock().remove(&call_id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop every waiting call; their callers see `ConnectionClosed`.
    pub(crate) fn fail_pending(&self) {
        self.pending.lock().clear();
    }

    /// Ask the session task to close the connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Point-in-time view of a peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub address: NetAddress,
    pub direction: ConnectionDirection,
    pub remote_version: u32,
    pub connected_at: i64,
    pub last_seen: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> (Peer, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        let peer = Peer::new(
            NetAddress::parse("203.0.113.1:9981").unwrap(),
            ConnectionDirection::Outbound,
            1,
            tx,
            CancellationToken::new(),
        );
        (peer, rx)
    }

    #[tokio::test]
    async fn test_call_receives_routed_response() {
        let (peer, mut rx) = test_peer();
        let peer = std::sync::Arc::new(peer);

        let responder = peer.clone();
        let remote = tokio::spawn(async move {
            match rx.recv().await {
                Some(Frame::Call { call_id, rpc, .. }) => {
                    assert_eq!(rpc, RpcId::Ping);
                    assert!(responder.complete(call_id, Ok(vec![9])));
                }
                other => panic!("expected a call, got {:?}", other),
            }
        });

        let response = peer
            .call_raw(RpcId::Ping, vec![], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, vec![9]);
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_is_structured() {
        let (peer, mut rx) = test_peer();
        let peer = std::sync::Arc::new(peer);

        let responder = peer.clone();
        tokio::spawn(async move {
            if let Some(Frame::Call { call_id, .. }) = rx.recv().await {
                responder.complete(call_id, Err(RemoteError::new("nope")));
            }
        });

        let err = peer
            .call_raw(RpcId::RelayNode, vec![], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Remote(msg) if msg == "nope"));
    }

    #[tokio::test]
    async fn test_call_times_out_as_unreachable() {
        let (peer, _rx) = test_peer();
        let err = peer
            .call_raw(RpcId::Ping, vec![], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable { .. }));
        assert!(peer.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_bounds_the_call() {
        let (tx, _rx) = mpsc::channel(1);
        let peer = Peer::new(
            NetAddress::parse("203.0.113.1:9981").unwrap(),
            ConnectionDirection::Inbound,
            1,
            tx.clone(),
            CancellationToken::new(),
        );
        // Nobody drains the queue; the one slot is already taken.
        tx.send(Frame::Response {
            call_id: 0,
            result: Ok(vec![]),
        })
        .await
        .unwrap();

        let started = std::time::Instant::now();
        let err = peer
            .call_raw(RpcId::Ping, vec![], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(peer.pending.lock().is_empty());

        let err = peer
            .respond(7, Ok(vec![]), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_calls_queue_behind_one_timeout() {
        let (peer, _rx) = test_peer();
        let peer = std::sync::Arc::new(peer);

        let first = {
            let peer = peer.clone();
            tokio::spawn(async move {
                peer.call_raw(RpcId::Ping, vec![], Duration::from_millis(200))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Waiting for the first call's turn counts against the second call.
        let started = std::time::Instant::now();
        let err = peer
            .call_raw(RpcId::Ping, vec![], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable { .. }));
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(first.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_close_ends_waiting_call() {
        let (peer, _rx) = test_peer();
        let peer = std::sync::Arc::new(peer);

        let closer = peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        let err = peer
            .call_raw(RpcId::Ping, vec![], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_closed_connection_fails_calls() {
        let (peer, rx) = test_peer();
        drop(rx);
        let err = peer
            .call_raw(RpcId::Ping, vec![], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionClosed));

        peer.close();
        assert!(peer.is_closed());
        assert!(!peer.complete(1, Ok(vec![])));
    }
}
