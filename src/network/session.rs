//! Per-peer connection loop.
//!
//! Each established peer gets one session: a writer task draining the
//! peer's outbound queue, and a reader loop that dispatches incoming calls
//! to their handlers and routes responses to waiting callers. When either
//! half stops the whole session stops, and the gateway is told so it can
//! drop the peer.
//!
//! A remote that stops reading cannot hold the session open: socket writes
//! are bounded by the RPC timeout, and a remote that piles up more calls
//! than `MAX_INFLIGHT_CALLS` is cut off.

use crate::constants::peers::MAX_INFLIGHT_CALLS;
use crate::error::{GatewayError, WireError};
use crate::gateway::Gateway;
use crate::network::message::{Frame, RemoteError};
use crate::network::peer::Peer;
use crate::network::wire::{read_frame, write_frame};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};

pub(crate) async fn run(
    gateway: Arc<Gateway>,
    peer: Arc<Peer>,
    stream: TcpStream,
    mut outbound: mpsc::Receiver<Frame>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let cancel = peer.cancel_token().clone();
    let write_timeout = gateway.settings().rpc_timeout;
    let inflight = Arc::new(Semaphore::new(MAX_INFLIGHT_CALLS));

    let writer_cancel = cancel.clone();
    let writer_addr = peer.addr().clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        let write = tokio::time::timeout(write_timeout, write_frame(&mut writer, &frame));
                        let written = tokio::select! {
                            _ = writer_cancel.cancelled() => break,
                            written = write => written,
                        };
                        match written {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                tracing::debug!("Write to {} failed: {}", writer_addr, e);
                                break;
                            }
                            Err(_) => {
                                tracing::debug!("Write to {} stalled for {:?}", writer_addr, write_timeout);
                                break;
                            }
                        }
                    }
                    None => break,
                },
            }
        }
        writer_cancel.cancel();
        let _ = writer.shutdown().await;
    });

    let untrusted = loop {
        tokio::select! {
            _ = cancel.cancelled() => break false,
            read = read_frame(&mut reader) => match read {
                Ok(Some(Frame::Call { call_id, rpc, payload })) => {
                    peer.touch();
                    let handler = match gateway.registry().handler(rpc) {
                        Some(handler) => handler,
                        None => {
                            tracing::warn!("🚫 {} called {} which has no handler", peer.addr(), rpc);
                            break true;
                        }
                    };
                    let permit = match inflight.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "🚫 {} has more than {} calls in flight",
                                peer.addr(),
                                MAX_INFLIGHT_CALLS
                            );
                            break true;
                        }
                    };
                    tracing::trace!("📥 {} from {} (call {})", rpc, peer.addr(), call_id);

                    let gateway = gateway.clone();
                    let peer = peer.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let result = handler.handle(&gateway, &peer, payload).await;
                        if let Err(RemoteError { message }) = &result {
                            tracing::debug!("{} from {} failed: {}", rpc, peer.addr(), message);
                        }
                        let timeout = gateway.settings().rpc_timeout;
                        match peer.respond(call_id, result, timeout).await {
                            Ok(()) => {}
                            Err(e @ GatewayError::Unreachable { .. }) => {
                                tracing::debug!("{} is not reading: {}", peer.addr(), e);
                                peer.close();
                            }
                            Err(e) => {
                                tracing::debug!("Could not answer {} from {}: {}", rpc, peer.addr(), e);
                            }
                        }
                    });
                }
                Ok(Some(Frame::Response { call_id, result })) => {
                    peer.touch();
                    if !peer.complete(call_id, result) {
                        tracing::trace!("Late or unknown response {} from {}", call_id, peer.addr());
                    }
                }
                Ok(Some(other)) => {
                    tracing::warn!(
                        "🚫 {} sent {} after the handshake",
                        peer.addr(),
                        other.frame_type()
                    );
                    break true;
                }
                Ok(None) => {
                    tracing::debug!("🔌 {} closed the connection", peer.addr());
                    break false;
                }
                Err(WireError::Io(e)) => {
                    tracing::debug!("🔌 Read from {} failed: {}", peer.addr(), e);
                    break false;
                }
                Err(e) => {
                    tracing::warn!("🚫 Protocol violation from {}: {}", peer.addr(), e);
                    break true;
                }
            },
        }
    };

    peer.close();
    peer.fail_pending();
    let _ = writer_task.await;
    gateway.on_peer_closed(&peer, untrusted);

    tracing::info!(
        "🔌 Connection to {} ended{}",
        peer.addr(),
        if untrusted { " (untrusted)" } else { "" }
    );
}
