//! Connection handshake.
//!
//! The dialer sends its `Handshake` first; the acceptor answers with its own
//! `Handshake` or a `HandshakeReject`. Nothing else may be sent until both
//! sides have one.

use crate::constants::protocol::MIN_PROTOCOL_VERSION;
use crate::error::GatewayError;
use crate::network::address::NetAddress;
use crate::network::message::{Frame, Handshake, RejectReason};
use crate::network::wire::{read_frame, write_frame};
use tokio::io::{AsyncRead, AsyncWrite};

/// Dialer side: send ours, wait for theirs.
pub async fn initiate<S>(
    stream: &mut S,
    ours: &Handshake,
    remote: &NetAddress,
) -> Result<Handshake, GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &Frame::Handshake(ours.clone()))
        .await
        .map_err(|e| GatewayError::unreachable(remote, e.to_string()))?;

    match read_frame(stream).await {
        Ok(Some(Frame::Handshake(theirs))) => {
            check_version(&theirs)?;
            Ok(theirs)
        }
        Ok(Some(Frame::HandshakeReject(reason))) => Err(match reason {
            RejectReason::SelfConnect => GatewayError::SelfConnect(remote.clone()),
            RejectReason::AlreadyConnected => GatewayError::AlreadyConnected(remote.clone()),
            RejectReason::PeerLimitReached => GatewayError::unreachable(remote, reason.to_string()),
            RejectReason::IncompatibleVersion => {
                GatewayError::ProtocolViolation(format!("{} rejected us: {}", remote, reason))
            }
        }),
        Ok(Some(other)) => Err(GatewayError::ProtocolViolation(format!(
            "expected handshake from {}, got {}",
            remote,
            other.frame_type()
        ))),
        Ok(None) => Err(GatewayError::unreachable(
            remote,
            "connection closed during handshake",
        )),
        Err(e) => Err(GatewayError::unreachable(remote, e.to_string())),
    }
}

/// Acceptor side: the first frame must be a handshake.
pub async fn receive<S>(stream: &mut S) -> Result<Handshake, GatewayError>
where
    S: AsyncRead + Unpin,
{
    match read_frame(stream).await? {
        Some(Frame::Handshake(theirs)) => Ok(theirs),
        Some(other) => Err(GatewayError::ProtocolViolation(format!(
            "first frame must be a handshake, got {}",
            other.frame_type()
        ))),
        None => Err(GatewayError::ConnectionClosed),
    }
}

pub async fn accept<S>(stream: &mut S, ours: &Handshake) -> Result<(), GatewayError>
where
    S: AsyncWrite + Unpin,
{
    write_frame(stream, &Frame::Handshake(ours.clone())).await?;
    Ok(())
}

/// Best-effort: the connection is dropped right after either way.
pub async fn reject<S>(stream: &mut S, reason: RejectReason)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = write_frame(stream, &Frame::HandshakeReject(reason)).await {
        tracing::debug!("Failed to send handshake reject ({}): {}", reason, e);
    }
}

pub fn check_version(theirs: &Handshake) -> Result<(), GatewayError> {
    if theirs.protocol_version < MIN_PROTOCOL_VERSION {
        return Err(GatewayError::ProtocolViolation(format!(
            "unsupported protocol version {} (min {})",
            theirs.protocol_version, MIN_PROTOCOL_VERSION
        )));
    }
    Ok(())
}
