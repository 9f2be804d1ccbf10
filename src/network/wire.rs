//! Length-prefixed bincode framing for gateway connections.
//!
//! Frame format: [4-byte length (u32 big-endian)][bincode payload]
//! Maximum frame size: 4MB

use crate::error::WireError;
use crate::network::message::Frame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Serialize a frame and write it, flushing before returning.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), WireError> {
    let payload = bincode::serialize(frame)?;

    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns Ok(None) on clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>, WireError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Some(bincode::deserialize(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::RpcId;

    #[tokio::test]
    async fn test_call_frame_survives_the_wire() {
        let frame = Frame::Call {
            call_id: 42,
            rpc: RpcId::RelayNode,
            payload: vec![1, 2, 3],
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        assert_eq!(&buf[..4], &((buf.len() - 4) as u32).to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        match read_frame(&mut cursor).await.unwrap().unwrap() {
            Frame::Call {
                call_id,
                rpc,
                payload,
            } => {
                assert_eq!(call_id, 42);
                assert_eq!(rpc, RpcId::RelayNode);
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("unexpected frame {}", other.frame_type()),
        }
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut cursor = std::io::Cursor::new(len.to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0, 0, 0]);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(read_frame(&mut cursor).await, Err(WireError::Io(_))));
    }
}
