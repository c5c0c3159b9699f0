//! Frame format for [`TcpTransport`](super::TcpTransport).
//!
//! Frame: `[length:4][checksum:4][payload:N]`
//!
//! - **length**: payload size in bytes (little-endian u32)
//! - **checksum**: CRC32C of the payload
//! - **payload**: JSON-encoded [`WireMessage`]

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{NodeRequest, NodeResponse};

/// Header size: 4 (length) + 4 (checksum).
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (1MB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Wire format errors.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Checksum verification failed.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum from the header.
        expected: u32,
        /// Checksum of the received payload.
        actual: u32,
    },

    /// Payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("frame too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    FrameTooLarge {
        /// Offending size.
        size: usize,
    },

    /// JSON encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A request or response tagged with the id that pairs them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Correlation id chosen by the requesting side.
    pub id: u64,
    /// Request or response.
    pub body: WireBody,
}

/// Direction of a [`WireMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireBody {
    /// Client to server.
    Request(NodeRequest),
    /// Server to client.
    Response(NodeResponse),
}

/// Build a frame around `payload`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            size: payload.len(),
        });
    }
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32c::crc32c(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encode and write one message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &WireMessage,
) -> Result<(), WireError> {
    let payload = serde_json::to_vec(message)?;
    let frame = encode_frame(&payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. `Ok(None)` on a clean end of stream.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<WireMessage>, WireError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if length > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge { size: length });
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    let actual = crc32c::crc32c(&payload);
    if actual != expected {
        return Err(WireError::ChecksumMismatch { expected, actual });
    }
    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipRequest;

    #[tokio::test]
    async fn frame_round_trip() {
        let message = WireMessage {
            id: 7,
            body: WireBody::Request(NodeRequest::Membership(MembershipRequest::View)),
        };
        let mut buffer = Vec::new();
        write_message(&mut buffer, &message).await.expect("write");
        let decoded = read_message(&mut buffer.as_slice()).await.expect("read");
        assert_eq!(decoded, Some(message));
    }

    #[tokio::test]
    async fn corrupted_payload_is_rejected() {
        let mut frame = encode_frame(br#"{"id":1}"#).expect("encode");
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let err = read_message(&mut frame.as_slice()).await.expect_err("corrupt");
        assert!(matches!(err, WireError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let empty: &[u8] = &[];
        assert!(read_message(&mut &*empty).await.expect("eof").is_none());
    }

    #[test]
    fn oversized_payload_is_refused() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(WireError::FrameTooLarge { .. })
        ));
    }
}
