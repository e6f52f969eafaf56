//! Length-prefixed JSON framing for the kernel service connection.
//!
//! Every message on the wire is a single frame:
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)] [JSON payload bytes]
//! ```
//!
//! The first frame on a connection is the client's [`Handshake`], answered by
//! a single [`HandshakeReply`](crate::protocol::HandshakeReply). After that,
//! every frame carries an event [`Envelope`](crate::protocol::Envelope).

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size for event frames: 16 MiB.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum frame size for the handshake exchange: 64 KiB.
/// The service's reply is read before the session is authenticated, so it
/// must not be able to force a large allocation.
const MAX_HANDSHAKE_FRAME_SIZE: usize = 64 * 1024;

/// Session handshake, the first frame the client sends on every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// Opaque session credential from the authentication provider.
    pub token: String,
    /// Random per-process identifier, stable across reconnects.
    pub client_id: String,
    pub client_version: String,
}

/// Send a length-prefixed frame.
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame too large to send: {} bytes", data.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a length-prefixed frame with a caller-specified size limit.
/// Returns `None` on clean disconnect (EOF).
async fn recv_frame_with_limit<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, max_size),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Receive a length-prefixed event frame (up to 16 MiB).
/// Returns `None` on clean disconnect (EOF).
pub async fn recv_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    recv_frame_with_limit(reader, MAX_FRAME_SIZE).await
}

/// Receive a frame with the handshake size limit (64 KiB).
pub async fn recv_handshake_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    recv_frame_with_limit(reader, MAX_HANDSHAKE_FRAME_SIZE).await
}

/// Send a value as a JSON-encoded length-prefixed frame.
pub async fn send_json_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> std::io::Result<()> {
    let data = serde_json::to_vec(value)?;
    send_frame(writer, &data).await
}

/// Receive and deserialize a JSON-encoded length-prefixed frame.
/// Returns `None` on clean disconnect (EOF).
pub async fn recv_json_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> std::io::Result<Option<T>> {
    match recv_frame(reader).await? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}
