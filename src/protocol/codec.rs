//! Frame codec for the worker stdio transport.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ type(1B) │   JSON payload         │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(type byte) + sizeof(payload), NOT including the 4-byte prefix.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::WorkerMessage;

/// Frame type: JSON-encoded `WorkerMessage`.
pub const FRAME_JSON: u8 = 0x01;

/// Read one frame from the stream.
///
/// Returns `(frame_type, payload_bytes)`. Returns `None` on clean EOF.
/// `max_frame_bytes` caps the maximum accepted payload size.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Frame too short: missing type byte",
        ));
    }

    let mut frame_data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame_data).await?;

    let frame_type = frame_data[0];
    let payload = frame_data.split_off(1);

    Ok(Some((frame_type, payload)))
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame_len = 1u32 + payload.len() as u32;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[frame_type]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write a message as a `FRAME_JSON` frame.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &WorkerMessage,
) -> std::io::Result<()> {
    let payload = serde_json::to_vec(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write_frame(writer, FRAME_JSON, &payload).await
}

/// Read frames until one decodes to a message, or EOF.
///
/// Frames of another type and payloads that don't decode are malformed and
/// dropped silently.
pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<WorkerMessage>> {
    while let Some((frame_type, payload)) = read_frame(reader, max_frame_bytes).await? {
        if frame_type != FRAME_JSON {
            tracing::debug!("Dropping frame of unknown type 0x{:02X}", frame_type);
            continue;
        }
        match serde_json::from_slice::<WorkerMessage>(&payload) {
            Ok(message) => return Ok(Some(message)),
            Err(e) => tracing::debug!("Dropping malformed message: {}", e),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Digest;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FRAME_JSON, b"{}").await.unwrap();
        assert_eq!(&buf[..4], &3u32.to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let (frame_type, payload) = read_frame(&mut cursor, 1024).await.unwrap().unwrap();
        assert_eq!(frame_type, FRAME_JSON);
        assert_eq!(payload, b"{}");
        assert!(read_frame(&mut cursor, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FRAME_JSON, &[0u8; 64]).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let mut cursor = Cursor::new(0u32.to_be_bytes().to_vec());
        assert!(read_frame(&mut cursor, 16).await.is_err());
    }

    #[tokio::test]
    async fn test_read_message_skips_malformed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FRAME_JSON, b"not json").await.unwrap();
        write_frame(&mut buf, 0x7F, b"{}").await.unwrap();
        let digest = Digest::from_string("d1").unwrap();
        write_message(&mut buf, &WorkerMessage::undeploy(digest.clone()))
            .await
            .unwrap();

        let mut cursor = Cursor::new(buf);
        let message = read_message(&mut cursor, 1024).await.unwrap().unwrap();
        assert_eq!(message.digest, Some(digest));
        assert!(read_message(&mut cursor, 1024).await.unwrap().is_none());
    }
}
