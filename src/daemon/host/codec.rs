//! Native messaging framing: a 4-byte little-endian length followed by a UTF-8 JSON body.

use std::io;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Browsers refuse larger messages, so nothing legitimate exceeds it.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Reads the body of one frame without decoding it. Returns `None` on a clean EOF at a frame
/// boundary.
pub async fn read_frame_bytes<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = usize::try_from(u32::from_le_bytes(len_bytes))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {len} bytes (max: {MAX_FRAME_SIZE} bytes)"),
        ));
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await?;
    Ok(Some(buffer))
}

/// Reads and decodes one frame. Returns `None` on a clean EOF at a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let Some(buffer) = read_frame_bytes(reader).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&buffer)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(message)?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Outgoing message too large: {} bytes", json.len()),
        ));
    }
    let len = u32::try_from(json.len()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[tokio::test]
    async fn test_frames_are_length_prefixed_little_endian() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &json!({"a": 1})).await.unwrap();

        assert_eq!(&buffer[..4], &7u32.to_le_bytes());
        assert_eq!(&buffer[4..], br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_reads_consecutive_frames_then_clean_eof() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, &json!({"n": 1})).await.unwrap();
        write_frame(&mut client, &json!({"n": 2})).await.unwrap();
        drop(client);

        let first: Option<Value> = read_frame(&mut server).await.unwrap();
        let second: Option<Value> = read_frame(&mut server).await.unwrap();
        let end: Option<Value> = read_frame(&mut server).await.unwrap();

        assert_eq!(first, Some(json!({"n": 1})));
        assert_eq!(second, Some(json!({"n": 2})));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let mut input = Vec::new();
        input.extend_from_slice(&(u32::try_from(MAX_FRAME_SIZE).unwrap() + 1).to_le_bytes());
        let error = read_frame::<_, Value>(&mut input.as_slice()).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let mut input = Vec::new();
        input.extend_from_slice(&10u32.to_le_bytes());
        input.extend_from_slice(b"{}");
        assert!(read_frame::<_, Value>(&mut input.as_slice()).await.is_err());
    }
}
