//! Length-delimited binary framing for transfer streams.
//!
//! # Wire format
//!
//! ```text
//! FRAME:      [4 bytes BE: header_len]
//!             [header_len bytes: header JSON]
//!             [payload_len bytes: raw payload]   (payload_len from header)
//!
//! END MARKER: [4 bytes: 0x00000000]
//! ```
//!
//! Upload bodies carry [`ChunkFrameHeader`] frames; download bodies
//! carry [`DataFrameHeader`] frames. A reader treats both the explicit
//! end marker and a clean EOF at a frame boundary as end of stream.

use crate::constants::MAX_FRAME_HEADER_SIZE;
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors produced by the framing layer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: u64, max: u64 },
}

/// Header of one upload chunk frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkFrameHeader {
    pub session_id: String,
    /// 1-based, strictly increasing within a session.
    pub sequence: u64,
    pub payload_len: u64,
    #[serde(default)]
    pub is_final: bool,
    /// Optional SHA-256 hex of the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Header of one download data frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataFrameHeader {
    /// 1-based, strictly increasing within a stream.
    pub sequence: u64,
    pub payload_len: u64,
    /// Total bytes the stream will carry (range length for ranged
    /// downloads).
    pub total_size: u64,
    #[serde(default)]
    pub is_final: bool,
}

async fn write_frame<W, H>(writer: &mut W, header: &H, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    H: Serialize,
{
    let header_json =
        serde_json::to_vec(header).map_err(|e| FrameError::Protocol(e.to_string()))?;
    if header_json.len() > MAX_FRAME_HEADER_SIZE {
        return Err(FrameError::Protocol(format!(
            "frame header of {} bytes exceeds maximum {MAX_FRAME_HEADER_SIZE}",
            header_json.len()
        )));
    }

    writer.write_u32(header_json.len() as u32).await?;
    writer.write_all(&header_json).await?;
    writer.write_all(payload).await?;
    Ok(())
}

async fn read_frame<R, H>(
    reader: &mut R,
    max_payload: u64,
    payload_len: impl Fn(&H) -> u64,
) -> Result<Option<(H, Bytes)>, FrameError>
where
    R: AsyncRead + Unpin,
    H: DeserializeOwned,
{
    let header_len = match reader.read_u32().await {
        Ok(len) => len,
        // Clean EOF at a frame boundary ends the stream.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FrameError::Io(e)),
    };

    if header_len == 0 {
        return Ok(None);
    }
    if header_len as usize > MAX_FRAME_HEADER_SIZE {
        return Err(FrameError::Protocol(format!(
            "frame header of {header_len} bytes exceeds maximum {MAX_FRAME_HEADER_SIZE}"
        )));
    }

    let mut header_buf = vec![0u8; header_len as usize];
    reader.read_exact(&mut header_buf).await?;
    let header: H =
        serde_json::from_slice(&header_buf).map_err(|e| FrameError::Protocol(e.to_string()))?;

    let len = payload_len(&header);
    if len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some((header, Bytes::from(payload))))
}

/// Write one upload chunk frame.
pub async fn write_chunk_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &ChunkFrameHeader,
    payload: &[u8],
) -> Result<(), FrameError> {
    debug_assert_eq!(header.payload_len, payload.len() as u64);
    write_frame(writer, header, payload).await
}

/// Read one upload chunk frame. Returns `None` at end of stream.
pub async fn read_chunk_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: u64,
) -> Result<Option<(ChunkFrameHeader, Bytes)>, FrameError> {
    read_frame(reader, max_payload, |h: &ChunkFrameHeader| h.payload_len).await
}

/// Write one download data frame.
pub async fn write_data_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &DataFrameHeader,
    payload: &[u8],
) -> Result<(), FrameError> {
    debug_assert_eq!(header.payload_len, payload.len() as u64);
    write_frame(writer, header, payload).await
}

/// Read one download data frame. Returns `None` at end of stream.
pub async fn read_data_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: u64,
) -> Result<Option<(DataFrameHeader, Bytes)>, FrameError> {
    read_frame(reader, max_payload, |h: &DataFrameHeader| h.payload_len).await
}

/// Write the end-of-stream marker.
pub async fn write_end_marker<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), FrameError> {
    writer.write_u32(0).await?;
    Ok(())
}

/// Encode a data frame to a buffer (for stream-based HTTP bodies).
pub fn encode_data_frame(header: &DataFrameHeader, payload: &[u8]) -> Result<Bytes, FrameError> {
    let header_json =
        serde_json::to_vec(header).map_err(|e| FrameError::Protocol(e.to_string()))?;
    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(Bytes::from(buf))
}
