//! Inbound chunk messages for the upload stream.

use crate::digest::ContentDigest;
use crate::session::SessionId;
use bytes::Bytes;

/// One chunk of an upload stream.
///
/// Sequence numbers are 1-based and strictly increasing within a
/// session; duplicates and gaps are rejected.
#[derive(Clone, Debug)]
pub struct ChunkMessage {
    pub session_id: SessionId,
    pub sequence: u64,
    pub payload: Bytes,
    /// Signals that no further chunks follow. The session stays open
    /// until the commit call completes the upload.
    pub is_final: bool,
    /// Optional SHA-256 of this chunk's payload, verified on receipt.
    pub checksum: Option<ContentDigest>,
}

impl ChunkMessage {
    /// Verify the optional per-chunk checksum against the payload.
    pub fn verify_checksum(&self) -> crate::Result<()> {
        match &self.checksum {
            Some(expected) => ContentDigest::of(&self.payload).check(expected),
            None => Ok(()),
        }
    }
}
