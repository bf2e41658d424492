//! Artifact digests.
//!
//! Uploads are digested incrementally as chunks arrive (a [`Digester`]
//! lives on the ingest path), and the resulting [`ContentDigest`] is
//! checked against whatever the caller pinned at initiate or supplied
//! at commit.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A SHA-256 digest of artifact content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Digest a complete byte slice in one shot.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Parse a 64-character hex digest.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        s.parse()
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        use fmt::Write;
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Compare this (computed) digest against an expected one.
    ///
    /// The mismatch error carries both renderings so failure progress
    /// snapshots and logs can name them.
    pub fn check(&self, expected: &ContentDigest) -> crate::Result<()> {
        if self != expected {
            return Err(crate::Error::DigestMismatch {
                expected: expected.to_hex(),
                actual: self.to_hex(),
            });
        }
        Ok(())
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl FromStr for ContentDigest {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let raw = s.as_bytes();
        if raw.len() != 64 {
            return Err(crate::Error::InvalidDigest(format!(
                "expected 64 hex chars, got {}",
                raw.len()
            )));
        }

        let mut bytes = [0u8; 32];
        for (i, slot) in bytes.iter_mut().enumerate() {
            let hi = hex_value(raw[2 * i]);
            let lo = hex_value(raw[2 * i + 1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => *slot = (hi << 4) | lo,
                _ => {
                    return Err(crate::Error::InvalidDigest(format!(
                        "non-hex character at position {}",
                        2 * i
                    )));
                }
            }
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First four bytes are plenty to correlate log lines.
        write!(
            f,
            "ContentDigest({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Rolling SHA-256 over a byte stream.
///
/// Fed chunk by chunk on the ingest path so commits never re-read the
/// accumulated artifact; finished into a [`ContentDigest`] exactly once.
#[derive(Default)]
pub struct Digester {
    inner: Sha256,
}

impl Digester {
    /// Start a fresh digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the digest.
    pub fn absorb(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    /// Consume the digester, yielding the final digest.
    pub fn finish(self) -> ContentDigest {
        ContentDigest(self.inner.finalize().into())
    }
}
