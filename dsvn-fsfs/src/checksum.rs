//! Digests and the streaming checksum verifier
//!
//! The verifier is the only integrity gate on the read path: every byte a
//! `RepReader` hands out passes through it, and the stored MD5 (and SHA-1,
//! when configured) is compared once the declared length has been produced.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::error::{FsError, Result};

/// MD5 digest of a representation's expanded contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Md5Digest(pub [u8; 16]);

/// SHA-1 digest of a representation's expanded contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1Digest(pub [u8; 20]);

impl Md5Digest {
    pub fn of(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let mut arr = [0u8; 16];
        hex::decode_to_slice(hex_str, &mut arr)
            .map_err(|_| FsError::corrupt(format!("Malformed MD5 digest '{}'", hex_str)))?;
        Ok(Self(arr))
    }
}

impl Sha1Digest {
    pub fn of(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let mut arr = [0u8; 20];
        hex::decode_to_slice(hex_str, &mut arr)
            .map_err(|_| FsError::corrupt(format!("Malformed SHA1 digest '{}'", hex_str)))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

const FNV1_PRIME_32: u32 = 0x0100_0193;
const FNV1_BASE_32: u32 = 0x811c_9dc5;

fn fnv1a_32(mut hash: u32, data: &[u8]) -> u32 {
    for &byte in data {
        hash = (hash ^ u32::from(byte)).wrapping_mul(FNV1_PRIME_32);
    }
    hash
}

/// Checksum stored with every P2L entry: four FNV-1a hashes over
/// interleaved bytes, folded with the unaligned tail by a final FNV-1a.
pub fn fnv1a_32x4(data: &[u8]) -> u32 {
    let mut hashes = [FNV1_BASE_32; 4];
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        for (hash, &byte) in hashes.iter_mut().zip(chunk) {
            *hash = (*hash ^ u32::from(byte)).wrapping_mul(FNV1_PRIME_32);
        }
    }
    let mut folded = Vec::with_capacity(16 + 3);
    for hash in hashes {
        folded.extend_from_slice(&hash.to_be_bytes());
    }
    folded.extend_from_slice(chunks.remainder());
    fnv1a_32(FNV1_BASE_32, &folded)
}

/// Accumulates digests over a decoded stream and checks them at the end
pub struct ChecksumVerifier {
    context: String,
    md5: md5::Context,
    expected_md5: Md5Digest,
    sha1: Option<(Sha1, Sha1Digest)>,
    seen: u64,
    finalized: bool,
}

impl ChecksumVerifier {
    /// `context` names the stream in error messages (usually the rep locator).
    pub fn new(context: String, expected_md5: Md5Digest, expected_sha1: Option<Sha1Digest>) -> Self {
        Self {
            context,
            md5: md5::Context::new(),
            expected_md5,
            sha1: expected_sha1.map(|digest| (Sha1::new(), digest)),
            seen: 0,
            finalized: false,
        }
    }

    /// The stored digest, handed out without verification to callers that
    /// forward deltas instead of decoding them.
    pub fn stored_md5(&self) -> Md5Digest {
        self.expected_md5
    }

    pub fn bytes_seen(&self) -> u64 {
        self.seen
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn update(&mut self, data: &[u8]) {
        if self.finalized {
            return;
        }
        self.md5.consume(data);
        if let Some((hasher, _)) = self.sha1.as_mut() {
            hasher.update(data);
        }
        self.seen += data.len() as u64;
    }

    /// Finalize and compare. Calling it twice is a no-op.
    pub fn finish(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let md5 = std::mem::replace(&mut self.md5, md5::Context::new());
        let actual = Md5Digest(md5.compute().0);
        if actual != self.expected_md5 {
            tracing::warn!("MD5 mismatch reading {}", self.context);
            return Err(FsError::ChecksumMismatch {
                context: self.context.clone(),
                expected: self.expected_md5.to_hex(),
                actual: actual.to_hex(),
            });
        }

        if let Some((hasher, expected)) = self.sha1.take() {
            let actual = Sha1Digest(hasher.finalize().into());
            if actual != expected {
                tracing::warn!("SHA1 mismatch reading {}", self.context);
                return Err(FsError::ChecksumMismatch {
                    context: self.context.clone(),
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                });
            }
        }
        Ok(())
    }
}
