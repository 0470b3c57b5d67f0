//! Signed feed records and the v1 wire convention.
//!
//! Signed message: `"megatorrent/v1/record" || seq (u64 BE) || len (u64 BE) || payload`.
//! Lookup target: `SHA-1(public_key || "megatorrent/v1/feed")`.

use std::fmt;

use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};
use sha1::{Digest, Sha1};

use super::FeedKey;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Largest payload a record may carry (same bound as BEP 44 mutable items).
pub const MAX_PAYLOAD_SIZE: usize = 1000;

const RECORD_DOMAIN: &[u8] = b"megatorrent/v1/record";
const TARGET_SALT: &[u8] = b"megatorrent/v1/feed";

/// Slot on the distributed network where a feed's record is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupTarget([u8; 20]);

impl LookupTarget {
    /// Derives the lookup target for a feed key.
    pub fn for_feed(key: &FeedKey) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        hasher.update(TARGET_SALT);
        let digest = hasher.finalize();

        let mut target = [0u8; 20];
        target.copy_from_slice(&digest);
        Self(target)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for LookupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Record as returned by a network lookup.
///
/// Nothing about it is trusted: the signature may be forged, the payload
/// may be garbage and the sequence number may go backwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtRecord {
    pub sequence: u64,
    pub payload: Bytes,
    pub signature: Bytes,
}

impl DhtRecord {
    pub fn new(sequence: u64, payload: impl Into<Bytes>, signature: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            payload: payload.into(),
            signature: signature.into(),
        }
    }

    /// Builds a record signed under the v1 convention.
    pub fn sign(signing_key: &SigningKey, sequence: u64, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let signature = signing_key.sign(&signable_bytes(sequence, &payload));
        Self {
            sequence,
            payload,
            signature: Bytes::copy_from_slice(&signature.to_bytes()),
        }
    }
}

/// Canonical bytes covered by a record signature.
pub fn signable_bytes(sequence: u64, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(RECORD_DOMAIN.len() + 16 + payload.len());
    message.extend_from_slice(RECORD_DOMAIN);
    message.extend_from_slice(&sequence.to_be_bytes());
    message.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    message.extend_from_slice(payload);
    message
}
