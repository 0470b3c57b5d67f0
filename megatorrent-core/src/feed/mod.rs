//! Feed identity, signed records and content locators.
//!
//! A feed is identified by an Ed25519 public key. Its current pointer lives
//! on the distributed key/value network as a signed record carrying a
//! sequence number and a payload naming the content to fetch.

pub mod locator;
pub mod record;
pub mod verifier;

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use locator::{ContentLocator, InvalidLocator};
pub use record::{
    DhtRecord, LookupTarget, MAX_PAYLOAD_SIZE, SIGNATURE_LEN, signable_bytes,
};
pub use verifier::{RejectReason, Verification, verify_record};

/// Length of a feed public key in bytes.
pub const FEED_KEY_LEN: usize = 32;

/// URI scheme accepted in front of a hex public key.
pub const FEED_URI_SCHEME: &str = "megatorrent://";

/// Error returned when text cannot be turned into a feed key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid feed key: {reason}")]
pub struct InvalidFeedKey {
    pub reason: String,
}

/// Ed25519 public key identifying a feed.
///
/// The textual form is 64 lowercase hex characters, optionally wrapped in a
/// `megatorrent://` URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedKey([u8; FEED_KEY_LEN]);

impl FeedKey {
    /// Creates a feed key from raw bytes without checking the curve point.
    pub fn new(bytes: [u8; FEED_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns reference to the underlying 32-byte key.
    pub fn as_bytes(&self) -> &[u8; FEED_KEY_LEN] {
        &self.0
    }

    /// Parses a hex key or `megatorrent://<hex>[:extra][/blob]` URI.
    ///
    /// The key must decode to a valid Ed25519 point; anything else could
    /// never verify a record and is refused up front.
    ///
    /// # Errors
    ///
    /// - `InvalidFeedKey` - Wrong length, non-hex characters or not a curve point
    pub fn parse(input: &str) -> Result<Self, InvalidFeedKey> {
        let trimmed = input.trim();
        let key_text = match trimmed.strip_prefix(FEED_URI_SCHEME) {
            Some(rest) => {
                let authority = rest.split('/').next().unwrap_or_default();
                authority.split(':').next().unwrap_or_default()
            }
            None => trimmed,
        };

        if key_text.len() != FEED_KEY_LEN * 2 {
            return Err(InvalidFeedKey {
                reason: format!(
                    "expected {} hex characters, got {}",
                    FEED_KEY_LEN * 2,
                    key_text.len()
                ),
            });
        }

        let mut bytes = [0u8; FEED_KEY_LEN];
        hex::decode_to_slice(key_text, &mut bytes).map_err(|e| InvalidFeedKey {
            reason: e.to_string(),
        })?;

        VerifyingKey::from_bytes(&bytes).map_err(|_| InvalidFeedKey {
            reason: "not a valid Ed25519 public key".to_string(),
        })?;

        Ok(Self(bytes))
    }

    /// Returns the `megatorrent://` URI for this key.
    pub fn to_uri(&self) -> String {
        format!("{FEED_URI_SCHEME}{self}")
    }

    /// Short prefix used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl From<VerifyingKey> for FeedKey {
    fn from(key: VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for FeedKey {
    type Err = InvalidFeedKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for FeedKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FeedKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// SHA-1 hash identifying a torrent.
///
/// Content locators resolve to an info hash; the transfer subsystem uses it
/// to find the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;

    fn valid_key() -> FeedKey {
        FeedKey::from(SigningKey::from_bytes(&[7u8; 32]).verifying_key())
    }

    #[test]
    fn test_feed_key_hex_roundtrip() {
        let key = valid_key();
        let parsed = FeedKey::parse(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_feed_key_accepts_uri_forms() {
        let key = valid_key();
        assert_eq!(FeedKey::parse(&key.to_uri()).unwrap(), key);
        assert_eq!(
            FeedKey::parse(&format!("megatorrent://{key}:secret/abcdef")).unwrap(),
            key
        );
        assert_eq!(FeedKey::parse(&format!("  {key}\n")).unwrap(), key);
    }

    #[test]
    fn test_feed_key_rejects_bad_input() {
        assert!(FeedKey::parse("").is_err());
        assert!(FeedKey::parse("abcd").is_err());
        assert!(FeedKey::parse(&"zz".repeat(32)).is_err());
        assert!(FeedKey::parse("megatorrent://").is_err());
    }

    #[test]
    fn test_feed_key_serde_as_hex_string() {
        let key = valid_key();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{key}\""));
        let back: FeedKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        assert_eq!(
            InfoHash::new(hash).to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }
}
