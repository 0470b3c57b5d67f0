//! Deterministic feed publisher.

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use megatorrent_core::feed::{DhtRecord, FeedKey, LookupTarget, SIGNATURE_LEN};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::dht::SimulatedDht;

/// Publisher owning a feed's signing key.
///
/// Keys derive from a seed so a scenario always produces the same feeds.
pub struct FeedPublisher {
    signing_key: SigningKey,
    feed_key: FeedKey,
    target: LookupTarget,
    sequence: u64,
}

impl FeedPublisher {
    /// Creates a publisher whose key is derived from `seed`.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        let signing_key = SigningKey::from_bytes(&secret);
        let feed_key = FeedKey::from(signing_key.verifying_key());

        Self {
            target: LookupTarget::for_feed(&feed_key),
            signing_key,
            feed_key,
            sequence: 0,
        }
    }

    /// Public key subscribers use for this feed.
    pub fn feed_key(&self) -> FeedKey {
        self.feed_key
    }

    /// Network slot this feed publishes to.
    pub fn target(&self) -> LookupTarget {
        self.target
    }

    /// Highest sequence published so far, 0 before the first publish.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Signs a record without storing it anywhere.
    pub fn record(&self, sequence: u64, payload: impl Into<Bytes>) -> DhtRecord {
        DhtRecord::sign(&self.signing_key, sequence, payload)
    }

    /// Signs and stores a record with an explicit sequence.
    ///
    /// Lower sequences than before are allowed so stale replays can be staged.
    pub fn publish(&mut self, dht: &SimulatedDht, sequence: u64, payload: impl Into<Bytes>) {
        let record = self.record(sequence, payload);
        tracing::trace!(
            "Publishing seq {} for feed {}",
            sequence,
            self.feed_key.short()
        );
        dht.put(self.target, record);
        self.sequence = self.sequence.max(sequence);
    }

    /// Publishes `payload` under the next sequence and returns that sequence.
    pub fn publish_next(&mut self, dht: &SimulatedDht, payload: impl Into<Bytes>) -> u64 {
        let sequence = self.sequence + 1;
        self.publish(dht, sequence, payload);
        sequence
    }

    /// Record that claims to come from this feed but carries a bad signature.
    pub fn forged_record(&self, sequence: u64, payload: impl Into<Bytes>) -> DhtRecord {
        let mut signature = self.record(sequence, Bytes::from_static(b"original")).signature.to_vec();
        signature[SIGNATURE_LEN - 1] ^= 0xff;
        DhtRecord::new(sequence, payload, signature)
    }
}

/// Hex info hash payload for round `round` of feed `feed`.
pub fn content_hash(feed: usize, round: u64) -> String {
    format!("{:08x}{:032x}", feed, round)
}
