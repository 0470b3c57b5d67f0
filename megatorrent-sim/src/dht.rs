//! Simulated distributed key/value network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use megatorrent_core::feed::{DhtRecord, LookupTarget, SIGNATURE_LEN};
use megatorrent_core::resolver::{DhtClient, DhtError};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Misbehaviour injected into lookups for one target.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Hold the lookup for this long before answering normally
    Stall(Duration),
    /// Fail with a transport error
    NetworkError,
    /// Answer with a record carrying a forged signature and a huge sequence
    Hostile,
    /// Answer as if no node stores the record
    Missing,
}

/// Network-wide behaviour of the simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Delay added to every lookup
    pub latency: Duration,
    /// Probability that a lookup is lost (0.0 to 1.0)
    pub loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            loss_rate: 0.0,
        }
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    once: VecDeque<Fault>,
    persistent: Option<Fault>,
}

impl FaultPlan {
    fn next(&mut self) -> Option<Fault> {
        self.once.pop_front().or_else(|| self.persistent.clone())
    }
}

/// In-memory stand-in for the distributed network.
///
/// Records are stored per lookup target and returned verbatim, including
/// lower sequence numbers than before, so tests can replay stale records.
/// Packet loss is drawn from a seeded RNG for reproducible runs.
pub struct SimulatedDht {
    records: Mutex<HashMap<LookupTarget, DhtRecord>>,
    faults: Mutex<HashMap<LookupTarget, FaultPlan>>,
    config: NetworkConfig,
    rng: Mutex<ChaCha8Rng>,
    lookup_count: AtomicU32,
}

impl SimulatedDht {
    /// Creates a loss-free, zero-latency network.
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, NetworkConfig::default())
    }

    /// Creates a network with custom latency and loss.
    pub fn with_config(seed: u64, config: NetworkConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            config,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            lookup_count: AtomicU32::new(0),
        }
    }

    /// Stores `record` under `target`, replacing whatever was there.
    pub fn put(&self, target: LookupTarget, record: DhtRecord) {
        self.records.lock().insert(target, record);
    }

    /// Forgets the record under `target`.
    pub fn clear(&self, target: &LookupTarget) {
        self.records.lock().remove(target);
    }

    /// Applies `fault` to the next lookup of `target` only.
    ///
    /// One-shot faults queue up and are consumed in order.
    pub fn inject_fault(&self, target: LookupTarget, fault: Fault) {
        self.faults.lock().entry(target).or_default().once.push_back(fault);
    }

    /// Applies `fault` to every lookup of `target` until cleared with `None`.
    pub fn set_persistent_fault(&self, target: LookupTarget, fault: Option<Fault>) {
        self.faults.lock().entry(target).or_default().persistent = fault;
    }

    /// Returns number of lookups received.
    pub fn lookup_count(&self) -> u32 {
        self.lookup_count.load(Ordering::Relaxed)
    }

    fn is_lost(&self) -> bool {
        self.config.loss_rate > 0.0 && self.rng.lock().random_bool(self.config.loss_rate.min(1.0))
    }

    fn forged(stored: Option<DhtRecord>) -> DhtRecord {
        let sequence = stored.map_or(0, |record| record.sequence).saturating_add(1_000);
        DhtRecord::new(
            sequence,
            Bytes::from_static(b"ffffffffffffffffffffffffffffffffffffffff"),
            vec![0x42; SIGNATURE_LEN],
        )
    }
}

#[async_trait]
impl DhtClient for SimulatedDht {
    async fn get(&self, target: &LookupTarget) -> Result<Option<DhtRecord>, DhtError> {
        self.lookup_count.fetch_add(1, Ordering::Relaxed);

        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        if self.is_lost() {
            return Err(DhtError::Network {
                reason: "simulated packet loss".to_string(),
            });
        }

        let fault = self.faults.lock().get_mut(target).and_then(FaultPlan::next);
        let stored = self.records.lock().get(target).cloned();

        match fault {
            None => Ok(stored),
            Some(Fault::Stall(duration)) => {
                tracing::trace!("Stalling lookup for {} by {:?}", target, duration);
                tokio::time::sleep(duration).await;
                Ok(self.records.lock().get(target).cloned())
            }
            Some(Fault::NetworkError) => Err(DhtError::Network {
                reason: "simulated network error".to_string(),
            }),
            Some(Fault::Hostile) => Ok(Some(Self::forged(stored))),
            Some(Fault::Missing) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(seed: u8) -> LookupTarget {
        let key = megatorrent_core::FeedKey::new([seed; 32]);
        LookupTarget::for_feed(&key)
    }

    fn record(sequence: u64) -> DhtRecord {
        DhtRecord::new(sequence, &b"payload"[..], vec![0u8; SIGNATURE_LEN])
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let dht = SimulatedDht::new(1);
        assert_eq!(dht.get(&target(1)).await.unwrap(), None);

        dht.put(target(1), record(3));
        assert_eq!(dht.get(&target(1)).await.unwrap(), Some(record(3)));
        assert_eq!(dht.get(&target(2)).await.unwrap(), None);
        assert_eq!(dht.lookup_count(), 3);
    }

    #[tokio::test]
    async fn test_one_shot_faults_are_consumed_in_order() {
        let dht = SimulatedDht::new(1);
        dht.put(target(1), record(3));
        dht.inject_fault(target(1), Fault::Missing);
        dht.inject_fault(target(1), Fault::NetworkError);

        assert_eq!(dht.get(&target(1)).await.unwrap(), None);
        assert!(dht.get(&target(1)).await.is_err());
        assert_eq!(dht.get(&target(1)).await.unwrap(), Some(record(3)));
    }

    #[tokio::test]
    async fn test_persistent_fault_until_cleared() {
        let dht = SimulatedDht::new(1);
        dht.put(target(1), record(3));
        dht.set_persistent_fault(target(1), Some(Fault::Missing));

        for _ in 0..3 {
            assert_eq!(dht.get(&target(1)).await.unwrap(), None);
        }
        dht.set_persistent_fault(target(1), None);
        assert_eq!(dht.get(&target(1)).await.unwrap(), Some(record(3)));
    }

    #[tokio::test]
    async fn test_hostile_record_claims_higher_sequence() {
        let dht = SimulatedDht::new(1);
        dht.put(target(1), record(3));
        dht.inject_fault(target(1), Fault::Hostile);

        let forged = dht.get(&target(1)).await.unwrap().unwrap();
        assert!(forged.sequence > 3);
        assert_eq!(forged.signature.len(), SIGNATURE_LEN);
    }

    #[tokio::test]
    async fn test_packet_loss_is_reproducible() {
        let config = NetworkConfig {
            latency: Duration::ZERO,
            loss_rate: 0.5,
        };
        let mut runs = Vec::new();
        for _ in 0..2 {
            let dht = SimulatedDht::with_config(42, config.clone());
            let mut outcomes = Vec::new();
            for _ in 0..32 {
                outcomes.push(dht.get(&target(1)).await.is_err());
            }
            runs.push(outcomes);
        }
        assert_eq!(runs[0], runs[1]);
        assert!(runs[0].iter().any(|lost| *lost));
        assert!(runs[0].iter().any(|lost| !*lost));
    }
}
