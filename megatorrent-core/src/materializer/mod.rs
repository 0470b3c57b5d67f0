//! Hands resolved feed payloads to the transfer subsystem.
//!
//! Materialization is best effort. A failed add or update never rolls back
//! the registry commit; the feed is remembered as pending and picked up
//! again by the next accepted resolution or by an explicit reconcile pass.
//! Work for one feed is serialized, and a payload older than the one last
//! handed over is never sent.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::feed::{ContentLocator, FeedKey};
use crate::registry::SubscriptionRegistry;

/// Identifier of a transfer owned by the transfer subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors reported by the transfer subsystem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("Transfer rejected: {reason}")]
    Rejected { reason: String },

    #[error("Transfer not found")]
    NotFound,

    /// Unreachable, or did not answer within the transfer timeout
    #[error("Transfer subsystem unavailable")]
    Unavailable,
}

/// Add-or-update surface of the torrent transfer subsystem.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Starts a new transfer for `locator`, tagged with `label`.
    async fn add_transfer(
        &self,
        locator: &ContentLocator,
        label: &str,
    ) -> Result<TransferId, TransferError>;

    /// Redirects an existing transfer to `locator`.
    async fn update_transfer(
        &self,
        id: TransferId,
        locator: &ContentLocator,
    ) -> Result<(), TransferError>;
}

/// What a successful materialization did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeAction {
    Added(TransferId),
    Updated(TransferId),
    /// The transfer already carries this sequence or a newer one
    Current,
}

/// Summary of a reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct MaterializerState {
    transfers: HashMap<FeedKey, TransferId>,
    /// Sequence last handed to the transfer subsystem per feed
    sequences: HashMap<FeedKey, u64>,
    pending: HashSet<FeedKey>,
    locks: HashMap<FeedKey, Arc<tokio::sync::Mutex<()>>>,
}

impl MaterializerState {
    fn is_current(&self, public_key: &FeedKey, sequence: u64) -> bool {
        match self.sequences.get(public_key) {
            Some(&done) if done > sequence => true,
            Some(&done) if done == sequence => {
                !self.pending.contains(public_key) && self.transfers.contains_key(public_key)
            }
            _ => false,
        }
    }

    fn needs_reconcile(&self, public_key: &FeedKey) -> bool {
        self.pending.contains(public_key) || !self.transfers.contains_key(public_key)
    }
}

/// Tracks which transfer belongs to which feed.
pub struct Materializer {
    client: Arc<dyn TransferClient>,
    transfer_timeout: Duration,
    state: Mutex<MaterializerState>,
}

impl Materializer {
    pub fn new(client: Arc<dyn TransferClient>, config: &TransferConfig) -> Self {
        Self {
            client,
            transfer_timeout: config.transfer_timeout,
            state: Mutex::new(MaterializerState::default()),
        }
    }

    /// Adds a transfer for a new feed or redirects the feed's existing one.
    ///
    /// A transfer that vanished on the other side is re-added. Waits for any
    /// other materialization of the same feed to finish first, and does
    /// nothing if `sequence` is older than what was last handed over.
    ///
    /// # Errors
    ///
    /// - `TransferError` - Transfer subsystem refused, was unreachable or timed out; the feed is marked pending
    pub async fn materialize(
        &self,
        public_key: FeedKey,
        sequence: u64,
        locator: &ContentLocator,
        label: &str,
    ) -> Result<MaterializeAction, TransferError> {
        let lock = self.key_lock(public_key);
        let _guard = lock.lock().await;
        self.materialize_locked(public_key, sequence, locator, label)
            .await
    }

    async fn materialize_locked(
        &self,
        public_key: FeedKey,
        sequence: u64,
        locator: &ContentLocator,
        label: &str,
    ) -> Result<MaterializeAction, TransferError> {
        let existing = {
            let state = self.state.lock();
            if state.is_current(&public_key, sequence) {
                tracing::debug!(
                    "Feed {} already materialized at or past sequence {}",
                    public_key.short(),
                    sequence
                );
                return Ok(MaterializeAction::Current);
            }
            state.transfers.get(&public_key).copied()
        };

        let result = match existing {
            Some(id) => match self
                .within_deadline(self.client.update_transfer(id, locator))
                .await
            {
                Ok(()) => Ok(MaterializeAction::Updated(id)),
                Err(TransferError::NotFound) => {
                    tracing::debug!(
                        "Transfer {} for feed {} disappeared, re-adding",
                        id,
                        public_key.short()
                    );
                    self.add(public_key, locator, label).await
                }
                Err(e) => Err(e),
            },
            None => self.add(public_key, locator, label).await,
        };

        let mut state = self.state.lock();
        match &result {
            Ok(action) => {
                state.pending.remove(&public_key);
                state.sequences.insert(public_key, sequence);
                tracing::info!(
                    "Materialized feed {} ({}) seq {} -> {:?} {}",
                    public_key.short(),
                    label,
                    sequence,
                    action,
                    locator.info_hash()
                );
            }
            Err(e) => {
                state.pending.insert(public_key);
                tracing::warn!(
                    "Could not materialize feed {} ({}): {}",
                    public_key.short(),
                    label,
                    e
                );
            }
        }
        result
    }

    async fn add(
        &self,
        public_key: FeedKey,
        locator: &ContentLocator,
        label: &str,
    ) -> Result<MaterializeAction, TransferError> {
        let id = self
            .within_deadline(self.client.add_transfer(locator, label))
            .await?;
        self.state.lock().transfers.insert(public_key, id);
        Ok(MaterializeAction::Added(id))
    }

    async fn within_deadline<T>(
        &self,
        call: impl Future<Output = Result<T, TransferError>>,
    ) -> Result<T, TransferError> {
        match tokio::time::timeout(self.transfer_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "Transfer subsystem did not answer within {:?}",
                    self.transfer_timeout
                );
                Err(TransferError::Unavailable)
            }
        }
    }

    /// Re-materializes resolved feeds with a pending failure or no transfer.
    ///
    /// Each feed is re-read from `registry` once its lock is held, so a pass
    /// never hands over a payload a worker has already replaced.
    pub async fn reconcile(&self, registry: &SubscriptionRegistry) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for listed in registry.list() {
            let public_key = listed.public_key;
            if listed.last_payload.is_none() || !self.needs_reconcile(&public_key) {
                continue;
            }

            let lock = self.key_lock(public_key);
            let _guard = lock.lock().await;

            let Ok(current) = registry.snapshot(&public_key) else {
                continue;
            };
            let (Some(sequence), Some(locator)) = (current.last_sequence, &current.last_payload)
            else {
                continue;
            };
            if !self.needs_reconcile(&public_key) {
                continue;
            }

            report.attempted += 1;
            match self
                .materialize_locked(public_key, sequence, locator, &current.label)
                .await
            {
                Ok(_) => report.succeeded += 1,
                Err(_) => report.failed += 1,
            }

            if registry.snapshot(&public_key).is_err() {
                self.forget(&public_key);
            }
        }

        tracing::debug!(
            "Reconcile pass: {} attempted, {} succeeded, {} failed",
            report.attempted,
            report.succeeded,
            report.failed
        );
        report
    }

    fn needs_reconcile(&self, public_key: &FeedKey) -> bool {
        self.state.lock().needs_reconcile(public_key)
    }

    fn key_lock(&self, public_key: FeedKey) -> Arc<tokio::sync::Mutex<()>> {
        self.state
            .lock()
            .locks
            .entry(public_key)
            .or_default()
            .clone()
    }

    /// Drops everything known about a removed feed.
    pub fn forget(&self, public_key: &FeedKey) {
        let mut state = self.state.lock();
        state.transfers.remove(public_key);
        state.sequences.remove(public_key);
        state.pending.remove(public_key);
    }

    pub fn transfer_for(&self, public_key: &FeedKey) -> Option<TransferId> {
        self.state.lock().transfers.get(public_key).copied()
    }

    pub fn is_pending(&self, public_key: &FeedKey) -> bool {
        self.state.lock().pending.contains(public_key)
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::registry::ResolutionTicket;
    use crate::resolver::ResolutionOutcome;
    use crate::scheduler::{DueQueue, QueuePoll};
    use crate::test_mocks::{MockTransferCall, MockTransfers};

    const P1: &str = "1111111111111111111111111111111111111111";
    const P2: &str = "2222222222222222222222222222222222222222";

    fn locator(text: &str) -> ContentLocator {
        ContentLocator::parse(text.as_bytes()).unwrap()
    }

    fn materializer(transfers: &Arc<MockTransfers>) -> Materializer {
        Materializer::new(
            transfers.clone(),
            &TransferConfig {
                transfer_timeout: Duration::from_millis(50),
            },
        )
    }

    fn registry_with(key: FeedKey) -> (SubscriptionRegistry, ResolutionTicket) {
        let queue = Arc::new(DueQueue::new());
        let registry = SubscriptionRegistry::new(queue.clone(), 3);
        registry.add(key, "feed-A").unwrap();
        let QueuePoll::Due(ticket) = queue.poll(Instant::now()) else {
            panic!("new subscription must be due");
        };
        (registry, ticket)
    }

    fn commit(
        registry: &SubscriptionRegistry,
        ticket: &ResolutionTicket,
        sequence: u64,
        payload: &str,
    ) {
        registry.apply_resolution(
            ticket,
            &ResolutionOutcome::Accepted {
                sequence,
                locator: locator(payload),
            },
        );
    }

    #[tokio::test]
    async fn test_first_materialize_adds_then_updates() {
        let transfers = Arc::new(MockTransfers::new());
        let materializer = materializer(&transfers);
        let key = FeedKey::new([1u8; 32]);

        let first = materializer
            .materialize(key, 5, &locator(P1), "feed-A")
            .await
            .unwrap();
        let MaterializeAction::Added(id) = first else {
            panic!("expected add, got {first:?}");
        };
        let second = materializer
            .materialize(key, 7, &locator(P2), "feed-A")
            .await
            .unwrap();
        assert_eq!(second, MaterializeAction::Updated(id));

        assert_eq!(
            transfers.calls(),
            vec![
                MockTransferCall::Add {
                    locator: P1.to_string(),
                    label: "feed-A".to_string()
                },
                MockTransferCall::Update {
                    id,
                    locator: P2.to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_older_sequence_is_never_sent() {
        let transfers = Arc::new(MockTransfers::new());
        let materializer = materializer(&transfers);
        let key = FeedKey::new([1u8; 32]);

        materializer
            .materialize(key, 7, &locator(P2), "feed-A")
            .await
            .unwrap();
        let late = materializer
            .materialize(key, 5, &locator(P1), "feed-A")
            .await
            .unwrap();

        assert_eq!(late, MaterializeAction::Current);
        assert_eq!(transfers.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_marks_pending_and_reconcile_retries() {
        let transfers = Arc::new(MockTransfers::new());
        let materializer = materializer(&transfers);
        let key = FeedKey::new([1u8; 32]);
        let (registry, ticket) = registry_with(key);
        registry.add(FeedKey::new([2u8; 32]), "unresolved").unwrap();
        commit(&registry, &ticket, 5, P1);

        transfers.fail_next(TransferError::Unavailable);
        assert!(
            materializer
                .materialize(key, 5, &locator(P1), "feed-A")
                .await
                .is_err()
        );
        assert!(materializer.is_pending(&key));

        let report = materializer.reconcile(&registry).await;
        assert_eq!(
            report,
            ReconcileReport {
                attempted: 1,
                succeeded: 1,
                failed: 0
            }
        );
        assert!(!materializer.is_pending(&key));
        assert!(materializer.transfer_for(&key).is_some());

        let report = materializer.reconcile(&registry).await;
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn test_reconcile_overlapping_newer_commit_adds_once() {
        let transfers = Arc::new(MockTransfers::new());
        let materializer = materializer(&transfers);
        let key = FeedKey::new([1u8; 32]);
        let (registry, ticket) = registry_with(key);

        commit(&registry, &ticket, 5, P1);
        transfers.fail_next(TransferError::Unavailable);
        let _ = materializer
            .materialize(key, 5, &locator(P1), "feed-A")
            .await;
        assert!(materializer.is_pending(&key));

        // A worker commits seq 7 while reconcile is about to retry seq 5.
        commit(&registry, &ticket, 7, P2);
        transfers.set_latency(Duration::from_millis(20));
        let p2 = locator(P2);
        let (report, worker) = tokio::join!(
            materializer.reconcile(&registry),
            materializer.materialize(key, 7, &p2, "feed-A"),
        );

        assert_eq!(report.failed, 0);
        assert!(worker.is_ok());
        let adds: Vec<_> = transfers
            .calls()
            .into_iter()
            .skip(1)
            .filter(|call| matches!(call, MockTransferCall::Add { .. }))
            .collect();
        assert_eq!(
            adds,
            vec![MockTransferCall::Add {
                locator: P2.to_string(),
                label: "feed-A".to_string()
            }]
        );
        assert!(!materializer.is_pending(&key));
        assert!(
            !transfers
                .calls()
                .iter()
                .skip(1)
                .any(|call| matches!(call, MockTransferCall::Update { locator, .. } if locator == P1))
        );
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out_as_unavailable() {
        let transfers = Arc::new(MockTransfers::new());
        transfers.hang();
        let materializer = materializer(&transfers);
        let key = FeedKey::new([1u8; 32]);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            materializer.materialize(key, 5, &locator(P1), "feed-A"),
        )
        .await
        .expect("materialize must respect the transfer timeout");

        assert_eq!(result, Err(TransferError::Unavailable));
        assert!(materializer.is_pending(&key));
        assert!(materializer.transfer_for(&key).is_none());
    }

    #[tokio::test]
    async fn test_vanished_transfer_is_readded() {
        let transfers = Arc::new(MockTransfers::new());
        let materializer = materializer(&transfers);
        let key = FeedKey::new([1u8; 32]);

        materializer
            .materialize(key, 5, &locator(P1), "feed-A")
            .await
            .unwrap();
        transfers.fail_next(TransferError::NotFound);
        let action = materializer
            .materialize(key, 7, &locator(P2), "feed-A")
            .await
            .unwrap();
        assert!(matches!(action, MaterializeAction::Added(_)));
    }

    #[tokio::test]
    async fn test_forget_drops_mapping() {
        let transfers = Arc::new(MockTransfers::new());
        let materializer = materializer(&transfers);
        let key = FeedKey::new([1u8; 32]);

        materializer
            .materialize(key, 5, &locator(P1), "feed-A")
            .await
            .unwrap();
        materializer.forget(&key);
        assert!(materializer.transfer_for(&key).is_none());

        let again = materializer
            .materialize(key, 5, &locator(P1), "feed-A")
            .await
            .unwrap();
        assert!(matches!(again, MaterializeAction::Added(_)));
    }
}
