//! Subscription registry.
//!
//! The registry is the single writer of subscription state. Every mutation
//! runs under one mutex, so concurrent callers only ever observe the state
//! before or after a complete operation. Resolution results are committed
//! against a ticket naming the generation they were started for; results
//! for removed or re-added subscriptions are discarded.

mod subscription;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;

pub use subscription::{Subscription, SubscriptionState, SubscriptionView};

use crate::feed::{ContentLocator, FeedKey};
use crate::resolver::{FailureKind, ResolutionOutcome};
use crate::scheduler::DueQueue;
use crate::store::PersistedSubscription;

/// Errors from synchronous registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Subscription already exists: {public_key}")]
    DuplicateKey { public_key: FeedKey },

    #[error("Subscription not found: {public_key}")]
    NotFound { public_key: FeedKey },
}

/// Identifies one incarnation of a subscription.
///
/// Removing and re-adding a key yields a new generation, so work started
/// for the old incarnation can never touch the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolutionTicket {
    pub public_key: FeedKey,
    pub generation: u64,
}

/// What committing a resolution outcome did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    /// Subscription is gone or was re-added since the attempt started
    Discarded,
    /// Feed moved to a new sequence and payload
    Advanced {
        label: String,
        locator: ContentLocator,
        sequence: u64,
    },
    /// Feed reachable with a valid signature but nothing new
    Confirmed { state_changed: bool },
    Failed {
        consecutive_failures: u32,
        state_changed: bool,
    },
}

impl ApplyResult {
    /// Whether persisted state changed.
    pub fn needs_persist(&self) -> bool {
        match self {
            ApplyResult::Discarded => false,
            ApplyResult::Advanced { .. } => true,
            ApplyResult::Confirmed { state_changed } => *state_changed,
            ApplyResult::Failed { state_changed, .. } => *state_changed,
        }
    }
}

#[derive(Debug)]
struct Entry {
    subscription: Subscription,
    generation: u64,
    insertion: u64,
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: HashMap<FeedKey, Entry>,
    next_generation: u64,
    next_insertion: u64,
}

impl RegistryInner {
    fn insert(&mut self, subscription: Subscription) -> ResolutionTicket {
        self.next_generation += 1;
        self.next_insertion += 1;
        let ticket = ResolutionTicket {
            public_key: subscription.public_key,
            generation: self.next_generation,
        };
        self.entries.insert(
            subscription.public_key,
            Entry {
                subscription,
                generation: ticket.generation,
                insertion: self.next_insertion,
            },
        );
        ticket
    }

    fn current(&mut self, ticket: &ResolutionTicket) -> Option<&mut Subscription> {
        self.entries
            .get_mut(&ticket.public_key)
            .filter(|entry| entry.generation == ticket.generation)
            .map(|entry| &mut entry.subscription)
    }

    fn ordered(&self) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.insertion);
        entries
    }
}

/// Authoritative table of subscriptions.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
    queue: Arc<DueQueue>,
    degraded_threshold: u32,
}

impl SubscriptionRegistry {
    /// Creates an empty registry feeding `queue`.
    ///
    /// Active subscriptions become degraded after `degraded_threshold`
    /// consecutive failures.
    pub fn new(queue: Arc<DueQueue>, degraded_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            queue,
            degraded_threshold: degraded_threshold.max(1),
        }
    }

    /// Adds a pending subscription and schedules its first attempt now.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DuplicateKey` - Key already subscribed; existing entry is untouched
    pub fn add(
        &self,
        public_key: FeedKey,
        label: impl Into<String>,
    ) -> Result<Subscription, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&public_key) {
            return Err(RegistryError::DuplicateKey { public_key });
        }

        let subscription = Subscription::new(public_key, label);
        let due = subscription.next_attempt_at;
        let ticket = inner.insert(subscription.clone());
        self.queue.schedule(ticket, due);

        tracing::info!(
            "Subscribed to feed {} ({})",
            public_key.short(),
            subscription.label
        );
        Ok(subscription)
    }

    /// Removes a subscription and cancels its queued attempt.
    ///
    /// An attempt already in flight is not interrupted; its result is
    /// discarded when it tries to commit.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotFound` - Key is not subscribed
    pub fn remove(&self, public_key: &FeedKey) -> Result<Subscription, RegistryError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .remove(public_key)
            .ok_or(RegistryError::NotFound {
                public_key: *public_key,
            })?;
        self.queue.cancel(public_key);

        tracing::info!("Unsubscribed from feed {}", public_key.short());
        Ok(entry.subscription)
    }

    /// All subscriptions in insertion order.
    pub fn list(&self) -> Vec<Subscription> {
        self.inner
            .lock()
            .ordered()
            .into_iter()
            .map(|entry| entry.subscription.clone())
            .collect()
    }

    /// Point read of one subscription.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotFound` - Key is not subscribed
    pub fn snapshot(&self, public_key: &FeedKey) -> Result<Subscription, RegistryError> {
        self.inner
            .lock()
            .entries
            .get(public_key)
            .map(|entry| entry.subscription.clone())
            .ok_or(RegistryError::NotFound {
                public_key: *public_key,
            })
    }

    /// Snapshot of the incarnation named by `ticket`, if it still exists.
    pub fn snapshot_for(&self, ticket: &ResolutionTicket) -> Option<Subscription> {
        self.inner.lock().current(ticket).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commits a resolution outcome.
    ///
    /// Silently discarded if the subscription was removed or re-added since
    /// the ticket was issued. A sequence that does not exceed the stored one
    /// never changes the payload.
    pub fn apply_resolution(
        &self,
        ticket: &ResolutionTicket,
        outcome: &ResolutionOutcome,
    ) -> ApplyResult {
        let mut inner = self.inner.lock();
        let Some(subscription) = inner.current(ticket) else {
            tracing::debug!(
                "Discarding resolution for removed feed {}",
                ticket.public_key.short()
            );
            return ApplyResult::Discarded;
        };

        match outcome {
            ResolutionOutcome::Accepted { sequence, locator } => {
                if subscription
                    .last_sequence
                    .is_some_and(|last| *sequence <= last)
                {
                    // Another commit got there first.
                    return confirm(subscription);
                }

                subscription.last_sequence = Some(*sequence);
                subscription.last_payload = Some(locator.clone());
                subscription.state = SubscriptionState::Active;
                subscription.consecutive_failures = 0;
                subscription.last_failure = None;
                subscription.last_resolved_at = Some(Utc::now());

                tracing::info!(
                    "Feed {} ({}) advanced to sequence {}",
                    ticket.public_key.short(),
                    subscription.label,
                    sequence
                );
                ApplyResult::Advanced {
                    label: subscription.label.clone(),
                    locator: locator.clone(),
                    sequence: *sequence,
                }
            }
            ResolutionOutcome::Stale { .. } => confirm(subscription),
            ResolutionOutcome::Failed(kind) => {
                record_failure(subscription, *kind, self.degraded_threshold)
            }
        }
    }

    /// Sets the next attempt for the incarnation named by `ticket`.
    ///
    /// Returns `false` without scheduling if the subscription is gone.
    pub fn reschedule(&self, ticket: &ResolutionTicket, at: Instant) -> bool {
        let mut inner = self.inner.lock();
        let Some(subscription) = inner.current(ticket) else {
            return false;
        };
        subscription.next_attempt_at = at;
        self.queue.schedule(*ticket, at);
        true
    }

    /// Seeds the registry from persisted records.
    ///
    /// Restored subscriptions keep their sequence, payload and state and are
    /// due immediately. When a key appears more than once, or is already
    /// present, the highest sequence wins; a live entry keeps its state
    /// unless it was never resolved. Returns the number of records
    /// that created new subscriptions.
    pub fn restore(&self, records: Vec<PersistedSubscription>) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let mut created = 0;

        for record in records {
            if let Some(entry) = inner.entries.get_mut(&record.public_key) {
                let existing = &mut entry.subscription;
                if record.last_sequence > existing.last_sequence && record.last_payload.is_some()
                {
                    existing.last_sequence = record.last_sequence;
                    existing.last_payload = record.last_payload;
                    if existing.state == SubscriptionState::Pending {
                        existing.state = restored_state(record.state, true);
                    }
                }
                continue;
            }

            let resolved = record.last_payload.is_some();
            let subscription = Subscription {
                public_key: record.public_key,
                label: record.label,
                last_sequence: record.last_sequence,
                last_payload: record.last_payload,
                state: restored_state(record.state, resolved),
                next_attempt_at: now,
                consecutive_failures: 0,
                added_at: record.added_at,
                last_resolved_at: None,
                last_failure: None,
            };
            let ticket = inner.insert(subscription);
            self.queue.schedule(ticket, now);
            created += 1;
        }

        if created > 0 {
            tracing::info!("Restored {} subscriptions", created);
        }
        created
    }

    /// Persistence view of every subscription, in insertion order.
    pub fn persisted_records(&self) -> Vec<PersistedSubscription> {
        self.inner
            .lock()
            .ordered()
            .into_iter()
            .map(|entry| PersistedSubscription::from(&entry.subscription))
            .collect()
    }
}

fn confirm(subscription: &mut Subscription) -> ApplyResult {
    subscription.consecutive_failures = 0;
    subscription.last_failure = None;
    subscription.last_resolved_at = Some(Utc::now());

    let state_changed = subscription.state == SubscriptionState::Degraded;
    if state_changed {
        subscription.state = SubscriptionState::Active;
        tracing::info!(
            "Feed {} ({}) recovered",
            subscription.public_key.short(),
            subscription.label
        );
    }
    ApplyResult::Confirmed { state_changed }
}

fn record_failure(
    subscription: &mut Subscription,
    kind: FailureKind,
    degraded_threshold: u32,
) -> ApplyResult {
    subscription.consecutive_failures = subscription.consecutive_failures.saturating_add(1);
    subscription.last_failure = Some(kind);

    let state_changed = subscription.state == SubscriptionState::Active
        && subscription.consecutive_failures >= degraded_threshold;
    if state_changed {
        subscription.state = SubscriptionState::Degraded;
        tracing::warn!(
            "Feed {} ({}) degraded after {} failures, last: {}",
            subscription.public_key.short(),
            subscription.label,
            subscription.consecutive_failures,
            kind
        );
    }
    ApplyResult::Failed {
        consecutive_failures: subscription.consecutive_failures,
        state_changed,
    }
}

fn restored_state(stored: SubscriptionState, resolved: bool) -> SubscriptionState {
    match (stored, resolved) {
        (_, false) => SubscriptionState::Pending,
        (SubscriptionState::Pending, true) => SubscriptionState::Active,
        (state, true) => state,
    }
}
