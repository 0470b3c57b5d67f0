//! Feed engine state owned by the actor.

use std::sync::Arc;

use tokio::sync::oneshot;

use super::FeedError;
use super::commands::FeedEngineStats;
use crate::feed::FeedKey;
use crate::materializer::{Materializer, ReconcileReport};
use crate::registry::{SubscriptionRegistry, SubscriptionState, SubscriptionView};
use crate::scheduler::{DueQueue, UpdateScheduler};
use crate::store::{PersistedState, SubscriptionStore};

/// Session state behind the actor.
///
/// Only the actor task touches this value, so persistence never races with
/// itself. Workers share the registry and materializer through `Arc`s.
pub struct FeedEngine {
    registry: Arc<SubscriptionRegistry>,
    queue: Arc<DueQueue>,
    materializer: Arc<Materializer>,
    store: Arc<dyn SubscriptionStore>,
    scheduler: Option<UpdateScheduler>,
    dirty: bool,
}

impl FeedEngine {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        queue: Arc<DueQueue>,
        materializer: Arc<Materializer>,
        store: Arc<dyn SubscriptionStore>,
        scheduler: UpdateScheduler,
    ) -> Self {
        Self {
            registry,
            queue,
            materializer,
            store,
            scheduler: Some(scheduler),
            dirty: false,
        }
    }

    /// Subscribes to a feed and persists the new table.
    ///
    /// # Errors
    ///
    /// - `FeedError::DuplicateKey` - Key already subscribed
    pub async fn add_subscription(
        &mut self,
        public_key: FeedKey,
        label: String,
    ) -> Result<SubscriptionView, FeedError> {
        let subscription = self.registry.add(public_key, label)?;
        self.persist().await;
        Ok(SubscriptionView::from(&subscription))
    }

    /// Unsubscribes from a feed and persists the new table.
    ///
    /// # Errors
    ///
    /// - `FeedError::NotFound` - Key not subscribed
    pub async fn remove_subscription(&mut self, public_key: FeedKey) -> Result<(), FeedError> {
        self.registry.remove(&public_key)?;
        self.materializer.forget(&public_key);
        self.persist().await;
        Ok(())
    }

    pub fn list_subscriptions(&self) -> Vec<SubscriptionView> {
        self.registry
            .list()
            .iter()
            .map(SubscriptionView::from)
            .collect()
    }

    /// # Errors
    ///
    /// - `FeedError::NotFound` - Key not subscribed
    pub fn subscription(&self, public_key: FeedKey) -> Result<SubscriptionView, FeedError> {
        let subscription = self.registry.snapshot(&public_key)?;
        Ok(SubscriptionView::from(&subscription))
    }

    /// Runs a reconcile pass on its own task and answers through `responder`.
    ///
    /// The actor keeps serving commands while transfer calls are in flight.
    pub fn spawn_reconcile(&self, responder: oneshot::Sender<ReconcileReport>) {
        let registry = self.registry.clone();
        let materializer = self.materializer.clone();
        tokio::spawn(async move {
            let report = materializer.reconcile(&registry).await;
            let _ = responder.send(report);
        });
    }

    pub fn stats(&self) -> FeedEngineStats {
        let mut stats = FeedEngineStats {
            queued: self.queue.len(),
            ..Default::default()
        };
        for subscription in self.registry.list() {
            stats.total += 1;
            match subscription.state {
                SubscriptionState::Pending => stats.pending += 1,
                SubscriptionState::Active => stats.active += 1,
                SubscriptionState::Degraded => stats.degraded += 1,
            }
        }
        stats
    }

    /// Whether the last save failed and needs retrying.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Saves the current subscription table.
    ///
    /// Failures are logged and leave the engine dirty; the actor retries
    /// until a save succeeds.
    pub async fn persist(&mut self) {
        let state = PersistedState::new(self.registry.persisted_records());
        match self.store.save(&state).await {
            Ok(()) => {
                if self.dirty {
                    tracing::info!("Subscription state saved after earlier failure");
                }
                self.dirty = false;
            }
            Err(e) => {
                tracing::warn!("Failed to save subscription state: {}", e);
                self.dirty = true;
            }
        }
    }

    /// Stops the worker pool and writes the final state.
    ///
    /// Idempotent.
    pub async fn shutdown(&mut self) {
        let Some(scheduler) = self.scheduler.take() else {
            return;
        };
        scheduler.shutdown().await;
        self.persist().await;
        tracing::info!(
            "Feed engine stopped with {} subscriptions",
            self.registry.len()
        );
    }
}
