//! Command definitions for the feed engine actor.

use serde::Serialize;
use tokio::sync::oneshot;

use super::FeedError;
use crate::feed::FeedKey;
use crate::materializer::ReconcileReport;
use crate::registry::SubscriptionView;

/// Commands that can be sent to the feed engine actor.
///
/// Each command carries a response channel for the actor to send back
/// its result.
pub enum FeedEngineCommand {
    /// Subscribe to a feed.
    AddSubscription {
        public_key: FeedKey,
        label: String,
        responder: oneshot::Sender<Result<SubscriptionView, FeedError>>,
    },
    /// Unsubscribe from a feed.
    RemoveSubscription {
        public_key: FeedKey,
        responder: oneshot::Sender<Result<(), FeedError>>,
    },
    /// List subscriptions in insertion order.
    ListSubscriptions {
        responder: oneshot::Sender<Vec<SubscriptionView>>,
    },
    /// Read one subscription.
    GetSubscription {
        public_key: FeedKey,
        responder: oneshot::Sender<Result<SubscriptionView, FeedError>>,
    },
    /// Retry materialization for resolved feeds missing a transfer.
    Reconcile {
        responder: oneshot::Sender<ReconcileReport>,
    },
    /// Get engine statistics.
    GetStats {
        responder: oneshot::Sender<FeedEngineStats>,
    },
    /// Stop workers, persist and exit.
    Shutdown { responder: oneshot::Sender<()> },
}

/// Subscription counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedEngineStats {
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub degraded: usize,
    /// Subscriptions with a queued attempt
    pub queued: usize,
}
