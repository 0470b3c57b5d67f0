//! Subscription records held by the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::feed::{ContentLocator, FeedKey};
use crate::resolver::FailureKind;

/// Resolution state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// Never successfully resolved
    Pending,
    /// Has a verified payload
    Active,
    /// Has a verified payload but recent attempts keep failing
    Degraded,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionState::Pending => write!(f, "pending"),
            SubscriptionState::Active => write!(f, "active"),
            SubscriptionState::Degraded => write!(f, "degraded"),
        }
    }
}

/// A feed the local node follows.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub public_key: FeedKey,
    pub label: String,
    pub last_sequence: Option<u64>,
    pub last_payload: Option<ContentLocator>,
    pub state: SubscriptionState,
    pub next_attempt_at: Instant,
    pub consecutive_failures: u32,
    pub added_at: DateTime<Utc>,
    pub last_resolved_at: Option<DateTime<Utc>>,
    pub last_failure: Option<FailureKind>,
}

impl Subscription {
    /// Creates a pending subscription due immediately.
    pub fn new(public_key: FeedKey, label: impl Into<String>) -> Self {
        Self {
            public_key,
            label: label.into(),
            last_sequence: None,
            last_payload: None,
            state: SubscriptionState::Pending,
            next_attempt_at: Instant::now(),
            consecutive_failures: 0,
            added_at: Utc::now(),
            last_resolved_at: None,
            last_failure: None,
        }
    }

    /// Whether the subscription holds a verified payload.
    pub fn is_resolved(&self) -> bool {
        self.last_payload.is_some()
    }
}

/// Serializable listing row for controllers and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub public_key: FeedKey,
    pub label: String,
    pub last_sequence: Option<u64>,
    pub last_payload: Option<String>,
    pub state: SubscriptionState,
    pub consecutive_failures: u32,
    pub added_at: DateTime<Utc>,
    pub last_resolved_at: Option<DateTime<Utc>>,
}

impl From<&Subscription> for SubscriptionView {
    fn from(subscription: &Subscription) -> Self {
        Self {
            public_key: subscription.public_key,
            label: subscription.label.clone(),
            last_sequence: subscription.last_sequence,
            last_payload: subscription
                .last_payload
                .as_ref()
                .map(|locator| locator.to_string()),
            state: subscription.state,
            consecutive_failures: subscription.consecutive_failures,
            added_at: subscription.added_at,
            last_resolved_at: subscription.last_resolved_at,
        }
    }
}
