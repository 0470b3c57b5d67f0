//! Handle for communicating with the feed engine actor.

use tokio::sync::{mpsc, oneshot};

use super::FeedError;
use super::commands::{FeedEngineCommand, FeedEngineStats};
use crate::feed::FeedKey;
use crate::materializer::ReconcileReport;
use crate::registry::SubscriptionView;

/// Handle for communicating with the feed engine actor.
///
/// Cheap to clone and safe to share across tasks. Once the engine has shut
/// down every call returns `FeedError::EngineShutdown`.
#[derive(Clone)]
pub struct FeedEngineHandle {
    sender: mpsc::Sender<FeedEngineCommand>,
}

impl FeedEngineHandle {
    /// Creates a new handle with the given command sender.
    pub fn new(sender: mpsc::Sender<FeedEngineCommand>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        command: FeedEngineCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, FeedError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| FeedError::EngineShutdown)?;

        rx.await.map_err(|_| FeedError::EngineShutdown)
    }

    /// Subscribes to a feed.
    ///
    /// The subscription starts `Pending` and is resolved in the background.
    ///
    /// # Errors
    /// - `FeedError::DuplicateKey` - Already subscribed; the existing subscription is unchanged
    /// - `FeedError::EngineShutdown` - Engine is no longer running
    pub async fn add_subscription(
        &self,
        public_key: FeedKey,
        label: impl Into<String>,
    ) -> Result<SubscriptionView, FeedError> {
        let (responder, rx) = oneshot::channel();
        let cmd = FeedEngineCommand::AddSubscription {
            public_key,
            label: label.into(),
            responder,
        };
        self.request(cmd, rx).await?
    }

    /// Subscribes to a feed given as hex key or `megatorrent://` URI.
    ///
    /// # Errors
    /// - `FeedError::InvalidKey` - Text is not a valid feed key
    /// - `FeedError::DuplicateKey` - Already subscribed
    /// - `FeedError::EngineShutdown` - Engine is no longer running
    pub async fn add_subscription_uri(
        &self,
        uri: &str,
        label: impl Into<String>,
    ) -> Result<SubscriptionView, FeedError> {
        let public_key = FeedKey::parse(uri)?;
        self.add_subscription(public_key, label).await
    }

    /// Unsubscribes from a feed.
    ///
    /// A resolution already in flight for the feed is discarded when it
    /// completes.
    ///
    /// # Errors
    /// - `FeedError::NotFound` - Not subscribed
    /// - `FeedError::EngineShutdown` - Engine is no longer running
    pub async fn remove_subscription(&self, public_key: FeedKey) -> Result<(), FeedError> {
        let (responder, rx) = oneshot::channel();
        let cmd = FeedEngineCommand::RemoveSubscription {
            public_key,
            responder,
        };
        self.request(cmd, rx).await?
    }

    /// Lists subscriptions in the order they were added.
    pub async fn list_subscriptions(&self) -> Result<Vec<SubscriptionView>, FeedError> {
        let (responder, rx) = oneshot::channel();
        self.request(FeedEngineCommand::ListSubscriptions { responder }, rx)
            .await
    }

    /// Reads one subscription.
    ///
    /// # Errors
    /// - `FeedError::NotFound` - Not subscribed
    pub async fn subscription(&self, public_key: FeedKey) -> Result<SubscriptionView, FeedError> {
        let (responder, rx) = oneshot::channel();
        let cmd = FeedEngineCommand::GetSubscription {
            public_key,
            responder,
        };
        self.request(cmd, rx).await?
    }

    /// Re-materializes resolved feeds whose last transfer request failed.
    pub async fn reconcile(&self) -> Result<ReconcileReport, FeedError> {
        let (responder, rx) = oneshot::channel();
        self.request(FeedEngineCommand::Reconcile { responder }, rx)
            .await
    }

    /// Gets subscription counts by state.
    pub async fn stats(&self) -> Result<FeedEngineStats, FeedError> {
        let (responder, rx) = oneshot::channel();
        self.request(FeedEngineCommand::GetStats { responder }, rx)
            .await
    }

    /// Shuts down the engine actor gracefully.
    ///
    /// Waits for in-flight resolutions to finish and for the final save.
    pub async fn shutdown(&self) -> Result<(), FeedError> {
        let (responder, rx) = oneshot::channel();
        self.request(FeedEngineCommand::Shutdown { responder }, rx)
            .await
    }

    /// Checks if the engine actor is still running.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
