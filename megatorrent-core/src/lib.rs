//! Megatorrent Core - Feed subscriptions over a distributed key/value network
//!
//! This crate resolves Ed25519-keyed feeds into continuously updated content
//! references: signed records are looked up on the network, verified,
//! committed to a subscription registry and handed to the transfer
//! subsystem. Subscriptions persist across restarts.

pub mod config;
pub mod engine;
pub mod feed;
pub mod materializer;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod tracing_setup;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

// Re-export main types for convenient access
pub use config::MegatorrentConfig;
pub use engine::{FeedEngineHandle, FeedEngineStats, FeedError, spawn_feed_engine};
pub use feed::{ContentLocator, DhtRecord, FeedKey, InfoHash, LookupTarget};
pub use materializer::{TransferClient, TransferError, TransferId};
pub use registry::{Subscription, SubscriptionRegistry, SubscriptionState, SubscriptionView};
pub use resolver::{DhtClient, DhtError, FailureKind, ResolutionOutcome, Resolver};
pub use store::{JsonFileStore, MemoryStore, StoreError, SubscriptionStore};

/// Errors that can bubble up from any Megatorrent subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MegatorrentError {
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MegatorrentError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            MegatorrentError::Feed(e) => match e {
                FeedError::DuplicateKey { public_key } => {
                    format!("Already subscribed to {public_key}")
                }
                FeedError::NotFound { public_key } => {
                    format!("No subscription for {public_key}")
                }
                FeedError::InvalidKey { reason } => format!("Invalid feed key: {reason}"),
                FeedError::EngineShutdown => "Feed engine is not running".to_string(),
                FeedError::Store(_) => "Could not save subscriptions".to_string(),
            },
            MegatorrentError::Store(_) => "Subscription state could not be read".to_string(),
            MegatorrentError::Configuration { .. } => "Configuration error occurred".to_string(),
            MegatorrentError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            MegatorrentError::Configuration { .. }
                | MegatorrentError::Feed(
                    FeedError::DuplicateKey { .. }
                        | FeedError::NotFound { .. }
                        | FeedError::InvalidKey { .. }
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, MegatorrentError>;
