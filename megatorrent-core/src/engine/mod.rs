//! Feed engine session.
//!
//! The engine owns the registry, the worker pool, the materializer and the
//! store. Controller operations are serialized through an actor; workers
//! report persisted-state changes back to it over a second channel.

mod actor;
mod commands;
mod core;
mod handle;

pub use actor::spawn_feed_engine;
pub use commands::FeedEngineStats;
pub use handle::FeedEngineHandle;

use crate::feed::{FeedKey, InvalidFeedKey};
use crate::registry::RegistryError;
use crate::store::StoreError;

/// Errors surfaced to callers of the feed engine.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Already subscribed to feed {public_key}")]
    DuplicateKey { public_key: FeedKey },

    #[error("No subscription for feed {public_key}")]
    NotFound { public_key: FeedKey },

    #[error("Invalid feed key: {reason}")]
    InvalidKey { reason: String },

    #[error("Feed engine has shut down")]
    EngineShutdown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<RegistryError> for FeedError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::DuplicateKey { public_key } => FeedError::DuplicateKey { public_key },
            RegistryError::NotFound { public_key } => FeedError::NotFound { public_key },
        }
    }
}

impl From<InvalidFeedKey> for FeedError {
    fn from(error: InvalidFeedKey) -> Self {
        FeedError::InvalidKey {
            reason: error.reason,
        }
    }
}
