//! Persistence of the subscription table.
//!
//! The store keeps one record per subscription so that restarts resume
//! from the last verified sequence number instead of accepting an older
//! record as new.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::feed::{ContentLocator, FeedKey};
use crate::registry::{Subscription, SubscriptionState};

/// Bump when the on-disk layout changes.
pub const CURRENT_STATE_VERSION: u32 = 1;

/// Errors from reading or writing persisted state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported state version {version}")]
    UnsupportedVersion { version: u32 },
}

/// On-disk form of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSubscription {
    pub public_key: FeedKey,
    pub label: String,
    pub last_sequence: Option<u64>,
    pub last_payload: Option<ContentLocator>,
    pub state: SubscriptionState,
    pub added_at: DateTime<Utc>,
}

impl From<&Subscription> for PersistedSubscription {
    fn from(subscription: &Subscription) -> Self {
        Self {
            public_key: subscription.public_key,
            label: subscription.label.clone(),
            last_sequence: subscription.last_sequence,
            last_payload: subscription.last_payload.clone(),
            state: subscription.state,
            added_at: subscription.added_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub subscriptions: Vec<PersistedSubscription>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: CURRENT_STATE_VERSION,
            subscriptions: Vec::new(),
        }
    }
}

impl PersistedState {
    pub fn new(subscriptions: Vec<PersistedSubscription>) -> Self {
        Self {
            version: CURRENT_STATE_VERSION,
            subscriptions,
        }
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Loads the saved state, or an empty state if nothing was saved yet.
    async fn load(&self) -> Result<PersistedState, StoreError>;

    /// Replaces the saved state.
    async fn save(&self, state: &PersistedState) -> Result<(), StoreError>;
}

/// In-memory store for tests and simulations.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<PersistedState>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a store that already holds `state`.
    pub fn with_state(state: PersistedState) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(state),
            saves: AtomicUsize::new(0),
        })
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn current(&self) -> PersistedState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn load(&self) -> Result<PersistedState, StoreError> {
        Ok(self.state.read().await.clone())
    }

    async fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        *self.state.write().await = state.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// JSON file store.
///
/// Saves go to a sibling temporary file which then replaces the target, so
/// a crash mid-write leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SubscriptionStore for JsonFileStore {
    async fn load(&self) -> Result<PersistedState, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No state file at {}, starting empty", self.path.display());
                return Ok(PersistedState::default());
            }
            Err(e) => return Err(e.into()),
        };

        let state: PersistedState = serde_json::from_slice(&bytes)?;
        if state.version > CURRENT_STATE_VERSION {
            return Err(StoreError::UnsupportedVersion {
                version: state.version,
            });
        }
        Ok(state)
    }

    async fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(state)?;
        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        tracing::trace!(
            "Saved {} subscriptions to {}",
            state.subscriptions.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seed: u8) -> PersistedSubscription {
        PersistedSubscription {
            public_key: FeedKey::new([seed; 32]),
            label: format!("feed-{seed}"),
            last_sequence: None,
            last_payload: None,
            state: SubscriptionState::Pending,
            added_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load().await.unwrap().subscriptions.is_empty());

        let state = PersistedState::new(vec![record(1)]);
        store.save(&state).await.unwrap();

        assert_eq!(store.load().await.unwrap(), state);
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_persisted_record_uses_camel_case() {
        let json = serde_json::to_value(record(1)).unwrap();
        assert!(json.get("publicKey").is_some());
        assert!(json.get("lastSequence").is_some());
        assert!(json.get("lastPayload").is_some());
        assert!(json.get("addedAt").is_some());
        assert_eq!(json["state"], "pending");
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let store = JsonFileStore::new("/var/lib/megatorrent/state.json");
        assert_eq!(
            store.temp_path(),
            PathBuf::from("/var/lib/megatorrent/state.json.tmp")
        );
    }
}
