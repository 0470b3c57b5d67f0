//! Feed resolution against the distributed key/value network.
//!
//! One resolution is a single deadline-bounded lookup followed by a single
//! decision over the closed set of lookup responses. Retry timing belongs
//! to the scheduler; the resolver only reports what kind of failure it saw.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ResolverConfig;
use crate::feed::{
    ContentLocator, DhtRecord, FeedKey, LookupTarget, SIGNATURE_LEN, Verification, verify_record,
};

/// Errors reported by a distributed network client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DhtError {
    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Distributed network unavailable")]
    Unavailable,
}

/// Read access to the distributed key/value network.
///
/// Implementations return `Ok(None)` when no node holds a record for the
/// target. Deadlines are enforced by the caller.
#[async_trait]
pub trait DhtClient: Send + Sync {
    /// Fetches the record currently stored under `target`.
    async fn get(&self, target: &LookupTarget) -> Result<Option<DhtRecord>, DhtError>;
}

/// Why a resolution attempt did not yield a verified record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    NotFound,
    Timeout,
    Malformed,
    Rejected,
    Network,
}

impl FailureKind {
    /// Backoff multiplier for this failure.
    ///
    /// Hostile and corrupt responses are unlikely to fix themselves quickly.
    pub fn severity(self) -> u32 {
        match self {
            FailureKind::Rejected | FailureKind::Malformed => 2,
            FailureKind::NotFound | FailureKind::Timeout | FailureKind::Network => 1,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::NotFound => write!(f, "not found"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Malformed => write!(f, "malformed record"),
            FailureKind::Rejected => write!(f, "signature rejected"),
            FailureKind::Network => write!(f, "network error"),
        }
    }
}

/// Result of one resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Verified record advancing the feed.
    Accepted {
        sequence: u64,
        locator: ContentLocator,
    },
    /// Verified record that does not advance the feed. The feed is reachable.
    Stale { sequence: u64 },
    Failed(FailureKind),
}

impl ResolutionOutcome {
    /// Whether the feed was confirmed reachable with a valid signature.
    pub fn is_success(&self) -> bool {
        !matches!(self, ResolutionOutcome::Failed(_))
    }
}

/// Raw lookup result, before any interpretation.
#[derive(Debug)]
enum LookupResponse {
    NotFound,
    TimedOut,
    NetworkError(DhtError),
    Record(DhtRecord),
}

/// Resolves feed keys into verified content locators.
#[derive(Clone)]
pub struct Resolver {
    dht: Arc<dyn DhtClient>,
    lookup_timeout: Duration,
    max_payload_size: usize,
}

impl Resolver {
    pub fn new(dht: Arc<dyn DhtClient>, config: &ResolverConfig) -> Self {
        Self {
            dht,
            lookup_timeout: config.lookup_timeout,
            max_payload_size: config.max_payload_size,
        }
    }

    /// Performs one resolution attempt for `public_key`.
    ///
    /// `last_sequence` is the highest sequence already committed for the
    /// feed; records that do not exceed it are reported as stale.
    pub async fn resolve(
        &self,
        public_key: &FeedKey,
        last_sequence: Option<u64>,
    ) -> ResolutionOutcome {
        let target = LookupTarget::for_feed(public_key);
        tracing::debug!("Resolving feed {} at target {}", public_key.short(), target);

        let response = self.lookup(&target).await;
        self.decide(public_key, last_sequence, response)
    }

    async fn lookup(&self, target: &LookupTarget) -> LookupResponse {
        match tokio::time::timeout(self.lookup_timeout, self.dht.get(target)).await {
            Err(_) => LookupResponse::TimedOut,
            Ok(Err(error)) => LookupResponse::NetworkError(error),
            Ok(Ok(None)) => LookupResponse::NotFound,
            Ok(Ok(Some(record))) => LookupResponse::Record(record),
        }
    }

    fn decide(
        &self,
        public_key: &FeedKey,
        last_sequence: Option<u64>,
        response: LookupResponse,
    ) -> ResolutionOutcome {
        let record = match response {
            LookupResponse::NotFound => {
                tracing::debug!("No record published for feed {}", public_key.short());
                return ResolutionOutcome::Failed(FailureKind::NotFound);
            }
            LookupResponse::TimedOut => {
                tracing::debug!(
                    "Lookup for feed {} exceeded {:?}",
                    public_key.short(),
                    self.lookup_timeout
                );
                return ResolutionOutcome::Failed(FailureKind::Timeout);
            }
            LookupResponse::NetworkError(error) => {
                tracing::debug!("Lookup for feed {} failed: {}", public_key.short(), error);
                return ResolutionOutcome::Failed(FailureKind::Network);
            }
            LookupResponse::Record(record) => record,
        };

        if record.signature.len() != SIGNATURE_LEN
            || record.payload.is_empty()
            || record.payload.len() > self.max_payload_size
        {
            tracing::warn!(
                "Malformed record for feed {}: payload {} bytes, signature {} bytes",
                public_key.short(),
                record.payload.len(),
                record.signature.len()
            );
            return ResolutionOutcome::Failed(FailureKind::Malformed);
        }

        if let Verification::Rejected(reason) = verify_record(
            public_key.as_bytes(),
            record.sequence,
            &record.payload,
            &record.signature,
        ) {
            tracing::warn!(
                "Rejected record for feed {} claiming sequence {}: {:?}",
                public_key.short(),
                record.sequence,
                reason
            );
            return ResolutionOutcome::Failed(FailureKind::Rejected);
        }

        if let Some(last) = last_sequence
            && record.sequence <= last
        {
            tracing::debug!(
                "Feed {} confirmed at sequence {} (known {})",
                public_key.short(),
                record.sequence,
                last
            );
            return ResolutionOutcome::Stale {
                sequence: record.sequence,
            };
        }

        match ContentLocator::parse(&record.payload) {
            Ok(locator) => ResolutionOutcome::Accepted {
                sequence: record.sequence,
                locator,
            },
            Err(error) => {
                tracing::warn!(
                    "Signed record for feed {} has unusable payload: {}",
                    public_key.short(),
                    error
                );
                ResolutionOutcome::Failed(FailureKind::Malformed)
            }
        }
    }
}
