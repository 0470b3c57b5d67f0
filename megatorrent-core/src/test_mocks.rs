//! Mock collaborators for testing the feed engine.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::feed::{ContentLocator, DhtRecord, LookupTarget};
use crate::materializer::{TransferClient, TransferError, TransferId};
use crate::resolver::{DhtClient, DhtError};

/// Scripted answer for one lookup.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Record(DhtRecord),
    NotFound,
    Error(DhtError),
    /// Sleep before answering `NotFound`; longer than the lookup timeout
    /// this looks like a hung node.
    Stall(Duration),
}

/// Mock network client answering lookups from a script.
///
/// Each lookup consumes the next scripted response. An empty script
/// answers `NotFound`.
#[derive(Debug, Default)]
pub struct MockDht {
    script: Mutex<VecDeque<MockResponse>>,
    lookups: AtomicUsize,
    last_target: Mutex<Option<LookupTarget>>,
}

impl MockDht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response for a future lookup.
    pub fn respond(&self, response: MockResponse) {
        self.script.lock().push_back(response);
    }

    /// Number of lookups performed.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn last_target(&self) -> Option<LookupTarget> {
        *self.last_target.lock()
    }
}

#[async_trait]
impl DhtClient for MockDht {
    async fn get(&self, target: &LookupTarget) -> Result<Option<DhtRecord>, DhtError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        *self.last_target.lock() = Some(*target);

        let next = self.script.lock().pop_front();
        match next {
            Some(MockResponse::Record(record)) => Ok(Some(record)),
            Some(MockResponse::NotFound) | None => Ok(None),
            Some(MockResponse::Error(error)) => Err(error),
            Some(MockResponse::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(None)
            }
        }
    }
}

/// Call received by [`MockTransfers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockTransferCall {
    Add { locator: String, label: String },
    Update { id: TransferId, locator: String },
}

/// Mock transfer subsystem recording every call.
#[derive(Debug, Default)]
pub struct MockTransfers {
    calls: Mutex<Vec<MockTransferCall>>,
    failures: Mutex<VecDeque<TransferError>>,
    latency: Mutex<Option<Duration>>,
    hung: AtomicBool,
}

impl MockTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call fail with `error`.
    pub fn fail_next(&self, error: TransferError) {
        self.failures.lock().push_back(error);
    }

    /// Delays every answer by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Makes every call record itself and then never answer.
    pub fn hang(&self) {
        self.hung.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<MockTransferCall> {
        self.calls.lock().clone()
    }

    async fn respond(&self) -> Option<TransferError> {
        if self.hung.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.failures.lock().pop_front()
    }
}

#[async_trait]
impl TransferClient for MockTransfers {
    async fn add_transfer(
        &self,
        locator: &ContentLocator,
        label: &str,
    ) -> Result<TransferId, TransferError> {
        self.calls.lock().push(MockTransferCall::Add {
            locator: locator.to_string(),
            label: label.to_string(),
        });
        match self.respond().await {
            Some(error) => Err(error),
            None => Ok(TransferId::new()),
        }
    }

    async fn update_transfer(
        &self,
        id: TransferId,
        locator: &ContentLocator,
    ) -> Result<(), TransferError> {
        self.calls.lock().push(MockTransferCall::Update {
            id,
            locator: locator.to_string(),
        });
        match self.respond().await {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Shared handles to a mock network and transfer subsystem.
pub fn mock_collaborators() -> (Arc<MockDht>, Arc<MockTransfers>) {
    (Arc::new(MockDht::new()), Arc::new(MockTransfers::new()))
}
