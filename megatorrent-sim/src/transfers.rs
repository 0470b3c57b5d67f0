//! Simulated torrent transfer subsystem.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use megatorrent_core::feed::ContentLocator;
use megatorrent_core::materializer::{TransferClient, TransferError, TransferId};
use parking_lot::Mutex;

/// Transfer tracked by the simulated subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedTransfer {
    /// Label the transfer was started with
    pub label: String,
    /// Locator the transfer currently points at
    pub locator: ContentLocator,
    /// Number of times the transfer was redirected
    pub updates: u32,
}

#[derive(Default)]
struct TransferState {
    transfers: HashMap<TransferId, SimulatedTransfer>,
    failures: VecDeque<TransferError>,
    attempts: u32,
    adds: u32,
    updates: u32,
}

/// In-memory transfer subsystem.
///
/// Unknown ids answer `NotFound`, so dropping a transfer behind the
/// materializer's back exercises its re-add path.
#[derive(Default)]
pub struct SimulatedTransferClient {
    state: Mutex<TransferState>,
}

impl SimulatedTransferClient {
    /// Creates an empty transfer subsystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next add or update fail with `error`.
    pub fn fail_next(&self, error: TransferError) {
        self.state.lock().failures.push_back(error);
    }

    /// Removes a transfer as if the user deleted it.
    pub fn drop_transfer(&self, id: TransferId) -> bool {
        self.state.lock().transfers.remove(&id).is_some()
    }

    /// Transfer with the given label, if any.
    pub fn transfer_labeled(&self, label: &str) -> Option<(TransferId, SimulatedTransfer)> {
        self.state
            .lock()
            .transfers
            .iter()
            .find(|(_, transfer)| transfer.label == label)
            .map(|(id, transfer)| (*id, transfer.clone()))
    }

    /// Number of live transfers.
    pub fn transfer_count(&self) -> usize {
        self.state.lock().transfers.len()
    }

    /// Calls received, failed ones included.
    pub fn attempt_count(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Successful adds so far.
    pub fn add_count(&self) -> u32 {
        self.state.lock().adds
    }

    /// Successful updates so far.
    pub fn update_count(&self) -> u32 {
        self.state.lock().updates
    }
}

#[async_trait]
impl TransferClient for SimulatedTransferClient {
    async fn add_transfer(
        &self,
        locator: &ContentLocator,
        label: &str,
    ) -> Result<TransferId, TransferError> {
        let mut state = self.state.lock();
        state.attempts += 1;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let id = TransferId::new();
        state.transfers.insert(
            id,
            SimulatedTransfer {
                label: label.to_string(),
                locator: locator.clone(),
                updates: 0,
            },
        );
        state.adds += 1;
        Ok(id)
    }

    async fn update_transfer(
        &self,
        id: TransferId,
        locator: &ContentLocator,
    ) -> Result<(), TransferError> {
        let mut state = self.state.lock();
        state.attempts += 1;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let transfer = state
            .transfers
            .get_mut(&id)
            .ok_or(TransferError::NotFound)?;
        transfer.locator = locator.clone();
        transfer.updates += 1;
        state.updates += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(hex_digit: char) -> ContentLocator {
        ContentLocator::parse(hex_digit.to_string().repeat(40).as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_add_then_update() {
        let client = SimulatedTransferClient::new();
        let id = client.add_transfer(&locator('a'), "feed-A").await.unwrap();
        client.update_transfer(id, &locator('b')).await.unwrap();

        let (found, transfer) = client.transfer_labeled("feed-A").unwrap();
        assert_eq!(found, id);
        assert_eq!(transfer.locator, locator('b'));
        assert_eq!(transfer.updates, 1);
        assert_eq!((client.add_count(), client.update_count()), (1, 1));
    }

    #[tokio::test]
    async fn test_dropped_transfer_is_not_found() {
        let client = SimulatedTransferClient::new();
        let id = client.add_transfer(&locator('a'), "feed-A").await.unwrap();
        assert!(client.drop_transfer(id));

        assert_eq!(
            client.update_transfer(id, &locator('b')).await,
            Err(TransferError::NotFound)
        );
        assert_eq!(client.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let client = SimulatedTransferClient::new();
        client.fail_next(TransferError::Unavailable);

        assert_eq!(
            client.add_transfer(&locator('a'), "feed-A").await,
            Err(TransferError::Unavailable)
        );
        assert!(client.add_transfer(&locator('a'), "feed-A").await.is_ok());
        assert_eq!(client.add_count(), 1);
        assert_eq!(client.attempt_count(), 2);
    }
}
