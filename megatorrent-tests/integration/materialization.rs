//! Handing resolved content to the transfer subsystem.

use std::time::Duration;

use megatorrent_core::materializer::TransferError;
use megatorrent_sim::content_hash;
use tokio::time::Instant;

use crate::harness::{SETTLE, start_simulation};

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + SETTLE;
    while !condition() {
        assert!(Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_first_resolution_adds_then_updates_transfer() {
    let mut sim = start_simulation(400).await;
    let feed = sim.add_feed("feed-A").await.unwrap();

    sim.publish_next(feed);
    sim.wait_for_sequence(feed, 1, SETTLE).await.unwrap();
    wait_until(|| sim.transfers.add_count() == 1).await;

    sim.publish_next(feed);
    sim.wait_for_sequence(feed, 2, SETTLE).await.unwrap();
    wait_until(|| sim.transfers.update_count() == 1).await;

    let (_, transfer) = sim.transfers.transfer_labeled("feed-A").unwrap();
    assert_eq!(transfer.locator.as_str(), content_hash(feed, 2));
    assert_eq!(sim.transfers.transfer_count(), 1);

    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_materialization_keeps_commit_and_reconciles() {
    let mut sim = start_simulation(401).await;
    sim.transfers.fail_next(TransferError::Unavailable);
    let feed = sim.add_feed("feed-A").await.unwrap();

    sim.publish_next(feed);
    let view = sim.wait_for_sequence(feed, 1, SETTLE).await.unwrap();
    assert_eq!(view.last_payload, Some(content_hash(feed, 1)));
    wait_until(|| sim.transfers.attempt_count() >= 1).await;
    assert_eq!(sim.transfers.transfer_count(), 0);

    let deadline = Instant::now() + SETTLE;
    loop {
        let report = sim.handle.reconcile().await.unwrap();
        if report.succeeded == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "reconcile never succeeded");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(sim.transfers.transfer_count(), 1);

    // Nothing left to do on a second pass.
    let report = sim.handle.reconcile().await.unwrap();
    assert_eq!(report.attempted, 0);

    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_vanished_transfer_is_readded_on_next_update() {
    let mut sim = start_simulation(402).await;
    let feed = sim.add_feed("feed-A").await.unwrap();

    sim.publish_next(feed);
    sim.wait_for_sequence(feed, 1, SETTLE).await.unwrap();
    wait_until(|| sim.transfers.add_count() == 1).await;

    let (id, _) = sim.transfers.transfer_labeled("feed-A").unwrap();
    assert!(sim.transfers.drop_transfer(id));

    sim.publish_next(feed);
    sim.wait_for_sequence(feed, 2, SETTLE).await.unwrap();
    wait_until(|| sim.transfers.add_count() == 2).await;

    let (new_id, transfer) = sim.transfers.transfer_labeled("feed-A").unwrap();
    assert_ne!(new_id, id);
    assert_eq!(transfer.locator.as_str(), content_hash(feed, 2));

    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_removed_feed_transfer_is_left_alone() {
    let mut sim = start_simulation(403).await;
    let feed = sim.add_feed("feed-A").await.unwrap();
    let key = sim.publisher(feed).feed_key();

    sim.publish_next(feed);
    sim.wait_for_sequence(feed, 1, SETTLE).await.unwrap();
    wait_until(|| sim.transfers.add_count() == 1).await;

    sim.handle.remove_subscription(key).await.unwrap();
    sim.publish_next(feed);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Unsubscribing stops updates but does not delete downloaded content.
    assert_eq!(sim.transfers.transfer_count(), 1);
    assert_eq!(sim.transfers.update_count(), 0);

    sim.shutdown().await.unwrap();
}
