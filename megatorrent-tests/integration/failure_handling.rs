//! Lookup failures, hostile records and races with removal.

use std::time::Duration;

use megatorrent_core::config::MegatorrentConfig;
use megatorrent_core::registry::SubscriptionState;
use megatorrent_core::store::MemoryStore;
use megatorrent_sim::{Fault, FeedSimulation, NetworkConfig, content_hash};

use crate::harness::{SETTLE, start_simulation, start_with_config, wait_for_lookups};

#[tokio::test]
async fn test_repeated_timeouts_degrade_then_recover() {
    let mut sim = start_simulation(200).await;
    let feed = sim.add_feed("feed-A").await.unwrap();
    let key = sim.publisher(feed).feed_key();
    let target = sim.publisher(feed).target();

    sim.publish_next(feed);
    sim.wait_for_sequence(feed, 1, SETTLE).await.unwrap();

    // Every lookup outlives the 100ms lookup deadline.
    sim.dht
        .set_persistent_fault(target, Some(Fault::Stall(Duration::from_millis(500))));
    let degraded = sim
        .wait_for(SETTLE, |subscriptions| {
            subscriptions
                .iter()
                .any(|s| s.public_key == key && s.state == SubscriptionState::Degraded)
        })
        .await
        .unwrap();
    let view = degraded.into_iter().find(|s| s.public_key == key).unwrap();
    assert!(view.consecutive_failures >= 3);
    assert_eq!(view.last_sequence, Some(1));
    assert_eq!(view.last_payload, Some(content_hash(feed, 1)));

    sim.dht.set_persistent_fault(target, None);
    sim.publish_next(feed);
    let recovered = sim
        .wait_for(SETTLE, |subscriptions| {
            subscriptions.iter().any(|s| {
                s.public_key == key
                    && s.state == SubscriptionState::Active
                    && s.last_sequence == Some(2)
            })
        })
        .await
        .unwrap();
    assert_eq!(recovered[0].consecutive_failures, 0);

    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unresolved_feed_stays_pending_on_failures() {
    let mut sim = start_simulation(201).await;
    let feed = sim.add_feed("never-published").await.unwrap();
    let key = sim.publisher(feed).feed_key();

    let baseline = sim.dht.lookup_count();
    wait_for_lookups(&sim, baseline, 5).await;

    let view = sim.handle.subscription(key).await.unwrap();
    assert_eq!(view.state, SubscriptionState::Pending);
    assert!(view.consecutive_failures >= 4);
    assert_eq!(view.last_sequence, None);

    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hostile_records_never_change_state() {
    let mut sim = start_simulation(202).await;
    let feed = sim.add_feed("feed-A").await.unwrap();
    let key = sim.publisher(feed).feed_key();
    let target = sim.publisher(feed).target();

    sim.publish(feed, 3);
    let before = sim.wait_for_sequence(feed, 3, SETTLE).await.unwrap();

    sim.dht.set_persistent_fault(target, Some(Fault::Hostile));
    let baseline = sim.dht.lookup_count();
    wait_for_lookups(&sim, baseline, 4).await;

    let after = sim.handle.subscription(key).await.unwrap();
    assert_eq!(after.last_sequence, before.last_sequence);
    assert_eq!(after.last_payload, before.last_payload);
    assert!(after.consecutive_failures > 0);

    // A forged record replayed by the publisher's own slot is rejected too.
    sim.dht.set_persistent_fault(target, None);
    let forged = sim.publisher(feed).forged_record(50, content_hash(feed, 50));
    sim.dht.put(target, forged);
    let baseline = sim.dht.lookup_count();
    wait_for_lookups(&sim, baseline, 3).await;
    let after = sim.handle.subscription(key).await.unwrap();
    assert_eq!(after.last_sequence, Some(3));

    let (_, transfer) = sim.transfers.transfer_labeled("feed-A").unwrap();
    assert_eq!(transfer.locator.as_str(), content_hash(feed, 3));

    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_removal_during_lookup_discards_result() {
    let mut config = MegatorrentConfig::for_testing();
    config.resolver.lookup_timeout = Duration::from_secs(2);
    let store = MemoryStore::new();
    let mut sim =
        FeedSimulation::start_with_store(config, NetworkConfig::default(), 203, store.clone())
            .await
            .unwrap();

    let feed = sim.create_publisher();
    let key = sim.publisher(feed).feed_key();
    let target = sim.publisher(feed).target();
    sim.publish(feed, 1);
    sim.dht
        .inject_fault(target, Fault::Stall(Duration::from_millis(300)));

    sim.handle.add_subscription(key, "feed-A").await.unwrap();
    wait_for_lookups(&sim, 0, 1).await;
    sim.handle.remove_subscription(key).await.unwrap();

    // Let the stalled lookup finish with a valid record.
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(sim.handle.list_subscriptions().await.unwrap().is_empty());
    assert!(store.current().await.subscriptions.is_empty());
    assert_eq!(sim.transfers.transfer_count(), 0);
    assert_eq!(sim.transfers.attempt_count(), 0);

    sim.shutdown().await.unwrap();
    assert!(store.current().await.subscriptions.is_empty());
}

#[tokio::test]
async fn test_readded_feed_starts_fresh_after_removal_race() {
    let mut config = MegatorrentConfig::for_testing();
    config.resolver.lookup_timeout = Duration::from_secs(2);
    let mut sim = start_with_config(config, 204).await;

    let feed = sim.create_publisher();
    let key = sim.publisher(feed).feed_key();
    let target = sim.publisher(feed).target();
    sim.publish(feed, 1);
    sim.dht
        .inject_fault(target, Fault::Stall(Duration::from_millis(300)));

    sim.handle.add_subscription(key, "first").await.unwrap();
    wait_for_lookups(&sim, 0, 1).await;
    sim.handle.remove_subscription(key).await.unwrap();
    sim.handle.add_subscription(key, "second").await.unwrap();

    let view = sim.wait_for_sequence(feed, 1, SETTLE).await.unwrap();
    assert_eq!(view.label, "second");

    // Only the re-added subscription materializes.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(sim.transfers.add_count(), 1);
    assert!(sim.transfers.transfer_labeled("second").is_some());

    sim.shutdown().await.unwrap();
}
