//! Subscription lifecycle through the engine handle.

use std::time::Duration;

use megatorrent_core::engine::FeedError;
use megatorrent_core::feed::FeedKey;
use megatorrent_core::registry::SubscriptionState;
use megatorrent_sim::content_hash;

use crate::harness::{SETTLE, start_simulation, wait_for_lookups};

#[tokio::test]
async fn test_feed_advances_ignores_stale_and_advances_again() {
    let mut sim = start_simulation(100).await;
    let feed = sim.create_publisher();
    let key = sim.publisher(feed).feed_key();
    sim.publish(feed, 5);

    let added = sim.handle.add_subscription(key, "feed-A").await.unwrap();
    assert_eq!(added.state, SubscriptionState::Pending);
    assert_eq!(added.last_sequence, None);

    let view = sim.wait_for_sequence(feed, 5, SETTLE).await.unwrap();
    assert_eq!(view.state, SubscriptionState::Active);
    assert_eq!(view.label, "feed-A");
    assert_eq!(view.last_payload, Some(content_hash(feed, 5)));

    // An older record is replayed; several refreshes must leave seq 5 in place.
    sim.publish(feed, 4);
    let baseline = sim.dht.lookup_count();
    wait_for_lookups(&sim, baseline, 3).await;
    let view = sim.handle.subscription(key).await.unwrap();
    assert_eq!(view.last_sequence, Some(5));
    assert_eq!(view.last_payload, Some(content_hash(feed, 5)));
    assert_eq!(view.state, SubscriptionState::Active);

    sim.publish(feed, 7);
    let view = sim.wait_for_sequence(feed, 7, SETTLE).await.unwrap();
    assert_eq!(view.last_payload, Some(content_hash(feed, 7)));

    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_add_keeps_original() {
    let mut sim = start_simulation(101).await;
    let feed = sim.add_feed("original").await.unwrap();
    let key = sim.publisher(feed).feed_key();

    let result = sim.handle.add_subscription(key, "replacement").await;
    assert!(matches!(result, Err(FeedError::DuplicateKey { public_key }) if public_key == key));

    let listed = sim.handle.list_subscriptions().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].label, "original");

    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remove_absent_key_is_not_found() {
    let sim = start_simulation(102).await;
    let result = sim
        .handle
        .remove_subscription(FeedKey::new([9u8; 32]))
        .await;
    assert!(matches!(result, Err(FeedError::NotFound { .. })));
    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_add_by_uri_resolves_same_feed() {
    let mut sim = start_simulation(103).await;
    let feed = sim.create_publisher();
    let key = sim.publisher(feed).feed_key();
    sim.publish(feed, 1);

    let view = sim
        .handle
        .add_subscription_uri(&key.to_uri(), "by-uri")
        .await
        .unwrap();
    assert_eq!(view.public_key, key);

    let resolved = sim.wait_for_sequence(feed, 1, SETTLE).await.unwrap();
    assert_eq!(resolved.label, "by-uri");

    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_many_feeds_resolve_independently() {
    let mut sim = start_simulation(104).await;
    let mut feeds = Vec::new();
    for index in 0..12 {
        feeds.push(sim.add_feed(&format!("feed-{index}")).await.unwrap());
    }
    for &feed in &feeds {
        for _ in 0..=feed % 3 {
            sim.publish_next(feed);
        }
    }

    for &feed in &feeds {
        let expected = (feed % 3) as u64 + 1;
        let view = sim.wait_for_sequence(feed, expected, SETTLE).await.unwrap();
        assert_eq!(view.last_sequence, Some(expected));
    }

    let stats = sim.handle.stats().await.unwrap();
    assert_eq!(stats.total, 12);
    assert_eq!(stats.active, 12);

    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_rejects_further_commands() {
    let mut sim = start_simulation(105).await;
    sim.add_feed("feed-A").await.unwrap();
    let handle = sim.handle.clone();
    sim.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(matches!(
        handle.list_subscriptions().await,
        Err(FeedError::EngineShutdown)
    ));
}
