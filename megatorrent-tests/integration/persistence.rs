//! Subscription state surviving engine restarts.

use std::sync::Arc;

use megatorrent_core::config::MegatorrentConfig;
use megatorrent_core::registry::SubscriptionState;
use megatorrent_core::store::{JsonFileStore, SubscriptionStore};
use megatorrent_sim::{FeedSimulation, NetworkConfig, content_hash};
use tempfile::TempDir;

use crate::harness::SETTLE;

async fn start_on_disk(dir: &TempDir, seed: u64) -> FeedSimulation {
    let store = Arc::new(JsonFileStore::new(dir.path().join("subscriptions.json")));
    FeedSimulation::start_with_store(
        MegatorrentConfig::for_testing(),
        NetworkConfig::default(),
        seed,
        store,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_restart_restores_subscriptions_and_keeps_resolving() {
    let dir = tempfile::tempdir().unwrap();

    let mut sim = start_on_disk(&dir, 300).await;
    let resolved = sim.add_feed("feed-A").await.unwrap();
    let unresolved = sim.add_feed("feed-B").await.unwrap();
    let resolved_key = sim.publisher(resolved).feed_key();
    let unresolved_key = sim.publisher(unresolved).feed_key();
    sim.publish(resolved, 2);
    sim.wait_for_sequence(resolved, 2, SETTLE).await.unwrap();
    sim.shutdown().await.unwrap();

    // Same seed, so the publishers come back with the same keys.
    let mut sim = start_on_disk(&dir, 300).await;
    let resolved = sim.create_publisher();
    let unresolved = sim.create_publisher();
    assert_eq!(sim.publisher(resolved).feed_key(), resolved_key);
    assert_eq!(sim.publisher(unresolved).feed_key(), unresolved_key);

    let view = sim.handle.subscription(resolved_key).await.unwrap();
    assert_eq!(view.label, "feed-A");
    assert_eq!(view.last_sequence, Some(2));
    assert_eq!(view.last_payload, Some(content_hash(resolved, 2)));
    assert_ne!(view.state, SubscriptionState::Pending);

    let view = sim.handle.subscription(unresolved_key).await.unwrap();
    assert_eq!(view.label, "feed-B");
    assert_eq!(view.last_sequence, None);
    assert_eq!(view.state, SubscriptionState::Pending);

    sim.publish(resolved, 3);
    sim.publish(unresolved, 1);
    sim.wait_for_sequence(resolved, 3, SETTLE).await.unwrap();
    sim.wait_for_sequence(unresolved, 1, SETTLE).await.unwrap();
    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_removed_feed_stays_removed_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let mut sim = start_on_disk(&dir, 301).await;
    let kept = sim.add_feed("kept").await.unwrap();
    let dropped = sim.add_feed("dropped").await.unwrap();
    let kept_key = sim.publisher(kept).feed_key();
    let dropped_key = sim.publisher(dropped).feed_key();
    sim.handle.remove_subscription(dropped_key).await.unwrap();
    sim.shutdown().await.unwrap();

    let store = JsonFileStore::new(dir.path().join("subscriptions.json"));
    let saved = store.load().await.unwrap();
    let keys: Vec<_> = saved.subscriptions.iter().map(|s| s.public_key).collect();
    assert_eq!(keys, vec![kept_key]);

    let sim = start_on_disk(&dir, 301).await;
    let listed = sim.handle.list_subscriptions().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].public_key, kept_key);
    sim.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_state_file_is_camel_case_json() {
    let dir = tempfile::tempdir().unwrap();
    let mut sim = start_on_disk(&dir, 302).await;
    let feed = sim.add_feed("feed-A").await.unwrap();
    sim.publish(feed, 1);
    sim.wait_for_sequence(feed, 1, SETTLE).await.unwrap();
    sim.shutdown().await.unwrap();

    let raw = std::fs::read_to_string(dir.path().join("subscriptions.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["version"], 1);
    let entry = &json["subscriptions"][0];
    assert_eq!(entry["label"], "feed-A");
    assert_eq!(entry["lastSequence"], 1);
    assert_eq!(entry["lastPayload"], content_hash(feed, 1));
    assert!(entry["publicKey"].is_string());
}
