//! Integration tests for the JSON subscription store.
//!
//! Exercises the on-disk format through the registry's persistence view, the
//! same path the feed engine uses on every save and at startup.

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use megatorrent_core::feed::{ContentLocator, FeedKey};
use megatorrent_core::registry::{SubscriptionRegistry, SubscriptionState};
use megatorrent_core::resolver::ResolutionOutcome;
use megatorrent_core::scheduler::{DueQueue, QueuePoll};
use megatorrent_core::store::{
    CURRENT_STATE_VERSION, JsonFileStore, PersistedState, StoreError, SubscriptionStore,
};
use tempfile::TempDir;

/// Registry plus store rooted in a temporary directory.
struct StoreFixture {
    _dir: TempDir,
    store: JsonFileStore,
}

impl StoreFixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state").join("subscriptions.json"));
        Self { _dir: dir, store }
    }

    fn registry() -> (SubscriptionRegistry, Arc<DueQueue>) {
        let queue = Arc::new(DueQueue::new());
        (SubscriptionRegistry::new(queue.clone(), 3), queue)
    }
}

fn feed_key(seed: u8) -> FeedKey {
    FeedKey::from(SigningKey::from_bytes(&[seed; 32]).verifying_key())
}

#[tokio::test]
async fn test_missing_file_loads_empty_state() {
    let fixture = StoreFixture::new();
    let state = fixture.store.load().await.unwrap();
    assert_eq!(state.version, CURRENT_STATE_VERSION);
    assert!(state.subscriptions.is_empty());
}

#[tokio::test]
async fn test_registry_state_survives_restart() {
    let fixture = StoreFixture::new();
    let (registry, queue) = StoreFixture::registry();

    registry.add(feed_key(1), "feed-A").unwrap();
    registry.add(feed_key(2), "feed-B").unwrap();

    let QueuePoll::Due(ticket) = queue.poll(tokio::time::Instant::now()) else {
        panic!("first subscription should be due");
    };
    let locator = ContentLocator::parse(
        b"magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Episode+1",
    )
    .unwrap();
    registry.apply_resolution(
        &ticket,
        &ResolutionOutcome::Accepted {
            sequence: 5,
            locator: locator.clone(),
        },
    );

    let saved = PersistedState::new(registry.persisted_records());
    fixture.store.save(&saved).await.unwrap();

    let loaded = fixture.store.load().await.unwrap();
    assert_eq!(loaded, saved);

    let (restored, restored_queue) = StoreFixture::registry();
    assert_eq!(restored.restore(loaded.subscriptions), 2);
    assert_eq!(restored_queue.len(), 2);

    let resolved = restored.snapshot(&ticket.public_key).unwrap();
    assert_eq!(resolved.last_sequence, Some(5));
    assert_eq!(resolved.last_payload, Some(locator));
    assert_eq!(resolved.state, SubscriptionState::Active);

    let labels: Vec<String> = restored.list().into_iter().map(|s| s.label).collect();
    assert_eq!(labels, vec!["feed-A", "feed-B"]);
}

#[tokio::test]
async fn test_save_replaces_previous_state_and_leaves_no_temp_file() {
    let fixture = StoreFixture::new();
    let (registry, _) = StoreFixture::registry();

    registry.add(feed_key(1), "feed-A").unwrap();
    fixture
        .store
        .save(&PersistedState::new(registry.persisted_records()))
        .await
        .unwrap();

    registry.remove(&feed_key(1)).unwrap();
    fixture
        .store
        .save(&PersistedState::new(registry.persisted_records()))
        .await
        .unwrap();

    assert!(fixture.store.load().await.unwrap().subscriptions.is_empty());

    let dir = fixture.store.path().parent().unwrap();
    let names: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(names, vec![std::ffi::OsString::from("subscriptions.json")]);
}

#[tokio::test]
async fn test_newer_version_is_refused() {
    let fixture = StoreFixture::new();
    let state = PersistedState {
        version: CURRENT_STATE_VERSION + 1,
        subscriptions: Vec::new(),
    };
    fixture.store.save(&state).await.unwrap();

    let result = fixture.store.load().await;
    assert!(matches!(
        result,
        Err(StoreError::UnsupportedVersion { version }) if version == CURRENT_STATE_VERSION + 1
    ));
}

#[tokio::test]
async fn test_corrupt_file_is_a_serialization_error() {
    let fixture = StoreFixture::new();
    std::fs::create_dir_all(fixture.store.path().parent().unwrap()).unwrap();
    std::fs::write(fixture.store.path(), b"{ not json").unwrap();

    assert!(matches!(
        fixture.store.load().await,
        Err(StoreError::Serialization(_))
    ));
}

#[tokio::test]
async fn test_invalid_public_key_in_file_is_rejected() {
    let fixture = StoreFixture::new();
    std::fs::create_dir_all(fixture.store.path().parent().unwrap()).unwrap();
    let json = serde_json::json!({
        "version": 1,
        "subscriptions": [{
            "publicKey": "abcd",
            "label": "broken",
            "lastSequence": null,
            "lastPayload": null,
            "state": "pending",
            "addedAt": "2024-01-01T00:00:00Z"
        }]
    });
    std::fs::write(fixture.store.path(), json.to_string()).unwrap();

    assert!(fixture.store.load().await.is_err());
}
