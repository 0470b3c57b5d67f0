//! Actor implementation for the feed engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::FeedError;
use super::commands::FeedEngineCommand;
use super::core::FeedEngine;
use super::handle::FeedEngineHandle;
use crate::config::MegatorrentConfig;
use crate::materializer::{Materializer, TransferClient};
use crate::registry::SubscriptionRegistry;
use crate::resolver::{DhtClient, Resolver};
use crate::scheduler::{BackoffPolicy, DueQueue, ResolutionEvent, UpdateScheduler, WorkerContext};
use crate::store::SubscriptionStore;

/// How often a failed save is retried.
const PERSIST_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Spawns the feed engine actor and returns its handle.
///
/// Loads saved subscriptions from `store`, schedules each for an immediate
/// refresh and starts the worker pool.
///
/// # Errors
///
/// - `FeedError::Store` - Saved state could not be read
///
/// # Examples
/// ```rust,ignore
/// use std::sync::Arc;
///
/// use megatorrent_core::config::MegatorrentConfig;
/// use megatorrent_core::engine::spawn_feed_engine;
/// use megatorrent_core::store::JsonFileStore;
///
/// let config = MegatorrentConfig::from_env();
/// let store = Arc::new(JsonFileStore::new(&config.storage.state_file));
/// let handle = spawn_feed_engine(config, dht_client, transfer_client, store).await?;
/// ```
pub async fn spawn_feed_engine(
    config: MegatorrentConfig,
    dht: Arc<dyn DhtClient>,
    transfers: Arc<dyn TransferClient>,
    store: Arc<dyn SubscriptionStore>,
) -> Result<FeedEngineHandle, FeedError> {
    let saved = store.load().await?;

    let queue = Arc::new(DueQueue::new());
    let registry = Arc::new(SubscriptionRegistry::new(
        queue.clone(),
        config.scheduler.degraded_threshold,
    ));
    registry.restore(saved.subscriptions);

    let materializer = Arc::new(Materializer::new(transfers, &config.transfers));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let context = WorkerContext {
        registry: registry.clone(),
        queue: queue.clone(),
        resolver: Resolver::new(dht, &config.resolver),
        materializer: materializer.clone(),
        policy: BackoffPolicy::from_config(&config.scheduler),
        events: events_tx,
    };
    let scheduler = UpdateScheduler::spawn(context, config.scheduler.worker_count);

    let engine = FeedEngine::new(registry, queue, materializer, store, scheduler);
    let (sender, receiver) = mpsc::channel(100);

    tokio::spawn(async move {
        run_actor_loop(engine, receiver, events_rx).await;
    });

    Ok(FeedEngineHandle::new(sender))
}

/// Runs the main actor message processing loop.
///
/// Controller commands and worker events are handled one at a time. Bursts
/// of worker events collapse into a single save. The loop ends on a
/// shutdown command or when every handle has been dropped.
async fn run_actor_loop(
    mut engine: FeedEngine,
    mut receiver: mpsc::Receiver<FeedEngineCommand>,
    mut events: mpsc::UnboundedReceiver<ResolutionEvent>,
) {
    tracing::debug!("Feed engine actor started");

    let mut retry = tokio::time::interval(PERSIST_RETRY_INTERVAL);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    break;
                };
                if !handle_command(&mut engine, command).await {
                    return;
                }
            }
            Some(event) = events.recv() => {
                let mut coalesced = 1;
                while events.try_recv().is_ok() {
                    coalesced += 1;
                }
                tracing::trace!(
                    "Saving after {} resolution events (latest {})",
                    coalesced,
                    event.public_key.short()
                );
                engine.persist().await;
            }
            _ = retry.tick(), if engine.is_dirty() => {
                engine.persist().await;
            }
        }
    }

    tracing::debug!("All feed engine handles dropped");
    engine.shutdown().await;
}

/// Handles a single command for the feed engine.
/// Returns true to continue processing, false to shutdown.
async fn handle_command(engine: &mut FeedEngine, command: FeedEngineCommand) -> bool {
    match command {
        FeedEngineCommand::AddSubscription {
            public_key,
            label,
            responder,
        } => {
            let result = engine.add_subscription(public_key, label).await;
            let _ = responder.send(result);
        }

        FeedEngineCommand::RemoveSubscription {
            public_key,
            responder,
        } => {
            let result = engine.remove_subscription(public_key).await;
            let _ = responder.send(result);
        }

        FeedEngineCommand::ListSubscriptions { responder } => {
            let _ = responder.send(engine.list_subscriptions());
        }

        FeedEngineCommand::GetSubscription {
            public_key,
            responder,
        } => {
            let _ = responder.send(engine.subscription(public_key));
        }

        FeedEngineCommand::Reconcile { responder } => {
            engine.spawn_reconcile(responder);
        }

        FeedEngineCommand::GetStats { responder } => {
            let _ = responder.send(engine.stats());
        }

        FeedEngineCommand::Shutdown { responder } => {
            tracing::debug!("Feed engine actor shutting down");
            engine.shutdown().await;
            let _ = responder.send(());
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::feed::{ContentLocator, DhtRecord, FeedKey};
    use crate::registry::{Subscription, SubscriptionState};
    use crate::store::{MemoryStore, PersistedState, PersistedSubscription};
    use crate::test_mocks::{MockResponse, mock_collaborators};

    fn feed(seed: u8) -> (SigningKey, FeedKey) {
        let signing_key = SigningKey::from_bytes(&[seed; 32]);
        let key = FeedKey::from(signing_key.verifying_key());
        (signing_key, key)
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let (dht, transfers) = mock_collaborators();
        let store = MemoryStore::new();
        let handle =
            spawn_feed_engine(MegatorrentConfig::for_testing(), dht, transfers, store.clone())
                .await
                .unwrap();

        assert!(handle.is_running());
        assert_eq!(handle.stats().await.unwrap().total, 0);

        handle.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            handle.stats().await,
            Err(FeedError::EngineShutdown)
        ));
        assert!(store.save_count() >= 1);
    }

    #[tokio::test]
    async fn test_add_list_remove_round_trip() {
        let (dht, transfers) = mock_collaborators();
        let store = MemoryStore::new();
        let handle =
            spawn_feed_engine(MegatorrentConfig::for_testing(), dht, transfers, store.clone())
                .await
                .unwrap();
        let (_, key) = feed(1);

        let view = handle.add_subscription(key, "feed-A").await.unwrap();
        assert_eq!(view.state, SubscriptionState::Pending);
        assert_eq!(store.current().await.subscriptions.len(), 1);

        assert!(matches!(
            handle.add_subscription(key, "again").await,
            Err(FeedError::DuplicateKey { .. })
        ));

        let listed = handle.list_subscriptions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].label, "feed-A");

        handle.remove_subscription(key).await.unwrap();
        assert!(handle.list_subscriptions().await.unwrap().is_empty());
        assert!(store.current().await.subscriptions.is_empty());
        assert!(matches!(
            handle.remove_subscription(key).await,
            Err(FeedError::NotFound { .. })
        ));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_uri_is_rejected() {
        let (dht, transfers) = mock_collaborators();
        let handle = spawn_feed_engine(
            MegatorrentConfig::for_testing(),
            dht,
            transfers,
            MemoryStore::new(),
        )
        .await
        .unwrap();

        assert!(matches!(
            handle.add_subscription_uri("megatorrent://xyz", "bad").await,
            Err(FeedError::InvalidKey { .. })
        ));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_resolution_is_persisted_and_restored() {
        let (dht, transfers) = mock_collaborators();
        let store = MemoryStore::new();
        let (signing_key, key) = feed(2);
        dht.respond(MockResponse::Record(DhtRecord::sign(
            &signing_key,
            5,
            "1111111111111111111111111111111111111111",
        )));

        let handle = spawn_feed_engine(
            MegatorrentConfig::for_testing(),
            dht,
            transfers,
            store.clone(),
        )
        .await
        .unwrap();
        handle.add_subscription(key, "feed-A").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let saved = store.current().await;
            if saved
                .subscriptions
                .first()
                .is_some_and(|s| s.last_sequence == Some(5))
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "resolution never saved");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await.unwrap();

        let (dht, transfers) = mock_collaborators();
        let restarted = spawn_feed_engine(
            MegatorrentConfig::for_testing(),
            dht,
            transfers,
            store.clone(),
        )
        .await
        .unwrap();
        let view = restarted.subscription(key).await.unwrap();
        assert_eq!(view.last_sequence, Some(5));
        assert_ne!(view.state, SubscriptionState::Pending);

        restarted.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stuck_transfer_calls_never_block_the_actor() {
        let (dht, transfers) = mock_collaborators();
        transfers.hang();
        let (signing_key, key) = feed(3);
        dht.respond(MockResponse::Record(DhtRecord::sign(
            &signing_key,
            5,
            "1111111111111111111111111111111111111111",
        )));

        let handle = spawn_feed_engine(
            MegatorrentConfig::for_testing(),
            dht.clone(),
            transfers,
            MemoryStore::new(),
        )
        .await
        .unwrap();
        handle.add_subscription(key, "feed-A").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while handle.subscription(key).await.unwrap().last_sequence != Some(5) {
            assert!(tokio::time::Instant::now() < deadline, "feed never resolved");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let after_accept = dht.lookups();

        let reconciling = handle.clone();
        let reconcile = tokio::spawn(async move { reconciling.reconcile().await });
        let listed = tokio::time::timeout(Duration::from_millis(500), handle.list_subscriptions())
            .await
            .expect("list must not wait on transfer calls")
            .unwrap();
        assert_eq!(listed.len(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(dht.lookups() > after_accept);

        let report = reconcile.await.unwrap().unwrap();
        assert_eq!(report.failed, report.attempted);

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown must not wait on transfer calls")
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_runs_beside_other_commands() {
        let (dht, transfers) = mock_collaborators();
        transfers.hang();
        let store = MemoryStore::new();
        let (_, key) = feed(4);

        let mut resolved = Subscription::new(key, "feed-A");
        resolved.last_sequence = Some(5);
        resolved.last_payload = Some(
            ContentLocator::parse(b"1111111111111111111111111111111111111111").unwrap(),
        );
        resolved.state = SubscriptionState::Active;
        store
            .save(&PersistedState::new(vec![PersistedSubscription::from(
                &resolved,
            )]))
            .await
            .unwrap();

        let mut config = MegatorrentConfig::for_testing();
        config.transfers.transfer_timeout = Duration::from_secs(30);
        let handle = spawn_feed_engine(config, dht, transfers, store)
            .await
            .unwrap();

        let reconciling = handle.clone();
        let reconcile = tokio::spawn(async move { reconciling.reconcile().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let listed = tokio::time::timeout(Duration::from_millis(500), handle.list_subscriptions())
            .await
            .expect("list must not wait behind reconcile")
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!reconcile.is_finished());

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown must not wait behind reconcile")
            .unwrap();
        reconcile.abort();
    }
}
