//! End-to-end feed scenarios driven through the real engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use megatorrent_core::config::MegatorrentConfig;
use megatorrent_core::engine::{FeedEngineHandle, FeedEngineStats, spawn_feed_engine};
use megatorrent_core::registry::SubscriptionView;
use megatorrent_core::store::{MemoryStore, SubscriptionStore};
use serde::Serialize;
use tokio::time::Instant;

use crate::dht::{NetworkConfig, SimulatedDht};
use crate::publisher::{FeedPublisher, content_hash};
use crate::transfers::SimulatedTransferClient;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Running engine wired to a simulated network and transfer subsystem.
pub struct FeedSimulation {
    /// Simulated network shared with the engine
    pub dht: Arc<SimulatedDht>,
    /// Simulated transfer subsystem shared with the engine
    pub transfers: Arc<SimulatedTransferClient>,
    /// Handle to the running engine
    pub handle: FeedEngineHandle,
    publishers: Vec<FeedPublisher>,
    seed: u64,
}

impl FeedSimulation {
    /// Starts an engine backed by an in-memory store.
    ///
    /// # Errors
    ///
    /// - Engine failed to start
    pub async fn start(
        config: MegatorrentConfig,
        network: NetworkConfig,
        seed: u64,
    ) -> anyhow::Result<Self> {
        Self::start_with_store(config, network, seed, MemoryStore::new()).await
    }

    /// Starts an engine backed by `store`.
    ///
    /// # Errors
    ///
    /// - Saved state in `store` could not be loaded
    pub async fn start_with_store(
        config: MegatorrentConfig,
        network: NetworkConfig,
        seed: u64,
        store: Arc<dyn SubscriptionStore>,
    ) -> anyhow::Result<Self> {
        let dht = Arc::new(SimulatedDht::with_config(seed, network));
        let transfers = Arc::new(SimulatedTransferClient::new());
        let handle = spawn_feed_engine(config, dht.clone(), transfers.clone(), store)
            .await
            .context("failed to start feed engine")?;

        Ok(Self {
            dht,
            transfers,
            handle,
            publishers: Vec::new(),
            seed,
        })
    }

    /// Creates a new publisher and subscribes to its feed.
    ///
    /// Returns the feed's index for later calls.
    ///
    /// # Errors
    ///
    /// - Engine refused the subscription
    pub async fn add_feed(&mut self, label: &str) -> anyhow::Result<usize> {
        let index = self.create_publisher();
        let key = self.publishers[index].feed_key();
        self.handle
            .add_subscription(key, label)
            .await
            .with_context(|| format!("failed to subscribe to {label}"))?;
        Ok(index)
    }

    /// Creates a publisher without subscribing to it.
    pub fn create_publisher(&mut self) -> usize {
        let index = self.publishers.len();
        let feed_seed = self.seed.wrapping_add(index as u64 + 1);
        self.publishers.push(FeedPublisher::from_seed(feed_seed));
        index
    }

    /// Publisher for feed `index`.
    ///
    /// # Panics
    ///
    /// - `index` was not returned by this simulation
    pub fn publisher(&self, index: usize) -> &FeedPublisher {
        &self.publishers[index]
    }

    /// Publishes the next round of feed `index` and returns its sequence.
    pub fn publish_next(&mut self, index: usize) -> u64 {
        let publisher = &mut self.publishers[index];
        let round = publisher.sequence() + 1;
        publisher.publish_next(&self.dht, content_hash(index, round))
    }

    /// Publishes an explicit sequence for feed `index`.
    pub fn publish(&mut self, index: usize, sequence: u64) {
        self.publishers[index].publish(&self.dht, sequence, content_hash(index, sequence));
    }

    /// Polls the subscription list until `predicate` holds.
    ///
    /// # Errors
    ///
    /// - Predicate did not hold within `timeout`
    /// - Engine stopped
    pub async fn wait_for<F>(
        &self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<Vec<SubscriptionView>>
    where
        F: Fn(&[SubscriptionView]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let subscriptions = self.handle.list_subscriptions().await?;
            if predicate(&subscriptions) {
                return Ok(subscriptions);
            }
            if Instant::now() >= deadline {
                bail!("condition not reached within {:?}", timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Waits until feed `index` has committed `sequence` or later.
    ///
    /// # Errors
    ///
    /// - Sequence not reached within `timeout`
    pub async fn wait_for_sequence(
        &self,
        index: usize,
        sequence: u64,
        timeout: Duration,
    ) -> anyhow::Result<SubscriptionView> {
        let key = self.publishers[index].feed_key();
        let subscriptions = self
            .wait_for(timeout, |subscriptions| {
                subscriptions
                    .iter()
                    .any(|s| s.public_key == key && s.last_sequence >= Some(sequence))
            })
            .await?;
        subscriptions
            .into_iter()
            .find(|s| s.public_key == key)
            .context("subscription vanished")
    }

    /// Stops the engine, flushing its final state.
    ///
    /// # Errors
    ///
    /// - Engine already stopped
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.handle.shutdown().await?;
        Ok(())
    }
}

/// Batch scenario: many feeds publishing several rounds each.
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    /// Number of feeds to publish and subscribe
    pub feeds: usize,
    /// Rounds each feed publishes
    pub updates: u64,
    /// Seed for keys and packet loss
    pub seed: u64,
    /// Probability a lookup is lost
    pub loss_rate: f64,
    /// How long to wait for each round to reach every subscriber
    pub round_timeout: Duration,
}

impl Default for SimulationPlan {
    fn default() -> Self {
        Self {
            feeds: 3,
            updates: 5,
            seed: 42,
            loss_rate: 0.0,
            round_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of a [`SimulationPlan`] run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    /// Feeds in the scenario
    pub feeds: usize,
    /// Rounds every subscriber observed
    pub rounds_completed: u64,
    /// Whether every planned round was observed
    pub converged: bool,
    /// Lookups issued against the network
    pub lookups: u32,
    /// Transfers started
    pub transfers_added: u32,
    /// Transfers redirected to newer content
    pub transfers_updated: u32,
    /// Engine statistics at the end of the run
    pub stats: FeedEngineStats,
    /// Subscription table at the end of the run
    pub subscriptions: Vec<SubscriptionView>,
    /// Wall-clock run time in milliseconds
    pub elapsed_ms: u64,
}

impl SimulationPlan {
    /// Runs the plan against `config` and reports what subscribers saw.
    ///
    /// A round that never reaches every subscriber stops the run with
    /// `converged` false rather than an error.
    ///
    /// # Errors
    ///
    /// - Engine failed to start or stopped unexpectedly
    pub async fn run(&self, config: MegatorrentConfig) -> anyhow::Result<SimulationReport> {
        let started = Instant::now();
        let network = NetworkConfig {
            latency: Duration::ZERO,
            loss_rate: self.loss_rate,
        };
        let mut sim = FeedSimulation::start(config, network, self.seed).await?;

        for index in 0..self.feeds {
            sim.add_feed(&format!("feed-{index}")).await?;
        }

        let mut rounds_completed = 0;
        for round in 1..=self.updates {
            for index in 0..self.feeds {
                sim.publish_next(index);
            }
            let reached = sim
                .wait_for(self.round_timeout, |subscriptions| {
                    subscriptions
                        .iter()
                        .all(|s| s.last_sequence >= Some(round))
                })
                .await;
            if let Err(e) = reached {
                tracing::warn!("Round {} did not converge: {}", round, e);
                break;
            }
            rounds_completed = round;
            tracing::debug!("Round {} reached all {} feeds", round, self.feeds);
        }

        let stats = sim.handle.stats().await?;
        let subscriptions = sim.handle.list_subscriptions().await?;
        let report = SimulationReport {
            feeds: self.feeds,
            rounds_completed,
            converged: rounds_completed == self.updates,
            lookups: sim.dht.lookup_count(),
            transfers_added: sim.transfers.add_count(),
            transfers_updated: sim.transfers.update_count(),
            stats,
            subscriptions,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        sim.shutdown().await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use megatorrent_core::registry::SubscriptionState;

    use super::*;

    #[tokio::test]
    async fn test_single_feed_follows_publisher() {
        let mut sim = FeedSimulation::start(
            MegatorrentConfig::for_testing(),
            NetworkConfig::default(),
            9,
        )
        .await
        .unwrap();
        let feed = sim.add_feed("feed-A").await.unwrap();

        for _ in 0..3 {
            let sequence = sim.publish_next(feed);
            let view = sim
                .wait_for_sequence(feed, sequence, Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(view.state, SubscriptionState::Active);
        }

        let (_, transfer) = sim.transfers.transfer_labeled("feed-A").unwrap();
        assert_eq!(transfer.locator.as_str(), content_hash(feed, 3));
        sim.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_plan_converges_without_loss() {
        let plan = SimulationPlan {
            feeds: 4,
            updates: 3,
            ..Default::default()
        };
        let report = plan.run(MegatorrentConfig::for_testing()).await.unwrap();

        assert!(report.converged);
        assert_eq!(report.rounds_completed, 3);
        assert_eq!(report.transfers_added, 4);
        assert_eq!(report.stats.total, 4);
        assert_eq!(report.stats.pending, 0);
        assert!(report.subscriptions.iter().all(|s| s.last_sequence == Some(3)));
    }

    #[tokio::test]
    async fn test_plan_converges_under_packet_loss() {
        let plan = SimulationPlan {
            feeds: 2,
            updates: 3,
            loss_rate: 0.3,
            ..Default::default()
        };
        let report = plan.run(MegatorrentConfig::for_testing()).await.unwrap();
        assert!(report.converged);
        assert!(report.lookups > 6);
    }

    #[tokio::test]
    async fn test_total_loss_reports_no_convergence() {
        let plan = SimulationPlan {
            feeds: 1,
            updates: 2,
            loss_rate: 1.0,
            round_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let report = plan.run(MegatorrentConfig::for_testing()).await.unwrap();
        assert!(!report.converged);
        assert_eq!(report.rounds_completed, 0);
        assert_eq!(report.stats.pending, 1);
    }
}
