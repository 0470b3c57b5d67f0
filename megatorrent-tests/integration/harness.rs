//! Shared helpers for integration scenarios.

use std::time::Duration;

use megatorrent_core::config::MegatorrentConfig;
use megatorrent_sim::{FeedSimulation, NetworkConfig};
use tokio::time::Instant;

/// Upper bound for any single wait in these tests.
pub const SETTLE: Duration = Duration::from_secs(3);

/// Simulation on the fast test configuration with a lossless network.
pub async fn start_simulation(seed: u64) -> FeedSimulation {
    start_with_config(MegatorrentConfig::for_testing(), seed).await
}

pub async fn start_with_config(config: MegatorrentConfig, seed: u64) -> FeedSimulation {
    FeedSimulation::start(config, NetworkConfig::default(), seed)
        .await
        .unwrap()
}

/// Waits until the simulated network has served at least `count` more
/// lookups than `baseline`.
pub async fn wait_for_lookups(sim: &FeedSimulation, baseline: u32, count: u32) {
    let deadline = Instant::now() + SETTLE;
    while sim.dht.lookup_count() < baseline + count {
        assert!(
            Instant::now() < deadline,
            "expected {} more lookups, saw {}",
            count,
            sim.dht.lookup_count() - baseline
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
