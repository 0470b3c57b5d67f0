//! Centralized configuration for Megatorrent.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

use crate::feed::MAX_PAYLOAD_SIZE;

/// Longest delay any refresh, retry or deadline may be configured to.
pub const MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(30 * 24 * 3600); // 30 days

/// Central configuration for all Megatorrent components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct MegatorrentConfig {
    pub resolver: ResolverConfig,
    pub scheduler: SchedulerConfig,
    pub transfers: TransferConfig,
    pub storage: StorageConfig,
}

/// Network lookup configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Deadline for a single lookup on the distributed network
    pub lookup_timeout: Duration,
    /// Largest record payload accepted
    pub max_payload_size: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: Duration::from_secs(10),
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

/// Refresh cadence, retry backoff and worker pool sizing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent resolution workers
    pub worker_count: usize,
    /// Delay between refreshes of a healthy feed
    pub refresh_interval: Duration,
    /// First retry delay after a failure
    pub retry_base: Duration,
    /// Ceiling for retry delays
    pub retry_max: Duration,
    /// Random spread applied to every delay (0.0 to 1.0)
    pub jitter_ratio: f64,
    /// Consecutive failures before an active feed is marked degraded
    pub degraded_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            refresh_interval: Duration::from_secs(900), // 15 minutes
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(3600), // 1 hour
            jitter_ratio: 0.1,
            degraded_threshold: 3,
        }
    }
}

/// Transfer subsystem configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Deadline for a single add or update call
    pub transfer_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_secs(30),
        }
    }
}

/// Subscription persistence configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// JSON file holding the subscription table
    pub state_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("megatorrent-subscriptions.json"),
        }
    }
}

impl MegatorrentConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Durations are given in seconds and capped at [`MAX_SCHEDULE_DELAY`].
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(timeout) = env_seconds("MEGATORRENT_LOOKUP_TIMEOUT") {
            config.resolver.lookup_timeout = timeout;
        }

        if let Some(timeout) = env_seconds("MEGATORRENT_TRANSFER_TIMEOUT") {
            config.transfers.transfer_timeout = timeout;
        }

        if let Ok(workers) = std::env::var("MEGATORRENT_WORKERS")
            && let Ok(count) = workers.parse::<usize>()
        {
            config.scheduler.worker_count = count.max(1);
        }

        if let Some(interval) = env_seconds("MEGATORRENT_REFRESH_INTERVAL") {
            config.scheduler.refresh_interval = interval;
        }

        if let Ok(threshold) = std::env::var("MEGATORRENT_DEGRADED_THRESHOLD")
            && let Ok(failures) = threshold.parse::<u32>()
        {
            config.scheduler.degraded_threshold = failures.max(1);
        }

        if let Ok(path) = std::env::var("MEGATORRENT_STATE_FILE")
            && !path.is_empty()
        {
            config.storage.state_file = PathBuf::from(path);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Millisecond intervals and no jitter, so scenarios settle quickly and
    /// deterministically.
    pub fn for_testing() -> Self {
        Self {
            resolver: ResolverConfig {
                lookup_timeout: Duration::from_millis(100),
                max_payload_size: MAX_PAYLOAD_SIZE,
            },
            scheduler: SchedulerConfig {
                worker_count: 2,
                refresh_interval: Duration::from_millis(25),
                retry_base: Duration::from_millis(10),
                retry_max: Duration::from_millis(40),
                jitter_ratio: 0.0,
                degraded_threshold: 3,
            },
            transfers: TransferConfig {
                transfer_timeout: Duration::from_millis(100),
            },
            storage: StorageConfig::default(),
        }
    }
}

fn env_seconds(name: &str) -> Option<Duration> {
    let seconds = std::env::var(name).ok()?.parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds).min(MAX_SCHEDULE_DELAY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = MegatorrentConfig::default();

        assert_eq!(config.resolver.lookup_timeout, Duration::from_secs(10));
        assert_eq!(config.resolver.max_payload_size, 1000);
        assert_eq!(config.scheduler.worker_count, 4);
        assert_eq!(config.scheduler.degraded_threshold, 3);
        assert!(config.scheduler.retry_base < config.scheduler.retry_max);
        assert_eq!(
            config.storage.state_file,
            PathBuf::from("megatorrent-subscriptions.json")
        );
    }

    #[test]
    fn test_testing_preset() {
        let config = MegatorrentConfig::for_testing();
        assert_eq!(config.scheduler.jitter_ratio, 0.0);
        assert!(config.scheduler.refresh_interval < Duration::from_secs(1));
        assert!(config.resolver.lookup_timeout < Duration::from_secs(1));
        assert!(config.transfers.transfer_timeout < Duration::from_secs(1));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("MEGATORRENT_LOOKUP_TIMEOUT", "3");
            std::env::set_var("MEGATORRENT_WORKERS", "8");
            std::env::set_var("MEGATORRENT_REFRESH_INTERVAL", "60");
            std::env::set_var("MEGATORRENT_DEGRADED_THRESHOLD", "5");
            std::env::set_var("MEGATORRENT_STATE_FILE", "/tmp/feeds.json");
            std::env::set_var("MEGATORRENT_TRANSFER_TIMEOUT", "12");
        }

        let config = MegatorrentConfig::from_env();

        assert_eq!(config.resolver.lookup_timeout, Duration::from_secs(3));
        assert_eq!(config.scheduler.worker_count, 8);
        assert_eq!(config.scheduler.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.scheduler.degraded_threshold, 5);
        assert_eq!(config.storage.state_file, PathBuf::from("/tmp/feeds.json"));
        assert_eq!(config.transfers.transfer_timeout, Duration::from_secs(12));

        // Cleanup
        unsafe {
            std::env::remove_var("MEGATORRENT_TRANSFER_TIMEOUT");
            std::env::remove_var("MEGATORRENT_LOOKUP_TIMEOUT");
            std::env::remove_var("MEGATORRENT_WORKERS");
            std::env::remove_var("MEGATORRENT_REFRESH_INTERVAL");
            std::env::remove_var("MEGATORRENT_DEGRADED_THRESHOLD");
            std::env::remove_var("MEGATORRENT_STATE_FILE");
        }
    }

    #[test]
    fn test_env_durations_are_capped() {
        unsafe {
            std::env::set_var("MEGATORRENT_TEST_HUGE_INTERVAL", "18446744073709551615");
        }
        assert_eq!(
            env_seconds("MEGATORRENT_TEST_HUGE_INTERVAL"),
            Some(MAX_SCHEDULE_DELAY)
        );
        unsafe {
            std::env::remove_var("MEGATORRENT_TEST_HUGE_INTERVAL");
        }
        assert_eq!(env_seconds("MEGATORRENT_UNSET_VARIABLE"), None);
    }
}
