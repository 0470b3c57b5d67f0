//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use megatorrent_core::config::MegatorrentConfig;
use megatorrent_core::engine::FeedError;
use megatorrent_core::feed::FeedKey;
use megatorrent_core::registry::{SubscriptionRegistry, SubscriptionView};
use megatorrent_core::scheduler::DueQueue;
use megatorrent_core::Result;
use megatorrent_core::store::{JsonFileStore, PersistedState, SubscriptionStore};
use megatorrent_sim::{SimulationPlan, SimulationReport};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Subscribe to a feed by hex public key or megatorrent:// URI
    Add {
        /// Feed public key or URI
        key: String,
        /// Human-readable label for the feed
        #[arg(short, long)]
        label: Option<String>,
    },
    /// Unsubscribe from a feed
    Remove {
        /// Feed public key or URI
        key: String,
    },
    /// List subscriptions
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Run feeds against a simulated network
    Simulate {
        /// Number of simulated feeds
        #[arg(short, long, default_value = "5")]
        feeds: usize,
        /// Updates each feed publishes
        #[arg(short, long, default_value = "3")]
        updates: u64,
        /// Seed for keys and packet loss
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Probability a lookup is lost (0.0 to 1.0)
        #[arg(long, default_value = "0.0")]
        loss_rate: f64,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands, state_file: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = MegatorrentConfig::from_env();
    if let Some(path) = state_file {
        config.storage.state_file = path;
    }
    tracing::debug!("Using state file {}", config.storage.state_file.display());

    match command {
        Commands::Add { key, label } => {
            let view = add_subscription(&config, &key, label).await?;
            println!("Subscribed to {} as \"{}\"", view.public_key, view.label);
            println!("  URI: {}", view.public_key.to_uri());
        }
        Commands::Remove { key } => {
            let public_key = remove_subscription(&config, &key).await?;
            println!("Unsubscribed from {public_key}");
        }
        Commands::List { json } => {
            let subscriptions = list_subscriptions(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&subscriptions)?);
            } else {
                print_table(&subscriptions, &config.storage.state_file);
            }
        }
        Commands::Simulate {
            feeds,
            updates,
            seed,
            loss_rate,
            json,
        } => {
            let plan = SimulationPlan {
                feeds,
                updates,
                seed,
                loss_rate: loss_rate.clamp(0.0, 1.0),
                round_timeout: Duration::from_secs(10),
            };
            let report = plan.run(MegatorrentConfig::for_testing()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
    }
    Ok(())
}

/// Loads the state file into a registry.
///
/// The registry's queue is never drained; the CLI only edits the table.
async fn load_registry(
    config: &MegatorrentConfig,
    store: &JsonFileStore,
) -> Result<SubscriptionRegistry> {
    let registry = SubscriptionRegistry::new(
        Arc::new(DueQueue::new()),
        config.scheduler.degraded_threshold,
    );
    let saved = store.load().await?;
    registry.restore(saved.subscriptions);
    Ok(registry)
}

async fn save_registry(store: &JsonFileStore, registry: &SubscriptionRegistry) -> Result<()> {
    store
        .save(&PersistedState::new(registry.persisted_records()))
        .await?;
    Ok(())
}

fn parse_key(input: &str) -> Result<FeedKey> {
    Ok(FeedKey::parse(input).map_err(FeedError::from)?)
}

/// Subscribe to a feed in the state file
///
/// Without a label the key's short form is used.
///
/// # Errors
/// - `MegatorrentError::Feed` - Key invalid or already subscribed
/// - `MegatorrentError::Store` - State file unreadable or not writable
pub async fn add_subscription(
    config: &MegatorrentConfig,
    key: &str,
    label: Option<String>,
) -> Result<SubscriptionView> {
    let public_key = parse_key(key)?;
    let store = JsonFileStore::new(&config.storage.state_file);
    let registry = load_registry(config, &store).await?;

    let label = label.unwrap_or_else(|| public_key.short());
    let subscription = registry
        .add(public_key, label)
        .map_err(FeedError::from)?;
    save_registry(&store, &registry).await?;

    Ok(SubscriptionView::from(&subscription))
}

/// Unsubscribe from a feed in the state file
///
/// # Errors
/// - `MegatorrentError::Feed` - Key invalid or not subscribed
/// - `MegatorrentError::Store` - State file unreadable or not writable
pub async fn remove_subscription(config: &MegatorrentConfig, key: &str) -> Result<FeedKey> {
    let public_key = parse_key(key)?;
    let store = JsonFileStore::new(&config.storage.state_file);
    let registry = load_registry(config, &store).await?;

    registry.remove(&public_key).map_err(FeedError::from)?;
    save_registry(&store, &registry).await?;

    Ok(public_key)
}

/// List subscriptions in the state file
///
/// # Errors
/// - `MegatorrentError::Store` - State file unreadable
pub async fn list_subscriptions(config: &MegatorrentConfig) -> Result<Vec<SubscriptionView>> {
    let store = JsonFileStore::new(&config.storage.state_file);
    let registry = load_registry(config, &store).await?;
    Ok(registry.list().iter().map(SubscriptionView::from).collect())
}

fn print_table(subscriptions: &[SubscriptionView], state_file: &Path) {
    println!("Subscriptions ({})", state_file.display());
    println!("{:-<78}", "");

    if subscriptions.is_empty() {
        println!("No subscriptions yet.");
        println!("Use 'megatorrent add <key-or-uri>' to follow a feed.");
        return;
    }

    println!(
        "{:<14} {:<24} {:<9} {:>8} {:>8}",
        "KEY", "LABEL", "STATE", "SEQ", "FAILURES"
    );
    for subscription in subscriptions {
        let sequence = subscription
            .last_sequence
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        println!(
            "{:<14} {:<24} {:<9} {:>8} {:>8}",
            subscription.public_key.short(),
            truncate(&subscription.label, 24),
            subscription.state.to_string(),
            sequence,
            subscription.consecutive_failures
        );
    }
}

fn print_report(report: &SimulationReport) {
    print_table(&report.subscriptions, Path::new("simulated"));
    println!();
    println!(
        "Rounds: {} ({})",
        report.rounds_completed,
        if report.converged {
            "converged"
        } else {
            "did not converge"
        }
    );
    println!("Lookups: {}", report.lookups);
    println!(
        "Transfers: {} added, {} updated",
        report.transfers_added, report.transfers_updated
    );
    println!(
        "States: {} active, {} degraded, {} pending",
        report.stats.active, report.stats.degraded, report.stats.pending
    );
    println!("Elapsed: {} ms", report.elapsed_ms);
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut shortened: String = text.chars().take(width - 1).collect();
    shortened.push('~');
    shortened
}

#[cfg(test)]
mod tests {
    use megatorrent_core::MegatorrentError;

    use super::*;

    const KEY: &str = "3d4017c3e843895a92b70aa74d1b7ebc9c982ccf2ec4968cc0cd55f12af4660c";

    fn config_in(dir: &tempfile::TempDir) -> MegatorrentConfig {
        let mut config = MegatorrentConfig::default();
        config.storage.state_file = dir.path().join("subscriptions.json");
        config
    }

    #[tokio::test]
    async fn test_add_list_remove_through_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        let view = add_subscription(&config, KEY, Some("feed-A".to_string()))
            .await
            .unwrap();
        assert_eq!(view.label, "feed-A");

        let listed = list_subscriptions(&config).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].public_key.to_string(), KEY);

        let removed = remove_subscription(&config, &format!("megatorrent://{KEY}"))
            .await
            .unwrap();
        assert_eq!(removed.to_string(), KEY);
        assert!(list_subscriptions(&config).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_errors_are_reported_as_such() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        let invalid = add_subscription(&config, "not-a-key", None).await.unwrap_err();
        assert!(invalid.is_user_error());

        add_subscription(&config, KEY, None).await.unwrap();
        let duplicate = add_subscription(&config, KEY, None).await.unwrap_err();
        assert!(matches!(
            duplicate,
            MegatorrentError::Feed(FeedError::DuplicateKey { .. })
        ));

        let missing = remove_subscription(&config, &"11".repeat(32)).await;
        assert!(missing.is_err());
    }

    #[test]
    fn test_truncate_long_labels() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-label", 6), "a-ver~");
    }
}
