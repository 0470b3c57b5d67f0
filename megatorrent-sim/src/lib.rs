//! Megatorrent simulation framework: deterministic feeds for testing.

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
//!
//! Provides an in-memory stand-in for the distributed network, seeded feed
//! publishers and a transfer subsystem, so the full engine can be driven
//! end to end without touching a real network.
//!
//! # Features
//!
//! - **Deterministic Keys**: Same seed always produces the same feeds
//! - **Fault Injection**: Stalls, network errors, forged and missing records
//! - **Packet Loss**: Seeded loss so lossy runs are reproducible
//!
//! # Example
//!
//! ```rust,no_run
//! use megatorrent_core::config::MegatorrentConfig;
//! use megatorrent_sim::SimulationPlan;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let plan = SimulationPlan {
//!     feeds: 10,
//!     updates: 5,
//!     ..Default::default()
//! };
//! let report = plan.run(MegatorrentConfig::for_testing()).await?;
//! println!("Converged: {}", report.converged);
//! # Ok(())
//! # }
//! ```

pub mod dht;
pub mod publisher;
pub mod scenarios;
pub mod transfers;

pub use dht::{Fault, NetworkConfig, SimulatedDht};
pub use publisher::{FeedPublisher, content_hash};
pub use scenarios::{FeedSimulation, SimulationPlan, SimulationReport};
pub use transfers::{SimulatedTransfer, SimulatedTransferClient};
