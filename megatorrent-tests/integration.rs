//! Integration tests for Megatorrent
//!
//! These tests drive the feed engine end to end against the simulated
//! network and transfer subsystem. They cover subscription lifecycle,
//! failure handling, persistence across restarts and materialization.

#[path = "integration/harness.rs"]
mod harness;

#[path = "integration/feed_lifecycle.rs"]
mod feed_lifecycle;

#[path = "integration/failure_handling.rs"]
mod failure_handling;

#[path = "integration/persistence.rs"]
mod persistence;

#[path = "integration/materialization.rs"]
mod materialization;
