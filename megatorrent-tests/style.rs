//! Style Enforcement Tests
//!
//! Scans the production sources of every workspace crate for patterns that
//! clippy does not reject on its own.
//!
//! - `production_hygiene` - No dead code allowances or panicking unwraps outside tests

#[path = "style/production_hygiene.rs"]
mod production_hygiene;
