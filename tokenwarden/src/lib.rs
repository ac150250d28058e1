//! tokenwarden library crate.
//!
//! Two cooperating subsystems live here:
//!
//! - [`coordinator`] + [`poll`]: notice when the remote peer needs a fresh page
//!   token, drive a browser tab to regenerate one and forward it exactly once
//!   per cycle.
//! - [`clearance`]: a persisted, TTL-bound cache of clearance cookies keyed by
//!   egress path and identity, filled on a miss by an external scraper process.

pub mod bridge;
pub mod browser;
pub mod clearance;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod peer;
pub mod poll;
pub mod utils;

pub use error::{Error, Result};
