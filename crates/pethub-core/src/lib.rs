//! Shared building blocks for the pethub device hub.
//!
//! This crate holds the pieces every other pethub crate agrees on: the
//! cross-crate [`Error`] type, identifier newtypes, the persisted data model
//! for appliances and lamps, the reconnect [`Backoff`] policy and the timing
//! defaults used by both device managers.

pub mod backoff;
pub mod constants;
pub mod error;
pub mod models;
pub mod types;

pub use backoff::Backoff;
pub use error::{Error, Result};
pub use models::{DeviceConfig, LampConfig};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
