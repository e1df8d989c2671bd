//! Local-protocol device management for the pethub hub.
//!
//! [`DeviceManager`] keeps one connection per configured appliance (feeders,
//! litter boxes, fountains), retries commands, bounds status reads, merges
//! pushed data points and reconnects in the background with exponential
//! backoff. The wire protocol sits behind the [`LocalTransport`] seam; the
//! [`mock`] transport simulates appliances for tests and development.

pub mod config;
pub mod device;
pub mod manager;
pub mod mock;
pub mod transport;

pub use config::LocalManagerConfig;
pub use device::{ConnectionStats, DeviceConnectionInfo};
pub use manager::DeviceManager;
pub use transport::{
    AnyLocalSession, AnyLocalTransport, EventKind, EventSink, LocalSession, LocalTransport,
    TransportEvent,
};
