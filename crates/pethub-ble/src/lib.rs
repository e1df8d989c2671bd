//! BLE lamp management for the pethub hub.
//!
//! [`LampManager`] discovers lamps in periodic scan bursts, keeps a GATT
//! connection to each one, mirrors their state from notifications and
//! polls, and blacklists peripherals that never let the hub in. The radio
//! sits behind the [`LampTransport`] seam: [`mock`] simulates lamps, and the
//! `hardware-btleplug` feature enables a real backend.

pub mod config;
pub mod failure;
#[cfg(feature = "hardware-btleplug")]
pub mod hardware;
pub mod heuristics;
pub mod lamp;
pub mod manager;
pub mod mock;
pub mod state;
pub mod transport;
pub mod uuids;

pub use config::LampManagerConfig;
pub use failure::{FailureClass, classify_failure};
pub use heuristics::{LampMatch, is_lamp, match_lamp};
pub use lamp::{LampState, TemperatureBounds};
pub use manager::LampManager;
pub use state::{LampCapabilities, LampInfo, LampStats, ScanReport};
pub use transport::{
    Advertisement, AnyLampLink, AnyLampTransport, CharProps, DiscoveredCharacteristic, LampEvent,
    LampEventKind, LampEventSink, LampLink, LampTransport,
};

#[cfg(feature = "hardware-btleplug")]
pub use hardware::{BtleplugLink, BtleplugTransport};
