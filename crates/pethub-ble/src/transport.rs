//! BLE transport seam.
//!
//! A [`LampTransport`] scans for advertisements and opens [`LampLink`]s.
//! Notifications and link loss are reported through the [`LampEventSink`]
//! handed to `connect`, tagged with the link generation so the manager can
//! drop events from links it already abandoned.

use crate::mock::{MockLampLink, MockLampTransport};
use pethub_core::{LampConfig, LampId, Result};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[cfg(feature = "hardware-btleplug")]
use crate::hardware::{BtleplugLink, BtleplugTransport};

/// One advertisement seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertisement {
    /// Platform peripheral id; equals the address where the platform exposes it.
    pub id: LampId,
    pub address: String,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
    pub manufacturer_ids: Vec<u16>,
    pub rssi: Option<i16>,
}

/// Capabilities of a discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharProps {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

impl CharProps {
    pub const ALL: Self = Self {
        read: true,
        write: true,
        notify: true,
    };

    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
        notify: false,
    };

    pub const WRITE_ONLY: Self = Self {
        read: false,
        write: true,
        notify: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub props: CharProps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LampEventKind {
    /// A subscribed characteristic changed.
    Notification { uuid: Uuid, value: Vec<u8> },
    /// The peripheral dropped the link.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LampEvent {
    pub lamp: LampId,
    pub link: u64,
    pub kind: LampEventKind,
}

/// Event sender bound to one link.
#[derive(Debug, Clone)]
pub struct LampEventSink {
    lamp: LampId,
    link: u64,
    tx: mpsc::UnboundedSender<LampEvent>,
}

impl LampEventSink {
    pub(crate) fn new(lamp: LampId, link: u64, tx: mpsc::UnboundedSender<LampEvent>) -> Self {
        Self { lamp, link, tx }
    }

    pub fn lamp(&self) -> &LampId {
        &self.lamp
    }

    /// Report a notification. Returns `false` once the manager is gone.
    pub fn notification(&self, uuid: Uuid, value: Vec<u8>) -> bool {
        self.send(LampEventKind::Notification { uuid, value })
    }

    /// Report link loss.
    pub fn disconnected(&self) -> bool {
        self.send(LampEventKind::Disconnected)
    }

    fn send(&self, kind: LampEventKind) -> bool {
        self.tx
            .send(LampEvent {
                lamp: self.lamp.clone(),
                link: self.link,
                kind,
            })
            .is_ok()
    }
}

/// Radio access.
pub trait LampTransport: Send + Sync + 'static {
    type Link: LampLink;

    /// Run one active scan burst of `window` and return what was seen.
    fn scan(&self, window: Duration) -> impl Future<Output = Result<Vec<Advertisement>>> + Send;

    /// Open a GATT link. The caller bounds the whole connect pipeline.
    fn connect(
        &self,
        lamp: &LampConfig,
        events: LampEventSink,
    ) -> impl Future<Output = Result<Self::Link>> + Send;
}

/// An open GATT link.
pub trait LampLink: Send + Sync + 'static {
    /// Discover services and characteristics.
    fn discover(&self) -> impl Future<Output = Result<Vec<DiscoveredCharacteristic>>> + Send;

    fn subscribe(&self, uuid: Uuid) -> impl Future<Output = Result<()>> + Send;

    fn read(&self, uuid: Uuid) -> impl Future<Output = Result<Vec<u8>>> + Send;

    fn write(&self, uuid: Uuid, value: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Close the link. Never fails.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}

/// Enum wrapper for transport dispatch.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AnyLampTransport {
    Mock(MockLampTransport),
    #[cfg(feature = "hardware-btleplug")]
    Btleplug(BtleplugTransport),
}

impl From<MockLampTransport> for AnyLampTransport {
    fn from(transport: MockLampTransport) -> Self {
        Self::Mock(transport)
    }
}

#[cfg(feature = "hardware-btleplug")]
impl From<BtleplugTransport> for AnyLampTransport {
    fn from(transport: BtleplugTransport) -> Self {
        Self::Btleplug(transport)
    }
}

impl LampTransport for AnyLampTransport {
    type Link = AnyLampLink;

    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>> {
        match self {
            Self::Mock(t) => t.scan(window).await,
            #[cfg(feature = "hardware-btleplug")]
            Self::Btleplug(t) => t.scan(window).await,
        }
    }

    async fn connect(&self, lamp: &LampConfig, events: LampEventSink) -> Result<AnyLampLink> {
        match self {
            Self::Mock(t) => t.connect(lamp, events).await.map(AnyLampLink::Mock),
            #[cfg(feature = "hardware-btleplug")]
            Self::Btleplug(t) => t.connect(lamp, events).await.map(AnyLampLink::Btleplug),
        }
    }
}

/// Enum wrapper for link dispatch.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnyLampLink {
    Mock(MockLampLink),
    #[cfg(feature = "hardware-btleplug")]
    Btleplug(BtleplugLink),
}

impl LampLink for AnyLampLink {
    async fn discover(&self) -> Result<Vec<DiscoveredCharacteristic>> {
        match self {
            Self::Mock(l) => l.discover().await,
            #[cfg(feature = "hardware-btleplug")]
            Self::Btleplug(l) => l.discover().await,
        }
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<()> {
        match self {
            Self::Mock(l) => l.subscribe(uuid).await,
            #[cfg(feature = "hardware-btleplug")]
            Self::Btleplug(l) => l.subscribe(uuid).await,
        }
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        match self {
            Self::Mock(l) => l.read(uuid).await,
            #[cfg(feature = "hardware-btleplug")]
            Self::Btleplug(l) => l.read(uuid).await,
        }
    }

    async fn write(&self, uuid: Uuid, value: &[u8]) -> Result<()> {
        match self {
            Self::Mock(l) => l.write(uuid, value).await,
            #[cfg(feature = "hardware-btleplug")]
            Self::Btleplug(l) => l.write(uuid, value).await,
        }
    }

    async fn disconnect(&self) {
        match self {
            Self::Mock(l) => l.disconnect().await,
            #[cfg(feature = "hardware-btleplug")]
            Self::Btleplug(l) => l.disconnect().await,
        }
    }
}
