//! Local-protocol transport seam.
//!
//! A [`LocalTransport`] opens one [`LocalSession`] per appliance. The
//! session carries the request/response side (status reads, data point
//! writes); everything the appliance sends on its own arrives through the
//! [`EventSink`] handed to `connect`.
//!
//! Trait methods return `impl Future + Send` so the manager can drive them
//! from spawned tasks. Implementations may still be written with `async fn`.
//! As with the other hardware seams, the traits are not object-safe; the
//! manager uses the [`AnyLocalTransport`] / [`AnyLocalSession`] enums.

use crate::mock::{MockLocalSession, MockLocalTransport};
use pethub_core::{DeviceConfig, DeviceId, DpsMap, Result};
use serde_json::Value;
use std::future::Future;
use tokio::sync::mpsc;

/// Something the appliance reported without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Decoded data point update (usually partial).
    Data(DpsMap),
    /// Decrypted payload the transport could not decode into data points.
    Frame(Vec<u8>),
    /// The appliance closed the socket.
    Closed,
    /// The socket failed.
    Error(String),
}

/// Event tagged with the device and the session that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub device: DeviceId,
    pub session: u64,
    pub kind: EventKind,
}

/// Sender side of the manager's event channel, bound to one session.
#[derive(Debug, Clone)]
pub struct EventSink {
    device: DeviceId,
    session: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub(crate) fn new(
        device: DeviceId,
        session: u64,
        tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            device,
            session,
            tx,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Report a data point update. Returns `false` once the manager is gone.
    pub fn data(&self, dps: DpsMap) -> bool {
        self.send(EventKind::Data(dps))
    }

    /// Report an undecodable payload.
    pub fn frame(&self, raw: Vec<u8>) -> bool {
        self.send(EventKind::Frame(raw))
    }

    /// Report that the appliance closed the connection.
    pub fn closed(&self) -> bool {
        self.send(EventKind::Closed)
    }

    /// Report a socket failure.
    pub fn error(&self, message: impl Into<String>) -> bool {
        self.send(EventKind::Error(message.into()))
    }

    fn send(&self, kind: EventKind) -> bool {
        self.tx
            .send(TransportEvent {
                device: self.device.clone(),
                session: self.session,
                kind,
            })
            .is_ok()
    }
}

/// Opens sessions to local-protocol appliances.
pub trait LocalTransport: Send + Sync + 'static {
    type Session: LocalSession;

    /// Open a session. Inbound pushes, closes and errors go to `events`.
    ///
    /// The caller enforces the connect timeout.
    fn connect(
        &self,
        config: &DeviceConfig,
        events: EventSink,
    ) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// An open session with one appliance.
pub trait LocalSession: Send + Sync + 'static {
    /// Read all data points.
    fn status(&self) -> impl Future<Output = Result<DpsMap>> + Send;

    /// Write one data point.
    fn set(&self, field: &str, value: &Value) -> impl Future<Output = Result<()>> + Send;

    /// Close the socket. Never fails; errors are the transport's to log.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Enum wrapper for transport dispatch.
///
/// Marked `#[non_exhaustive]` so further transports can be added as variants
/// without breaking downstream matches.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AnyLocalTransport {
    /// Scriptable in-process transport.
    Mock(MockLocalTransport),
}

impl From<MockLocalTransport> for AnyLocalTransport {
    fn from(transport: MockLocalTransport) -> Self {
        Self::Mock(transport)
    }
}

impl LocalTransport for AnyLocalTransport {
    type Session = AnyLocalSession;

    async fn connect(&self, config: &DeviceConfig, events: EventSink) -> Result<AnyLocalSession> {
        match self {
            Self::Mock(transport) => transport
                .connect(config, events)
                .await
                .map(AnyLocalSession::Mock),
        }
    }
}

/// Enum wrapper for session dispatch.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnyLocalSession {
    Mock(MockLocalSession),
}

impl LocalSession for AnyLocalSession {
    async fn status(&self) -> Result<DpsMap> {
        match self {
            Self::Mock(session) => session.status().await,
        }
    }

    async fn set(&self, field: &str, value: &Value) -> Result<()> {
        match self {
            Self::Mock(session) => session.set(field, value).await,
        }
    }

    async fn close(&self) {
        match self {
            Self::Mock(session) => session.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pethub_core::LocalKey;

    #[tokio::test(start_paused = true)]
    async fn test_any_transport_dispatches_to_mock() {
        let (mock, handle) = MockLocalTransport::new();
        let transport = AnyLocalTransport::from(mock);
        let config =
            DeviceConfig::new(DeviceId::new("f1").unwrap(), LocalKey::new("k"), "10.0.0.9");
        let (tx, _rx) = mpsc::unbounded_channel();

        let session = transport
            .connect(&config, EventSink::new(config.id.clone(), 1, tx))
            .await
            .unwrap();
        assert!(matches!(session, AnyLocalSession::Mock(_)));

        session.set("3", &Value::from(2)).await.unwrap();
        assert_eq!(session.status().await.unwrap()["3"], 2);
        assert_eq!(handle.writes(&config.id).len(), 1);

        session.close().await;
        assert!(!handle.is_open(&config.id));
    }
}
