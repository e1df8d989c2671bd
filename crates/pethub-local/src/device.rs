//! Per-device connection state.

use crate::transport::AnyLocalSession;
use pethub_core::{ConnectionStatus, DeviceConfig, DeviceId, DeviceKind, DpsMap};
use pethub_protocol::DeviceStatus;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One configured appliance.
///
/// `op_lock` serializes caller operations (connect, disconnect, commands,
/// status reads, background reconnects, heartbeats) end to end. `state` is
/// the single mutation point of the connection and is only ever held for
/// short, synchronous updates, so the event pump can apply pushes while an
/// operation is waiting on the network.
#[derive(Debug)]
pub(crate) struct DeviceSlot {
    pub config: DeviceConfig,
    pub kind: DeviceKind,
    pub op_lock: tokio::sync::Mutex<()>,
    state: Mutex<DeviceConnection>,
}

impl DeviceSlot {
    pub fn new(config: DeviceConfig) -> Self {
        let kind = pethub_protocol::classify_config(&config);
        Self {
            config,
            kind,
            op_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(DeviceConnection::default()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.config.id
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceConnection> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self) -> DeviceConnectionInfo {
        let state = self.state();
        DeviceConnectionInfo {
            id: self.config.id.clone(),
            name: self.config.display_name().to_string(),
            kind: self.kind,
            status: state.status,
            reconnect_attempts: state.reconnect_attempts,
            reconnect_pending: state.reconnect_task.is_some(),
            last_reconnect_delay_ms: state
                .last_reconnect_delay
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            last_error: state.last_error.clone(),
        }
    }
}

/// Mutable connection state of one appliance.
#[derive(Debug, Default)]
pub(crate) struct DeviceConnection {
    pub status: ConnectionStatus,
    pub session: Option<Arc<AnyLocalSession>>,
    /// Bumped on every connect attempt and every disconnect; events and
    /// timers carrying an older value are stale.
    pub session_id: u64,
    pub connecting_since: Option<Instant>,
    pub reconnect_attempts: u32,
    pub reconnect_epoch: u64,
    pub reconnect_task: Option<JoinHandle<()>>,
    pub heartbeat_task: Option<JoinHandle<()>>,
    pub last_reconnect_delay: Option<Duration>,
    /// Set by an explicit disconnect; suppresses background reconnects.
    pub manual_disconnect: bool,
    pub last_data: DpsMap,
    pub last_status: Option<DeviceStatus>,
    pub last_error: Option<String>,
}

impl DeviceConnection {
    pub fn is_live(&self, session_id: u64) -> bool {
        self.session_id == session_id && self.status == ConnectionStatus::Connected
    }

    pub fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        self.reconnect_epoch += 1;
    }

    /// Move to `Disconnected`, stop the heartbeat and hand back the session
    /// for closing.
    pub fn mark_disconnected(&mut self) -> Option<Arc<AnyLocalSession>> {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        self.status = ConnectionStatus::Disconnected;
        self.connecting_since = None;
        self.session_id += 1;
        self.session.take()
    }
}

/// Connection snapshot of one appliance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConnectionInfo {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub reconnect_pending: bool,
    pub last_reconnect_delay_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// Connection counts across all appliances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub disconnected: usize,
    pub devices: Vec<DeviceConnectionInfo>,
}

impl ConnectionStats {
    pub(crate) fn from_devices(devices: Vec<DeviceConnectionInfo>) -> Self {
        let count = |status: ConnectionStatus| devices.iter().filter(|d| d.status == status).count();
        Self {
            total: devices.len(),
            connected: count(ConnectionStatus::Connected),
            connecting: count(ConnectionStatus::Connecting),
            disconnected: count(ConnectionStatus::Disconnected),
            devices,
        }
    }
}
