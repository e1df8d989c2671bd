//! Per-lamp connection state and public snapshots.

use crate::lamp::{LampState, TemperatureBounds};
use crate::transport::{AnyLampLink, CharProps, DiscoveredCharacteristic};
use crate::uuids;
use chrono::{DateTime, Utc};
use pethub_core::{ConnectionStatus, LampConfig, LampId};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Resolved characteristics of a connected lamp. Any subset may be absent.
///
/// Command targets are only set for writable characteristics; the read and
/// notify handles honour the discovered properties the same way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CharacteristicHandles {
    pub power: Option<Uuid>,
    pub brightness: Option<Uuid>,
    pub temperature: Option<Uuid>,
    pub control: Option<Uuid>,
    pub name: Option<Uuid>,
    /// Readable source of the combined state frame, `FFF5` before `FFF4`.
    pub frame: Option<Uuid>,
    pub power_read: Option<Uuid>,
    pub brightness_read: Option<Uuid>,
    pub temperature_read: Option<Uuid>,
    pub model: Option<Uuid>,
    pub firmware: Option<Uuid>,
    state_notify: Option<Uuid>,
    control_notify: Option<Uuid>,
}

impl CharacteristicHandles {
    pub fn resolve(found: &[DiscoveredCharacteristic]) -> Self {
        let find = |wanted: Uuid, usable: fn(CharProps) -> bool| {
            found
                .iter()
                .find(|c| c.uuid == wanted && usable(c.props))
                .map(|c| c.uuid)
        };
        let writable = |p: CharProps| p.write;
        let readable = |p: CharProps| p.read;
        let notifying = |p: CharProps| p.notify;

        Self {
            power: find(uuids::lamp::POWER, writable),
            brightness: find(uuids::lamp::BRIGHTNESS, writable),
            temperature: find(uuids::lamp::TEMPERATURE, writable),
            control: find(uuids::lamp::CONTROL, writable),
            name: find(uuids::lamp::DEVICE_NAME, writable),
            frame: find(uuids::lamp::STATE, readable).or(find(uuids::lamp::CONTROL, readable)),
            power_read: find(uuids::lamp::POWER, readable),
            brightness_read: find(uuids::lamp::BRIGHTNESS, readable),
            temperature_read: find(uuids::lamp::TEMPERATURE, readable),
            model: find(uuids::lamp::MODEL_NUMBER, readable),
            firmware: find(uuids::lamp::FIRMWARE_REVISION, readable),
            state_notify: find(uuids::lamp::STATE, notifying),
            control_notify: find(uuids::lamp::CONTROL, notifying),
        }
    }

    /// Whether anything can switch the lamp.
    pub fn controllable(&self) -> bool {
        self.control.is_some() || self.power.is_some()
    }

    /// Notifying characteristics that carry state frames.
    pub fn notify_targets(&self) -> impl Iterator<Item = Uuid> {
        self.state_notify.into_iter().chain(self.control_notify)
    }

    /// Whether `uuid` delivers combined state frames.
    pub fn carries_frame(&self, uuid: Uuid) -> bool {
        Some(uuid) == self.frame || self.notify_targets().any(|t| t == uuid)
    }

    /// Whether state can be read back without notifications.
    pub fn has_readable_state(&self) -> bool {
        self.frame.is_some() || self.power_read.is_some() || self.brightness_read.is_some()
    }

    /// Cheapest readable characteristic for a liveness probe.
    pub fn probe(&self) -> Option<Uuid> {
        self.power_read
            .or(self.frame)
            .or(self.brightness_read)
            .or(self.temperature_read)
    }

    pub fn capabilities(&self) -> LampCapabilities {
        LampCapabilities {
            power: self.controllable(),
            brightness: self.control.is_some() || self.brightness.is_some(),
            temperature: self.temperature.is_some(),
            combined_control: self.control.is_some(),
            rename: self.name.is_some(),
        }
    }
}

/// What a lamp can do, as last discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LampCapabilities {
    pub power: bool,
    pub brightness: bool,
    pub temperature: bool,
    pub combined_control: bool,
    pub rename: bool,
}

/// One known lamp.
///
/// `op_lock` serializes connects, commands, probes and polls on this lamp.
/// `state` is only held for short synchronous updates.
#[derive(Debug)]
pub(crate) struct LampSlot {
    pub id: LampId,
    pub op_lock: tokio::sync::Mutex<()>,
    state: Mutex<LampConnection>,
}

impl LampSlot {
    pub fn new(config: LampConfig) -> Self {
        Self {
            id: config.id.clone(),
            op_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(LampConnection::new(config)),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, LampConnection> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self) -> LampInfo {
        let state = self.state();
        LampInfo {
            id: self.id.clone(),
            name: state.config.name.clone(),
            address: state.config.address.clone(),
            model: state.config.model.clone(),
            firmware: state.firmware.clone(),
            status: state.status,
            state: state.lamp_state,
            capabilities: state.capabilities,
            temperature_bounds: state.bounds,
            reachable: state.reachable,
            rssi: state.rssi,
            pairing_required: state.pairing_required,
            has_connected_once: state.config.has_connected_once,
            last_seen: state.config.last_seen,
            failures: state.failures,
            reconnect_attempts: state.reconnect_attempts,
            reconnect_pending: state.reconnect_task.is_some(),
            last_error: state.last_error.clone(),
        }
    }
}

/// Mutable state of one lamp.
#[derive(Debug)]
pub(crate) struct LampConnection {
    pub config: LampConfig,
    pub status: ConnectionStatus,
    pub link: Option<Arc<AnyLampLink>>,
    /// Bumped on every connect attempt and every disconnect.
    pub link_id: u64,
    pub chars: CharacteristicHandles,
    /// Survives disconnects so snapshots keep showing what the lamp can do.
    pub capabilities: LampCapabilities,
    pub lamp_state: LampState,
    pub bounds: Option<TemperatureBounds>,
    pub firmware: Option<String>,
    pub reachable: bool,
    pub rssi: Option<i16>,
    pub pairing_required: bool,
    /// Consecutive connect failures.
    pub failures: u32,
    pub reconnect_attempts: u32,
    pub reconnect_epoch: u64,
    pub reconnect_task: Option<JoinHandle<()>>,
    pub manual_disconnect: bool,
    /// Set once the lamp is blacklisted; the slot is dead.
    pub removed: bool,
    pub last_error: Option<String>,
}

impl LampConnection {
    fn new(config: LampConfig) -> Self {
        Self {
            config,
            status: ConnectionStatus::Disconnected,
            link: None,
            link_id: 0,
            chars: CharacteristicHandles::default(),
            capabilities: LampCapabilities::default(),
            lamp_state: LampState::default(),
            bounds: None,
            firmware: None,
            reachable: false,
            rssi: None,
            pairing_required: false,
            failures: 0,
            reconnect_attempts: 0,
            reconnect_epoch: 0,
            reconnect_task: None,
            manual_disconnect: false,
            removed: false,
            last_error: None,
        }
    }

    pub fn is_live(&self, link_id: u64) -> bool {
        self.link_id == link_id && self.status == ConnectionStatus::Connected
    }

    pub fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        self.reconnect_epoch += 1;
    }

    /// Move to `Disconnected`, forget the characteristic handles and hand
    /// back the link for closing.
    pub fn mark_disconnected(&mut self) -> Option<Arc<AnyLampLink>> {
        self.status = ConnectionStatus::Disconnected;
        self.chars = CharacteristicHandles::default();
        self.link_id += 1;
        self.link.take()
    }

    /// Bounds used for temperature conversions, if the lamp has colour
    /// temperature.
    pub fn temperature_bounds(&self) -> Option<TemperatureBounds> {
        self.chars
            .temperature
            .map(|_| self.bounds.unwrap_or_default())
    }
}

/// Snapshot of one lamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LampInfo {
    pub id: LampId,
    pub name: String,
    pub address: String,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub status: ConnectionStatus,
    pub state: LampState,
    pub capabilities: LampCapabilities,
    pub temperature_bounds: Option<TemperatureBounds>,
    /// Seen by the radio in the last scan, or connected.
    pub reachable: bool,
    pub rssi: Option<i16>,
    pub pairing_required: bool,
    pub has_connected_once: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub failures: u32,
    pub reconnect_attempts: u32,
    pub reconnect_pending: bool,
    pub last_error: Option<String>,
}

/// Counts across all lamps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LampStats {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub disconnected: usize,
    pub reachable: usize,
    pub pairing_required: usize,
    pub blacklisted: usize,
}

impl LampStats {
    pub(crate) fn from_lamps(lamps: &[LampInfo], blacklisted: usize) -> Self {
        let count = |f: fn(&LampInfo) -> bool| lamps.iter().filter(|l| f(l)).count();
        Self {
            total: lamps.len(),
            connected: count(|l| l.status == ConnectionStatus::Connected),
            connecting: count(|l| l.status == ConnectionStatus::Connecting),
            disconnected: count(|l| l.status == ConnectionStatus::Disconnected),
            reachable: count(|l| l.reachable),
            pairing_required: count(|l| l.pairing_required),
            blacklisted,
        }
    }
}

/// Outcome of one scan pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub advertisements: usize,
    pub new_lamps: usize,
    /// Advertisements from blacklisted addresses.
    pub ignored: usize,
    /// Connected lamps that answered the probe and were refreshed.
    pub verified: usize,
    /// Connected lamps that did not answer and were marked disconnected.
    pub dropped: usize,
    pub connect_attempts: usize,
    pub connected: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found(raw: &[&str]) -> Vec<DiscoveredCharacteristic> {
        raw.iter()
            .map(|r| DiscoveredCharacteristic {
                uuid: uuids::parse(r).unwrap(),
                props: CharProps::ALL,
            })
            .collect()
    }

    #[test]
    fn test_resolve_short_and_long_forms() {
        let chars = CharacteristicHandles::resolve(&found(&[
            "fff1",
            "0000fff2-0000-1000-8000-00805f9b34fb",
            "0000FFF4",
            "2a00",
        ]));
        assert_eq!(chars.power, Some(uuids::lamp::POWER));
        assert_eq!(chars.brightness, Some(uuids::lamp::BRIGHTNESS));
        assert_eq!(chars.control, Some(uuids::lamp::CONTROL));
        assert_eq!(chars.temperature, None);
        assert!(chars.controllable());
        assert!(chars.capabilities().rename);
        assert!(!chars.capabilities().temperature);
    }

    #[test]
    fn test_resolve_respects_properties() {
        let read_only = vec![DiscoveredCharacteristic {
            uuid: uuids::lamp::POWER,
            props: CharProps::READ_ONLY,
        }];
        let chars = CharacteristicHandles::resolve(&read_only);
        assert_eq!(chars.power, None);
        assert_eq!(chars.power_read, Some(uuids::lamp::POWER));
        assert!(!chars.controllable());
    }

    #[test]
    fn test_write_only_controls_are_never_read_or_subscribed() {
        let found = vec![
            DiscoveredCharacteristic {
                uuid: uuids::lamp::POWER,
                props: CharProps::WRITE_ONLY,
            },
            DiscoveredCharacteristic {
                uuid: uuids::lamp::CONTROL,
                props: CharProps::WRITE_ONLY,
            },
            DiscoveredCharacteristic {
                uuid: uuids::lamp::STATE,
                props: CharProps::READ_ONLY,
            },
        ];
        let chars = CharacteristicHandles::resolve(&found);

        assert_eq!(chars.power, Some(uuids::lamp::POWER));
        assert_eq!(chars.control, Some(uuids::lamp::CONTROL));
        assert_eq!(chars.notify_targets().count(), 0);
        assert_eq!(chars.frame, Some(uuids::lamp::STATE));
        assert_eq!(chars.probe(), Some(uuids::lamp::STATE));
        assert!(chars.carries_frame(uuids::lamp::STATE));
        assert!(!chars.carries_frame(uuids::lamp::CONTROL));
    }

    #[test]
    fn test_notify_targets_follow_notify_flag() {
        let found = vec![
            DiscoveredCharacteristic {
                uuid: uuids::lamp::CONTROL,
                props: CharProps::ALL,
            },
            DiscoveredCharacteristic {
                uuid: uuids::lamp::STATE,
                props: CharProps {
                    read: false,
                    write: false,
                    notify: true,
                },
            },
        ];
        let chars = CharacteristicHandles::resolve(&found);
        assert_eq!(
            chars.notify_targets().collect::<Vec<_>>(),
            vec![uuids::lamp::STATE, uuids::lamp::CONTROL]
        );
        assert_eq!(chars.frame, Some(uuids::lamp::CONTROL));
        assert!(chars.has_readable_state());
    }

    #[test]
    fn test_mark_disconnected_clears_handles() {
        let config = LampConfig::new(LampId::new("AA").unwrap(), "Desk", "AA");
        let slot = LampSlot::new(config);
        let mut state = slot.state();
        state.status = ConnectionStatus::Connected;
        state.chars = CharacteristicHandles::resolve(&found(&["fff1", "fff3"]));
        let link_id = state.link_id;
        assert!(state.is_live(link_id));
        assert!(state.temperature_bounds().is_some());

        assert!(state.mark_disconnected().is_none());
        assert!(!state.is_live(link_id));
        assert_eq!(state.chars, CharacteristicHandles::default());
        assert_eq!(state.temperature_bounds(), None);
    }
}
