//! Mock BLE radio for testing and development.
//!
//! Simulated lamps are described with [`MockLampSpec`] and scripted through
//! the [`MockLampHandle`]: hide them from scans, refuse connects, ask for
//! pairing, fail writes, drop links, send notifications. Characteristic
//! values stay coherent: a control frame write is visible on the power,
//! brightness, temperature and state characteristics, and temperature
//! writes below the lamp's warm limit are clamped the way real hardware
//! clamps them.
//!
//! # Examples
//!
//! ```
//! use pethub_ble::mock::{MockLampSpec, MockLampTransport};
//!
//! let (transport, handle) = MockLampTransport::new();
//! let lamp = handle.add(MockLampSpec::new("AA:BB:CC:00:00:01", "ELK-BLEDOM").warm_limit(40))?;
//!
//! assert_eq!(handle.connect_calls(&lamp), 0);
//! # Ok::<(), pethub_core::Error>(())
//! ```

use crate::lamp::{
    self, BRIGHTNESS_RAW_MAX, CONTROL_LEN, TEMPERATURE_RAW_COOLEST, parse_control,
};
use crate::transport::{
    Advertisement, CharProps, DiscoveredCharacteristic, LampEventSink, LampLink, LampTransport,
};
use crate::uuids;
use pethub_core::{Error, LampConfig, LampId, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Description of a simulated peripheral.
#[derive(Debug, Clone)]
pub struct MockLampSpec {
    pub address: String,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
    pub manufacturer_ids: Vec<u16>,
    pub rssi: Option<i16>,
    pub characteristics: Vec<Uuid>,
    /// Property overrides; unlisted characteristics read, write and notify.
    pub props: HashMap<Uuid, CharProps>,
    /// Lowest temperature raw value the lamp accepts.
    pub warm_limit: u8,
    pub model: Option<String>,
    pub firmware: Option<String>,
}

impl MockLampSpec {
    /// A full-featured lamp advertising the vendor service.
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: Some(name.into()),
            services: vec![uuids::lamp::SERVICE],
            manufacturer_ids: Vec::new(),
            rssi: Some(-58),
            characteristics: vec![
                uuids::lamp::POWER,
                uuids::lamp::BRIGHTNESS,
                uuids::lamp::TEMPERATURE,
                uuids::lamp::CONTROL,
                uuids::lamp::STATE,
                uuids::lamp::DEVICE_NAME,
                uuids::lamp::MODEL_NUMBER,
                uuids::lamp::FIRMWARE_REVISION,
            ],
            props: HashMap::new(),
            warm_limit: 0,
            model: Some("MOCK-LAMP".to_string()),
            firmware: Some("1.0.0".to_string()),
        }
    }

    /// A peripheral that is not a lamp.
    pub fn other(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            services: Vec::new(),
            characteristics: vec![uuids::lamp::DEVICE_NAME],
            model: None,
            firmware: None,
            ..Self::new(address, name)
        }
    }

    /// Remove the combined control characteristic.
    pub fn without_control(mut self) -> Self {
        self.characteristics.retain(|c| *c != uuids::lamp::CONTROL);
        self
    }

    /// Remove colour temperature support.
    pub fn without_temperature(mut self) -> Self {
        self.characteristics
            .retain(|c| *c != uuids::lamp::TEMPERATURE);
        self
    }

    /// Restrict what a characteristic supports.
    pub fn props(mut self, uuid: Uuid, props: CharProps) -> Self {
        self.props.insert(uuid, props);
        self
    }

    pub fn warm_limit(mut self, raw: u8) -> Self {
        self.warm_limit = raw;
        self
    }

    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }
}

#[derive(Debug)]
struct MockLamp {
    spec: MockLampSpec,
    visible: bool,
    on: bool,
    brightness: u8,
    temperature: u8,
    name: String,
    fail_connects: u32,
    require_pairing: bool,
    stall_connects: bool,
    fail_writes: u32,
    stall_reads: bool,
    connect_calls: u32,
    link: u64,
    sink: Option<LampEventSink>,
    connected: bool,
    subscriptions: Vec<Uuid>,
    writes: Vec<(Uuid, Vec<u8>)>,
}

impl MockLamp {
    fn new(spec: MockLampSpec) -> Self {
        Self {
            name: spec.name.clone().unwrap_or_default(),
            visible: true,
            on: false,
            brightness: BRIGHTNESS_RAW_MAX,
            temperature: TEMPERATURE_RAW_COOLEST,
            fail_connects: 0,
            require_pairing: false,
            stall_connects: false,
            fail_writes: 0,
            stall_reads: false,
            connect_calls: 0,
            link: 0,
            sink: None,
            connected: false,
            subscriptions: Vec::new(),
            writes: Vec::new(),
            spec,
        }
    }

    fn has(&self, uuid: Uuid) -> bool {
        self.spec.characteristics.contains(&uuid)
    }

    fn props(&self, uuid: Uuid) -> CharProps {
        self.spec.props.get(&uuid).copied().unwrap_or(CharProps::ALL)
    }

    fn state_frame(&self) -> Vec<u8> {
        vec![lamp::CONTROL_HEADER, u8::from(self.on), self.brightness, self.temperature]
    }

    fn read(&self, uuid: Uuid) -> Option<Vec<u8>> {
        if !self.has(uuid) {
            return None;
        }
        let value = match uuid {
            u if u == uuids::lamp::POWER => vec![u8::from(self.on)],
            u if u == uuids::lamp::BRIGHTNESS => vec![self.brightness],
            u if u == uuids::lamp::TEMPERATURE => vec![self.temperature],
            u if u == uuids::lamp::CONTROL || u == uuids::lamp::STATE => self.state_frame(),
            u if u == uuids::lamp::DEVICE_NAME => self.name.clone().into_bytes(),
            u if u == uuids::lamp::MODEL_NUMBER => self.spec.model.clone()?.into_bytes(),
            u if u == uuids::lamp::FIRMWARE_REVISION => self.spec.firmware.clone()?.into_bytes(),
            _ => return None,
        };
        Some(value)
    }

    fn write(&mut self, uuid: Uuid, value: &[u8]) -> bool {
        if !self.has(uuid) {
            return false;
        }
        let first = value.first().copied();
        match uuid {
            u if u == uuids::lamp::POWER => self.on = first.is_some_and(|b| b != 0),
            u if u == uuids::lamp::BRIGHTNESS => {
                self.brightness = first.unwrap_or(BRIGHTNESS_RAW_MAX).max(1);
            }
            u if u == uuids::lamp::TEMPERATURE => {
                self.temperature = first.unwrap_or(TEMPERATURE_RAW_COOLEST).max(self.spec.warm_limit);
            }
            u if u == uuids::lamp::CONTROL => {
                let Some(frame) = parse_control(value).filter(|_| value.len() == CONTROL_LEN) else {
                    return false;
                };
                self.on = frame.is_on;
                self.brightness = frame.brightness_raw.max(1);
                if self.has(uuids::lamp::TEMPERATURE) {
                    self.temperature = frame.temperature_raw.max(self.spec.warm_limit);
                }
            }
            u if u == uuids::lamp::DEVICE_NAME => {
                self.name = String::from_utf8_lossy(value).into_owned();
            }
            _ => return false,
        }
        self.writes.push((uuid, value.to_vec()));
        true
    }

    fn advertisement(&self) -> Option<Advertisement> {
        let id = LampId::new(&self.spec.address).ok()?;
        Some(Advertisement {
            id,
            address: self.spec.address.clone(),
            name: self.spec.name.clone(),
            services: self.spec.services.clone(),
            manufacturer_ids: self.spec.manufacturer_ids.clone(),
            rssi: self.spec.rssi,
        })
    }
}

#[derive(Debug, Default)]
struct MockRadio {
    lamps: HashMap<LampId, MockLamp>,
    latency: Duration,
    scans: u32,
}

#[derive(Debug, Default)]
struct Shared {
    radio: Mutex<MockRadio>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MockRadio> {
        self.radio.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn latency(&self) -> Duration {
        self.lock().latency
    }

    fn with_lamp<R>(&self, id: &LampId, f: impl FnOnce(&mut MockLamp) -> R) -> Option<R> {
        self.lock().lamps.get_mut(id).map(f)
    }
}

/// Mock radio. Cheap to clone; clones share the simulated lamps.
#[derive(Debug, Clone)]
pub struct MockLampTransport {
    shared: Arc<Shared>,
}

impl MockLampTransport {
    pub fn new() -> (Self, MockLampHandle) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: shared.clone(),
            },
            MockLampHandle { shared },
        )
    }
}

impl LampTransport for MockLampTransport {
    type Link = MockLampLink;

    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>> {
        tokio::time::sleep(window).await;
        let mut radio = self.shared.lock();
        radio.scans += 1;
        let mut seen: Vec<_> = radio
            .lamps
            .values()
            .filter(|lamp| lamp.visible)
            .filter_map(MockLamp::advertisement)
            .collect();
        seen.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(seen)
    }

    async fn connect(&self, config: &LampConfig, events: LampEventSink) -> Result<MockLampLink> {
        let latency = self.shared.latency();
        let script = self.shared.with_lamp(&config.id, |lamp| {
            lamp.connect_calls += 1;
            let fail = lamp.fail_connects > 0;
            if fail && !lamp.stall_connects {
                lamp.fail_connects -= 1;
            }
            (lamp.visible, lamp.stall_connects, lamp.require_pairing, fail)
        });
        let Some((visible, stall, pairing, fail)) = script else {
            return Err(Error::not_connectable(config.id.as_str(), "peripheral not found"));
        };

        tokio::time::sleep(latency).await;
        if stall {
            std::future::pending::<()>().await;
        }
        if !visible || fail {
            return Err(Error::not_connectable(config.id.as_str(), "gatt connect failed"));
        }
        if pairing {
            return Err(Error::authorization(
                config.id.as_str(),
                "insufficient authentication",
            ));
        }

        let link = self
            .shared
            .with_lamp(&config.id, |lamp| {
                lamp.link += 1;
                lamp.connected = true;
                lamp.sink = Some(events);
                lamp.subscriptions.clear();
                lamp.link
            })
            .unwrap_or_default();

        Ok(MockLampLink {
            lamp: config.id.clone(),
            link,
            shared: self.shared.clone(),
        })
    }
}

/// Link opened by [`MockLampTransport`].
#[derive(Debug)]
pub struct MockLampLink {
    lamp: LampId,
    link: u64,
    shared: Arc<Shared>,
}

impl MockLampLink {
    fn with_open<R>(&self, f: impl FnOnce(&mut MockLamp) -> R) -> Result<R> {
        self.shared
            .with_lamp(&self.lamp, |lamp| {
                (lamp.connected && lamp.link == self.link).then(|| f(lamp))
            })
            .flatten()
            .ok_or_else(|| Error::transport("not connected"))
    }
}

impl LampLink for MockLampLink {
    async fn discover(&self) -> Result<Vec<DiscoveredCharacteristic>> {
        tokio::time::sleep(self.shared.latency()).await;
        self.with_open(|lamp| {
            lamp.spec
                .characteristics
                .iter()
                .map(|uuid| DiscoveredCharacteristic {
                    uuid: *uuid,
                    props: lamp.props(*uuid),
                })
                .collect()
        })
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<()> {
        self.with_open(|lamp| {
            if !lamp.has(uuid) {
                Err(Error::transport(format!("no characteristic {uuid}")))
            } else if !lamp.props(uuid).notify {
                Err(Error::transport(format!("{uuid} does not support notifications")))
            } else {
                lamp.subscriptions.push(uuid);
                Ok(())
            }
        })?
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        tokio::time::sleep(self.shared.latency()).await;
        let (stall, value) = self.with_open(|lamp| {
            let value = lamp.read(uuid).filter(|_| lamp.props(uuid).read);
            (lamp.stall_reads, value)
        })?;
        if stall {
            std::future::pending::<()>().await;
        }
        value.ok_or_else(|| Error::transport(format!("read of {uuid} not permitted")))
    }

    async fn write(&self, uuid: Uuid, value: &[u8]) -> Result<()> {
        tokio::time::sleep(self.shared.latency()).await;
        self.with_open(|lamp| {
            if lamp.fail_writes > 0 {
                lamp.fail_writes -= 1;
                return Err(Error::transport("write failed: unlikely error"));
            }
            if lamp.props(uuid).write && lamp.write(uuid, value) {
                Ok(())
            } else {
                Err(Error::transport(format!("write to {uuid} not permitted")))
            }
        })?
    }

    async fn disconnect(&self) {
        let _ = self.with_open(|lamp| {
            lamp.connected = false;
            lamp.sink = None;
            lamp.subscriptions.clear();
        });
    }
}

/// Handle for scripting a [`MockLampTransport`].
#[derive(Debug, Clone)]
pub struct MockLampHandle {
    shared: Arc<Shared>,
}

impl MockLampHandle {
    /// Add a simulated lamp and return its id.
    ///
    /// # Errors
    /// Returns `Error::Validation` if the lamp address is blank.
    pub fn add(&self, spec: MockLampSpec) -> Result<LampId> {
        let id = LampId::new(&spec.address)?;
        self.shared.lock().lamps.insert(id.clone(), MockLamp::new(spec));
        Ok(id)
    }

    /// Forget a lamp entirely.
    pub fn remove(&self, id: &LampId) {
        self.shared.lock().lamps.remove(id);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.shared.lock().latency = latency;
    }

    /// Show or hide a lamp from scans and connects.
    pub fn set_visible(&self, id: &LampId, visible: bool) {
        self.shared.with_lamp(id, |l| l.visible = visible);
    }

    pub fn fail_next_connects(&self, id: &LampId, count: u32) {
        self.shared.with_lamp(id, |l| l.fail_connects = count);
    }

    /// Reject connects with an authorization error.
    pub fn require_pairing(&self, id: &LampId, required: bool) {
        self.shared.with_lamp(id, |l| l.require_pairing = required);
    }

    pub fn stall_connects(&self, id: &LampId, stall: bool) {
        self.shared.with_lamp(id, |l| l.stall_connects = stall);
    }

    pub fn fail_next_writes(&self, id: &LampId, count: u32) {
        self.shared.with_lamp(id, |l| l.fail_writes = count);
    }

    pub fn stall_reads(&self, id: &LampId, stall: bool) {
        self.shared.with_lamp(id, |l| l.stall_reads = stall);
    }

    /// Simulate the lamp dropping the link.
    pub fn drop_link(&self, id: &LampId) -> bool {
        let sink = self
            .shared
            .with_lamp(id, |l| {
                l.connected = false;
                l.sink.take()
            })
            .flatten();
        sink.is_some_and(|sink| sink.disconnected())
    }

    /// Change the lamp state without notifying anyone, as if the
    /// notification got lost.
    pub fn set_state(&self, id: &LampId, on: bool, brightness_raw: u8) {
        self.shared.with_lamp(id, |l| {
            l.on = on;
            l.brightness = brightness_raw.max(1);
        });
    }

    /// Change the lamp state as if toggled by its own remote, notifying
    /// subscribers.
    pub fn press_remote(&self, id: &LampId, on: bool, brightness_raw: u8) -> bool {
        let notify = self
            .shared
            .with_lamp(id, |l| {
                l.on = on;
                l.brightness = brightness_raw.max(1);
                let uuid = [uuids::lamp::STATE, uuids::lamp::CONTROL]
                    .into_iter()
                    .find(|u| l.subscriptions.contains(u))?;
                Some((l.sink.clone()?, uuid, l.state_frame()))
            })
            .flatten();
        notify.is_some_and(|(sink, uuid, frame)| sink.notification(uuid, frame))
    }

    /// Send an arbitrary notification on the open link.
    pub fn notify(&self, id: &LampId, uuid: Uuid, value: Vec<u8>) -> bool {
        let sink = self.shared.with_lamp(id, |l| l.sink.clone()).flatten();
        sink.is_some_and(|sink| sink.notification(uuid, value))
    }

    pub fn connect_calls(&self, id: &LampId) -> u32 {
        self.shared.with_lamp(id, |l| l.connect_calls).unwrap_or(0)
    }

    pub fn is_connected(&self, id: &LampId) -> bool {
        self.shared.with_lamp(id, |l| l.connected).unwrap_or(false)
    }

    /// Current raw value of a characteristic.
    pub fn value(&self, id: &LampId, uuid: Uuid) -> Option<Vec<u8>> {
        self.shared.with_lamp(id, |l| l.read(uuid)).flatten()
    }

    /// Successful writes, oldest first.
    pub fn writes(&self, id: &LampId) -> Vec<(Uuid, Vec<u8>)> {
        self.shared
            .with_lamp(id, |l| l.writes.clone())
            .unwrap_or_default()
    }

    pub fn scans(&self) -> u32 {
        self.shared.lock().scans
    }
}
