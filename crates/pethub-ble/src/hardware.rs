//! Real radio backend on top of `btleplug`.

use crate::transport::{
    Advertisement, CharProps, DiscoveredCharacteristic, LampEventSink, LampLink, LampTransport,
};
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use pethub_core::{Error, LampConfig, LampId, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

fn map_error(lamp: &str, error: btleplug::Error) -> Error {
    match error {
        btleplug::Error::PermissionDenied => Error::authorization(lamp, "permission denied"),
        btleplug::Error::TimedOut(duration) => {
            Error::timeout(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        }
        btleplug::Error::DeviceNotFound => Error::not_connectable(lamp, "peripheral not found"),
        btleplug::Error::NotConnected => Error::not_connectable(lamp, "not connected"),
        other => Error::transport(other.to_string()),
    }
}

/// Lamp id of a peripheral: its address where the platform exposes one,
/// the platform id otherwise.
fn lamp_id(id: &PeripheralId, address: BDAddr) -> Result<LampId> {
    if address == BDAddr::default() {
        LampId::new(id.to_string())
    } else {
        LampId::new(address.to_string())
    }
}

/// Radio access through the first Bluetooth adapter.
#[derive(Debug, Clone)]
pub struct BtleplugTransport {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<LampId, Peripheral>>>,
}

impl BtleplugTransport {
    /// Open the first adapter of the platform.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(|e| map_error("adapter", e))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| map_error("adapter", e))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::transport("no Bluetooth adapter found"))?;
        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<LampId, Peripheral>> {
        self.peripherals.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn find(&self, lamp: &LampConfig) -> Result<Peripheral> {
        if let Some(peripheral) = self.cache().get(&lamp.id).cloned() {
            return Ok(peripheral);
        }
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| map_error(lamp.id.as_str(), e))?;
        for peripheral in peripherals {
            let id = lamp_id(&peripheral.id(), peripheral.address())?;
            if id == lamp.id || peripheral.address().to_string().eq_ignore_ascii_case(&lamp.address) {
                self.cache().insert(lamp.id.clone(), peripheral.clone());
                return Ok(peripheral);
            }
        }
        Err(Error::not_connectable(lamp.id.as_str(), "peripheral not seen by the adapter"))
    }
}

impl LampTransport for BtleplugTransport {
    type Link = BtleplugLink;

    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| map_error("scan", e))?;
        tokio::time::sleep(window).await;
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Stopping scan failed: {}", e);
        }

        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| map_error("scan", e))?;
        let mut seen = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals {
            let properties = match peripheral.properties().await {
                Ok(Some(properties)) => properties,
                Ok(None) => continue,
                Err(e) => {
                    trace!("Skipping peripheral without properties: {}", e);
                    continue;
                }
            };
            let Ok(id) = lamp_id(&peripheral.id(), properties.address) else {
                continue;
            };
            self.cache().insert(id.clone(), peripheral);

            let mut manufacturer_ids: Vec<u16> =
                properties.manufacturer_data.keys().copied().collect();
            manufacturer_ids.sort_unstable();
            seen.push(Advertisement {
                id,
                address: properties.address.to_string(),
                name: properties.local_name,
                services: properties.services,
                manufacturer_ids,
                rssi: properties.rssi,
            });
        }
        trace!(count = seen.len(), "Scan burst finished");
        Ok(seen)
    }

    async fn connect(&self, lamp: &LampConfig, events: LampEventSink) -> Result<BtleplugLink> {
        let peripheral = self.find(lamp).await?;
        let id = lamp.id.as_str();
        if !peripheral.is_connected().await.map_err(|e| map_error(id, e))? {
            peripheral.connect().await.map_err(|e| map_error(id, e))?;
        }

        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| map_error(id, e))?;
        let central = self.adapter.events().await.map_err(|e| map_error(id, e))?;
        let peripheral_id = peripheral.id();

        let forwarder = tokio::spawn(async move {
            let mut notifications = notifications;
            let mut central = central;
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) => {
                            if !events.notification(n.uuid, n.value) {
                                return;
                            }
                        }
                        None => break,
                    },
                    event = central.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == peripheral_id => break,
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            events.disconnected();
        });

        Ok(BtleplugLink {
            lamp: lamp.id.clone(),
            peripheral,
            characteristics: Mutex::new(Vec::new()),
            forwarder: Mutex::new(Some(forwarder)),
        })
    }
}

/// Open GATT link to one peripheral.
#[derive(Debug)]
pub struct BtleplugLink {
    lamp: LampId,
    peripheral: Peripheral,
    characteristics: Mutex<Vec<Characteristic>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.characteristics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::transport(format!("characteristic {uuid} not discovered")))
    }

    fn stop_forwarder(&self) {
        let task = self
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.stop_forwarder();
    }
}

impl LampLink for BtleplugLink {
    async fn discover(&self) -> Result<Vec<DiscoveredCharacteristic>> {
        let id = self.lamp.as_str();
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| map_error(id, e))?;
        let found: Vec<Characteristic> = self.peripheral.characteristics().into_iter().collect();

        let discovered = found
            .iter()
            .map(|c| DiscoveredCharacteristic {
                uuid: c.uuid,
                props: CharProps {
                    read: c.properties.contains(CharPropFlags::READ),
                    write: c
                        .properties
                        .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
                    notify: c
                        .properties
                        .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
                },
            })
            .collect();
        *self
            .characteristics
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = found;
        Ok(discovered)
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| map_error(self.lamp.as_str(), e))
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral
            .read(&characteristic)
            .await
            .map_err(|e| map_error(self.lamp.as_str(), e))
    }

    async fn write(&self, uuid: Uuid, value: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&characteristic, value, write_type)
            .await
            .map_err(|e| map_error(self.lamp.as_str(), e))
    }

    async fn disconnect(&self) {
        self.stop_forwarder();
        if let Err(e) = self.peripheral.disconnect().await {
            warn!(lamp = %self.lamp, "Disconnect failed: {}", e);
        }
    }
}
