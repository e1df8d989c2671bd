//! Mock local-protocol transport for testing and development.
//!
//! The transport simulates any number of appliances. Each one is scripted
//! through the [`MockLocalHandle`]: fail or stall connects, fail writes,
//! push data, drop the connection. All time is measured with
//! `tokio::time::Instant`, so tests can run with a paused clock.
//!
//! # Examples
//!
//! ```
//! use pethub_core::{DeviceConfig, DeviceId, LocalKey};
//! use pethub_local::mock::MockLocalTransport;
//!
//! let (transport, handle) = MockLocalTransport::new();
//! let feeder = DeviceId::new("feeder-1").unwrap();
//!
//! handle.fail_next_connects(&feeder, 2);
//! assert_eq!(handle.connect_calls(&feeder), 0);
//! ```

use crate::transport::{EventSink, LocalSession, LocalTransport};
use pethub_core::{DeviceConfig, DeviceId, DpsMap, Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// One recorded data point write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub device: DeviceId,
    pub field: String,
    pub value: Value,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Default)]
struct MockDevice {
    dps: DpsMap,
    fail_connects: u32,
    stall_connects: bool,
    fail_writes: u32,
    fail_status: u32,
    stall_status: bool,
    connect_calls: u32,
    session: u64,
    sink: Option<EventSink>,
    open: bool,
}

#[derive(Debug, Default)]
struct MockState {
    devices: HashMap<DeviceId, MockDevice>,
    latency: Duration,
    writes: Vec<WriteRecord>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MockState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn latency(&self) -> Duration {
        self.lock().latency
    }

    fn with_device<R>(&self, id: &DeviceId, f: impl FnOnce(&mut MockDevice) -> R) -> R {
        let mut state = self.lock();
        f(state.devices.entry(id.clone()).or_default())
    }
}

/// Mock transport. Cheap to clone; clones share the simulated appliances.
#[derive(Debug, Clone)]
pub struct MockLocalTransport {
    shared: Arc<Shared>,
}

impl MockLocalTransport {
    /// Create a transport and the handle that scripts it.
    pub fn new() -> (Self, MockLocalHandle) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: shared.clone(),
            },
            MockLocalHandle { shared },
        )
    }
}

impl LocalTransport for MockLocalTransport {
    type Session = MockLocalSession;

    async fn connect(&self, config: &DeviceConfig, events: EventSink) -> Result<MockLocalSession> {
        let latency = self.shared.latency();
        let (stall, fail) = self.shared.with_device(&config.id, |device| {
            device.connect_calls += 1;
            let stall = device.stall_connects;
            let fail = device.fail_connects > 0;
            if fail && !stall {
                device.fail_connects -= 1;
            }
            (stall, fail)
        });

        tokio::time::sleep(latency).await;
        if stall {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(Error::not_connectable(
                config.id.as_str(),
                format!("connection refused by {}:{}", config.ip, config.port),
            ));
        }

        let session = self.shared.with_device(&config.id, |device| {
            device.session += 1;
            device.sink = Some(events);
            device.open = true;
            device.session
        });

        Ok(MockLocalSession {
            device: config.id.clone(),
            session,
            shared: self.shared.clone(),
        })
    }
}

/// Session opened by [`MockLocalTransport`].
#[derive(Debug)]
pub struct MockLocalSession {
    device: DeviceId,
    session: u64,
    shared: Arc<Shared>,
}

impl MockLocalSession {
    fn ensure_open(&self) -> Result<()> {
        let open = self.shared.with_device(&self.device, |device| {
            device.open && device.session == self.session
        });
        if open {
            Ok(())
        } else {
            Err(Error::transport("socket closed"))
        }
    }
}

impl LocalSession for MockLocalSession {
    async fn status(&self) -> Result<DpsMap> {
        tokio::time::sleep(self.shared.latency()).await;
        self.ensure_open()?;

        let (stall, fail, dps) = self.shared.with_device(&self.device, |device| {
            let fail = device.fail_status > 0;
            if fail {
                device.fail_status -= 1;
            }
            (device.stall_status, fail, device.dps.clone())
        });

        if stall {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(Error::transport("status read failed"));
        }
        Ok(dps)
    }

    async fn set(&self, field: &str, value: &Value) -> Result<()> {
        let started = Instant::now();
        tokio::time::sleep(self.shared.latency()).await;
        self.ensure_open()?;

        let failed = self.shared.with_device(&self.device, |device| {
            if device.fail_writes > 0 {
                device.fail_writes -= 1;
                true
            } else {
                device.dps.insert(field.to_string(), value.clone());
                false
            }
        });
        if failed {
            return Err(Error::transport("write failed"));
        }

        self.shared.lock().writes.push(WriteRecord {
            device: self.device.clone(),
            field: field.to_string(),
            value: value.clone(),
            started,
            finished: Instant::now(),
        });
        Ok(())
    }

    async fn close(&self) {
        self.shared.with_device(&self.device, |device| {
            if device.session == self.session {
                device.open = false;
                device.sink = None;
            }
        });
    }
}

/// Handle for scripting a [`MockLocalTransport`].
#[derive(Debug, Clone)]
pub struct MockLocalHandle {
    shared: Arc<Shared>,
}

impl MockLocalHandle {
    /// Delay applied to every connect, status read and write.
    pub fn set_latency(&self, latency: Duration) {
        self.shared.lock().latency = latency;
    }

    /// Refuse the next `count` connects.
    pub fn fail_next_connects(&self, id: &DeviceId, count: u32) {
        self.shared.with_device(id, |d| d.fail_connects = count);
    }

    /// Make connects hang until the caller's timeout fires.
    pub fn stall_connects(&self, id: &DeviceId, stall: bool) {
        self.shared.with_device(id, |d| d.stall_connects = stall);
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, id: &DeviceId, count: u32) {
        self.shared.with_device(id, |d| d.fail_writes = count);
    }

    /// Fail the next `count` status reads.
    pub fn fail_next_status(&self, id: &DeviceId, count: u32) {
        self.shared.with_device(id, |d| d.fail_status = count);
    }

    /// Make status reads hang.
    pub fn stall_status(&self, id: &DeviceId, stall: bool) {
        self.shared.with_device(id, |d| d.stall_status = stall);
    }

    /// Replace the data points returned by status reads.
    pub fn set_dps(&self, id: &DeviceId, dps: DpsMap) {
        self.shared.with_device(id, |d| d.dps = dps);
    }

    /// Push data points over the open session. Returns `false` if there is
    /// no open session.
    pub fn push_data(&self, id: &DeviceId, dps: DpsMap) -> bool {
        self.sink(id).is_some_and(|sink| sink.data(dps))
    }

    /// Push an undecodable payload.
    pub fn push_frame(&self, id: &DeviceId, raw: Vec<u8>) -> bool {
        self.sink(id).is_some_and(|sink| sink.frame(raw))
    }

    /// Simulate the appliance closing the socket.
    pub fn drop_connection(&self, id: &DeviceId) -> bool {
        let sink = self.shared.with_device(id, |d| {
            d.open = false;
            d.sink.take()
        });
        sink.is_some_and(|sink| sink.closed())
    }

    /// Simulate a socket error.
    pub fn report_error(&self, id: &DeviceId, message: &str) -> bool {
        let sink = self.shared.with_device(id, |d| {
            d.open = false;
            d.sink.take()
        });
        sink.is_some_and(|sink| sink.error(message))
    }

    pub fn connect_calls(&self, id: &DeviceId) -> u32 {
        self.shared.with_device(id, |d| d.connect_calls)
    }

    pub fn is_open(&self, id: &DeviceId) -> bool {
        self.shared.with_device(id, |d| d.open)
    }

    /// Successful writes to `id`, oldest first.
    pub fn writes(&self, id: &DeviceId) -> Vec<WriteRecord> {
        self.shared
            .lock()
            .writes
            .iter()
            .filter(|w| &w.device == id)
            .cloned()
            .collect()
    }

    /// All successful writes, oldest first.
    pub fn all_writes(&self) -> Vec<WriteRecord> {
        self.shared.lock().writes.clone()
    }

    fn sink(&self, id: &DeviceId) -> Option<EventSink> {
        self.shared.with_device(id, |d| d.sink.clone())
    }
}
