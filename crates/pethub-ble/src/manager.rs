//! BLE lamp manager.
//!
//! Keeps one GATT connection state machine per known lamp:
//!
//! ```text
//!  ┌──────────────┐  connect   ┌────────────┐  GATT connect, discover,
//!  │ Disconnected │ ─────────► │ Connecting │  subscribe, calibrate,
//!  └──────────────┘ ◄───────── └────────────┘  read state and info
//!     ▲      │       failure         │
//!     │      │ backoff timer         ▼
//!     │      ▼ or scan          ┌───────────┐
//!     └──────────────────────── │ Connected │ ◄── notifications, polls
//!       link lost / write fail  └───────────┘
//! ```
//!
//! A lamp that never connected and keeps failing is blacklisted once its
//! failure counter reaches `blacklist_threshold`; a lamp that connected at
//! least once is retried forever. Discovery runs in scan bursts, each
//! followed by a reachability check of the connected lamps.
//!
//! Like the local device manager, operations on one lamp are serialized
//! through its operation lock, background tasks hold only a weak reference
//! and every radio call is bounded by a timeout.

use crate::config::LampManagerConfig;
use crate::failure::{FailureClass, classify_failure};
use crate::heuristics::match_lamp;
use crate::lamp::{
    LampState, TEMPERATURE_RAW_WARMEST, TemperatureBounds, brightness_to_percent,
    brightness_to_raw, control_payload, parse_control, parse_power, parse_text, power_payload,
    validate_percent,
};
use crate::state::{CharacteristicHandles, LampConnection, LampInfo, LampSlot, LampStats, ScanReport};
use crate::transport::{
    Advertisement, AnyLampLink, AnyLampTransport, LampEvent, LampEventKind, LampEventSink,
    LampLink, LampTransport,
};
use chrono::Utc;
use futures::future::join_all;
use pethub_core::{ConnectionStatus, Error, LampConfig, LampId, Result};
use pethub_storage::{Blacklist, HubPaths, LampConfigStore, normalize_address};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Manager of all BLE lamps.
///
/// Cheap to clone; clones share the same lamps.
///
/// # Examples
///
/// ```
/// use pethub_ble::mock::{MockLampSpec, MockLampTransport};
/// use pethub_ble::{LampManager, LampManagerConfig};
/// use pethub_storage::HubPaths;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> pethub_core::Result<()> {
/// let (transport, handle) = MockLampTransport::new();
/// let lamp = handle.add(MockLampSpec::new("AA:BB:CC:00:00:01", "ELK-BLEDOM"))?;
///
/// let dir = std::env::temp_dir().join("pethub-doc-lamps");
/// let config = LampManagerConfig::default()
///     .scan_window(Duration::from_millis(10))
///     .scan_interval(None)
///     .poll_interval(None);
/// let manager = LampManager::open(transport, &HubPaths::new(&dir), config).await?;
///
/// let report = manager.trigger_scan().await?;
/// assert_eq!(report.connected, 1);
///
/// let state = manager.set_brightness(&lamp, 40).await?;
/// assert_eq!(state.brightness, 40);
///
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LampManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: LampManagerConfig,
    transport: AnyLampTransport,
    store: LampConfigStore,
    blacklist: Blacklist,
    lamps: RwLock<HashMap<LampId, Arc<LampSlot>>>,
    events_tx: mpsc::UnboundedSender<LampEvent>,
    shutdown: CancellationToken,
    scan_lock: tokio::sync::Mutex<()>,
    persist_lock: tokio::sync::Mutex<()>,
    loops_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Requested change of a lamp state. `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default)]
struct Change {
    power: Option<bool>,
    brightness: Option<u8>,
    temperature: Option<u8>,
}

/// Result of a successful link preparation, committed under the state lock.
#[derive(Debug)]
struct Prepared {
    chars: CharacteristicHandles,
    state: LampState,
    calibrated: Option<TemperatureBounds>,
    model: Option<String>,
    firmware: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verification {
    Verified,
    Dropped,
    Skipped,
}

impl LampManager {
    /// Create a manager and start its event pump.
    ///
    /// Nothing is loaded or scanned until [`initialize`](Self::initialize).
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime.
    pub fn new(
        transport: impl Into<AnyLampTransport>,
        store: LampConfigStore,
        blacklist: Blacklist,
        config: LampManagerConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            transport: transport.into(),
            store,
            blacklist,
            lamps: RwLock::new(HashMap::new()),
            events_tx,
            shutdown: CancellationToken::new(),
            scan_lock: tokio::sync::Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
            loops_started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let pump = tokio::spawn(run_event_pump(
            Arc::downgrade(&inner),
            events_rx,
            inner.shutdown.clone(),
        ));
        inner.track(pump);
        Self { inner }
    }

    /// Open the lamp and blacklist files under `paths`, create the manager
    /// and [`initialize`](Self::initialize) it.
    pub async fn open(
        transport: impl Into<AnyLampTransport>,
        paths: &HubPaths,
        config: LampManagerConfig,
    ) -> Result<Self> {
        let blacklist = Blacklist::open(&paths.blacklist).await?;
        let manager = Self::new(transport, LampConfigStore::new(&paths.lamps), blacklist, config);
        manager.initialize().await?;
        Ok(manager)
    }

    /// Load persisted lamps and start the scan and poll loops.
    ///
    /// Lamps whose address is blacklisted are skipped. Returns the number of
    /// lamps loaded. Calling it again reloads nothing new and starts no
    /// second set of loops.
    pub async fn initialize(&self) -> Result<usize> {
        self.inner.ensure_running()?;
        let configs = self.inner.store.load().await?;

        let mut loaded = 0;
        {
            let mut lamps = self.inner.lamps_write();
            for config in configs {
                if self.inner.blacklist.contains(&config.address) {
                    debug!(lamp = %config.id, "Skipping blacklisted lamp");
                    continue;
                }
                lamps
                    .entry(config.id.clone())
                    .or_insert_with(|| Arc::new(LampSlot::new(config)));
                loaded += 1;
            }
        }

        if !self.inner.loops_started.swap(true, Ordering::SeqCst) {
            if let Some(interval) = self.inner.config.scan_interval {
                let task = self.inner.spawn_scan_loop(interval);
                self.inner.track(task);
            }
            if let Some(interval) = self.inner.config.poll_interval {
                let task = self.inner.spawn_poll_loop(interval);
                self.inner.track(task);
            }
        }

        info!(
            "Lamp manager initialized with {} lamps ({} blacklisted)",
            loaded,
            self.inner.blacklist.len()
        );
        Ok(loaded)
    }

    /// Snapshots of all known lamps, sorted by id.
    pub fn get_all_lamps(&self) -> Vec<LampInfo> {
        self.inner.slots().iter().map(|slot| slot.info()).collect()
    }

    pub fn get_lamp(&self, id: &LampId) -> Result<LampInfo> {
        Ok(self.inner.slot(id)?.info())
    }

    pub fn get_connection_stats(&self) -> LampStats {
        LampStats::from_lamps(&self.get_all_lamps(), self.inner.blacklist.len())
    }

    /// Run one scan pass.
    ///
    /// Processes the advertisements, verifies the connected lamps, then
    /// connects reachable disconnected ones when `auto_connect` is on. Only
    /// one pass runs at a time; a second caller waits for the first.
    pub async fn trigger_scan(&self) -> Result<ScanReport> {
        self.inner.scan().await
    }

    /// Connect a lamp. Succeeds immediately if already connected.
    ///
    /// Clears a previous explicit disconnect. A failure counts toward the
    /// blacklist threshold like any other connect failure.
    pub async fn connect_lamp(&self, id: &LampId) -> Result<()> {
        self.inner.ensure_running()?;
        let slot = self.inner.slot(id)?;
        let _op = slot.op_lock.lock().await;
        slot.state().manual_disconnect = false;
        self.inner.ensure_connected(&slot).await
    }

    /// Disconnect a lamp. Background reconnection stays off until the next
    /// explicit connect or command.
    pub async fn disconnect_lamp(&self, id: &LampId) -> Result<()> {
        let slot = self.inner.slot(id)?;
        let _op = slot.op_lock.lock().await;
        self.inner.disconnect_locked(&slot).await;
        Ok(())
    }

    /// Connect every known lamp concurrently. Returns the lamps that failed.
    pub async fn connect_all_lamps(&self) -> Vec<(LampId, Error)> {
        let slots = self.inner.slots();
        let results = join_all(slots.iter().map(|slot| async move {
            (slot.id.clone(), self.connect_lamp(&slot.id).await)
        }))
        .await;

        let failures: Vec<_> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();
        info!(
            "Connected {} of {} lamps",
            slots.len() - failures.len(),
            slots.len()
        );
        failures
    }

    pub async fn disconnect_all_lamps(&self) {
        let slots = self.inner.slots();
        join_all(slots.iter().map(|slot| self.disconnect_lamp(&slot.id))).await;
    }

    /// Re-read a lamp's state from the device.
    pub async fn refresh_lamp_state(&self, id: &LampId) -> Result<LampState> {
        self.inner.ensure_running()?;
        let slot = self.inner.slot(id)?;
        let _op = slot.op_lock.lock().await;
        slot.state().manual_disconnect = false;
        self.inner.ensure_connected(&slot).await?;
        self.inner.refresh_locked(&slot, false).await
    }

    pub async fn set_power(&self, id: &LampId, on: bool) -> Result<LampState> {
        self.inner
            .apply_change(
                id,
                Change {
                    power: Some(on),
                    ..Change::default()
                },
            )
            .await
    }

    /// Set brightness in percent `1..=100`.
    pub async fn set_brightness(&self, id: &LampId, percent: u8) -> Result<LampState> {
        let percent = validate_percent("brightness", percent)?;
        self.inner
            .apply_change(
                id,
                Change {
                    brightness: Some(percent),
                    ..Change::default()
                },
            )
            .await
    }

    /// Set colour temperature in percent `1..=100`, 100 being the cool end.
    ///
    /// # Errors
    /// `Unsupported` for lamps without colour temperature.
    pub async fn set_temperature(&self, id: &LampId, percent: u8) -> Result<LampState> {
        let percent = validate_percent("temperature", percent)?;
        self.inner
            .apply_change(
                id,
                Change {
                    temperature: Some(percent),
                    ..Change::default()
                },
            )
            .await
    }

    /// Switch a lamp and optionally set its brightness in one command.
    pub async fn set_lamp_state(
        &self,
        id: &LampId,
        on: bool,
        brightness: Option<u8>,
    ) -> Result<LampState> {
        let brightness = brightness
            .map(|p| validate_percent("brightness", p))
            .transpose()?;
        self.inner
            .apply_change(
                id,
                Change {
                    power: Some(on),
                    brightness,
                    temperature: None,
                },
            )
            .await
    }

    /// Rename a lamp.
    ///
    /// The new name is persisted; if the lamp is connected and exposes the
    /// device name characteristic it is written too, ignoring failures.
    pub async fn rename_lamp(&self, id: &LampId, name: &str) -> Result<LampInfo> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("lamp name must not be empty"));
        }
        let slot = self.inner.slot(id)?;
        let _op = slot.op_lock.lock().await;

        let target = {
            let mut state = slot.state();
            state.config.name = name.to_string();
            let connected = state.status == ConnectionStatus::Connected;
            state
                .link
                .clone()
                .zip(state.chars.name)
                .filter(|_| connected)
        };
        self.inner.persist().await?;
        info!(lamp = %id, name, "Lamp renamed");

        if let Some((link, uuid)) = target
            && let Err(e) = self.inner.io(link.write(uuid, name.as_bytes())).await
        {
            debug!(lamp = %id, "Writing device name failed: {}", e);
        }
        Ok(slot.info())
    }

    /// Blacklisted addresses, sorted.
    pub fn get_blacklist(&self) -> Vec<String> {
        self.inner.blacklist.list()
    }

    /// Blacklist a lamp and forget it. Returns its address.
    pub async fn blacklist_lamp(&self, id: &LampId) -> Result<String> {
        let slot = self.inner.slot(id)?;
        let _op = slot.op_lock.lock().await;
        self.inner.remove_locked(&slot, "blacklisted by request").await
    }

    /// Allow an address to be discovered again. Returns whether it was
    /// blacklisted.
    pub async fn unblacklist_address(&self, address: &str) -> Result<bool> {
        Ok(self.inner.blacklist.remove(address).await?)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop every loop and timer and close all links.
    ///
    /// Later calls return `ShuttingDown`. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down lamp manager");
        self.inner.shutdown.cancel();

        let links: Vec<_> = self
            .inner
            .slots()
            .iter()
            .filter_map(|slot| {
                let mut state = slot.state();
                state.cancel_reconnect();
                state.mark_disconnected()
            })
            .collect();
        join_all(links.into_iter().map(|link| self.inner.close_link(link))).await;

        for task in self.inner.tasks().drain(..) {
            task.abort();
        }
        debug!("Lamp manager stopped");
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn lamps_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<LampId, Arc<LampSlot>>> {
        self.lamps.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lamps_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<LampId, Arc<LampSlot>>> {
        self.lamps.write().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn slot(&self, id: &LampId) -> Result<Arc<LampSlot>> {
        self.lamps_read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::lamp_not_found(id.as_str()))
    }

    /// All slots, sorted by id.
    fn slots(&self) -> Vec<Arc<LampSlot>> {
        let mut slots: Vec<_> = self.lamps_read().values().cloned().collect();
        slots.sort_by(|a, b| a.id.cmp(&b.id));
        slots
    }

    /// Bound one characteristic operation by `io_timeout`.
    async fn io<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match timeout(self.config.io_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(millis(self.config.io_timeout))),
        }
    }

    /// Rewrite the lamp file from the live configs.
    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let configs: Vec<LampConfig> = self
            .slots()
            .iter()
            .map(|slot| slot.state().config.clone())
            .collect();
        self.store.save(&configs).await.map_err(|e| {
            warn!("Failed to persist lamp configs: {}", e);
            Error::from(e)
        })
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Connect unless already connected. Caller holds the operation lock.
    async fn ensure_connected(self: &Arc<Self>, slot: &Arc<LampSlot>) -> Result<()> {
        {
            let mut state = slot.state();
            if state.status == ConnectionStatus::Connected && state.link.is_some() {
                return Ok(());
            }
            state.cancel_reconnect();
            state.reconnect_attempts = 0;
        }

        match self.connect_locked(slot).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.after_connect_failure(slot, &e).await;
                Err(e)
            }
        }
    }

    /// Run the whole connect pipeline once. Caller holds the operation lock.
    async fn connect_locked(self: &Arc<Self>, slot: &Arc<LampSlot>) -> Result<()> {
        self.ensure_running()?;
        let id = &slot.id;
        let (config, link_id, known_bounds) = {
            let mut state = slot.state();
            if state.removed {
                return Err(Error::lamp_not_found(id.as_str()));
            }
            if let Some(stale) = state.mark_disconnected() {
                self.close_detached(stale);
            }
            state.status = ConnectionStatus::Connecting;
            (state.config.clone(), state.link_id, state.bounds)
        };

        debug!(lamp = %id, "Connecting to {}", config.address);
        let budget = self.config.connect_timeout;
        let deadline = Instant::now() + budget;
        let events = LampEventSink::new(id.clone(), link_id, self.events_tx.clone());
        let link = match timeout_at(deadline, self.transport.connect(&config, events)).await {
            Ok(Ok(link)) => Arc::new(link),
            Ok(Err(e)) => return Err(self.connect_failed(slot, link_id, e)),
            Err(_) => {
                let e = Error::connection_timeout(id.as_str(), millis(budget));
                return Err(self.connect_failed(slot, link_id, e));
            }
        };

        let prepared = match timeout_at(deadline, self.prepare_link(slot, &link, known_bounds)).await
        {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) => {
                self.close_detached(link);
                return Err(self.connect_failed(slot, link_id, e));
            }
            Err(_) => {
                self.close_detached(link);
                let e = Error::connection_timeout(id.as_str(), millis(budget));
                return Err(self.connect_failed(slot, link_id, e));
            }
        };

        let changed = {
            let mut state = slot.state();
            if state.link_id != link_id
                || state.status != ConnectionStatus::Connecting
                || state.removed
            {
                let removed = state.removed;
                drop(state);
                self.close_detached(link);
                self.ensure_running()?;
                return Err(if removed {
                    Error::lamp_not_found(id.as_str())
                } else {
                    Error::transport("connection attempt superseded")
                });
            }
            commit(&mut state, link, prepared)
        };

        info!(lamp = %id, "Connected to {}", slot.state().config.name);
        if changed {
            let _ = self.persist().await;
        }
        Ok(())
    }

    fn connect_failed(&self, slot: &LampSlot, link_id: u64, error: Error) -> Error {
        let mut state = slot.state();
        if state.link_id == link_id && state.status == ConnectionStatus::Connecting {
            state.status = ConnectionStatus::Disconnected;
        }
        state.last_error = Some(error.to_string());
        error
    }

    /// Discover, subscribe, calibrate and read the initial state.
    async fn prepare_link(
        &self,
        slot: &LampSlot,
        link: &AnyLampLink,
        known_bounds: Option<TemperatureBounds>,
    ) -> Result<Prepared> {
        let id = &slot.id;
        let chars = CharacteristicHandles::resolve(&self.io(link.discover()).await?);
        if !chars.controllable() {
            return Err(Error::unsupported(id.as_str(), "power control"));
        }

        for uuid in chars.notify_targets() {
            match self.io(link.subscribe(uuid)).await {
                Ok(()) => trace!(lamp = %id, %uuid, "Subscribed"),
                Err(e) if chars.has_readable_state() => {
                    warn!(lamp = %id, %uuid, "Subscribe failed, relying on polls: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        let model = self.read_info(slot, link, chars.model).await;
        let firmware = self.read_info(slot, link, chars.firmware).await;

        let calibrated = match chars.temperature.zip(chars.temperature_read) {
            Some((uuid, _)) if known_bounds.is_none() => match self.calibrate(link, uuid).await {
                Ok(bounds) => {
                    info!(lamp = %id, warm_raw = bounds.warm_raw, "Temperature calibrated");
                    Some(bounds)
                }
                Err(e) => {
                    warn!(lamp = %id, "Temperature calibration failed: {}", e);
                    None
                }
            },
            _ => None,
        };

        let bounds = chars
            .temperature
            .map(|_| calibrated.or(known_bounds).unwrap_or_default());
        let state = self.read_state(link, &chars, bounds).await?;

        Ok(Prepared {
            chars,
            state,
            calibrated,
            model,
            firmware,
        })
    }

    /// Best-effort read of a device information string.
    async fn read_info(&self, slot: &LampSlot, link: &AnyLampLink, uuid: Option<Uuid>) -> Option<String> {
        let uuid = uuid?;
        match self.io(link.read(uuid)).await {
            Ok(raw) => parse_text(&raw),
            Err(e) => {
                debug!(lamp = %slot.id, %uuid, "Information read failed: {}", e);
                None
            }
        }
    }

    /// Find the warm end the lamp really supports.
    ///
    /// Writes the warmest protocol value, reads back what the lamp settled
    /// on and restores the original value.
    async fn calibrate(&self, link: &AnyLampLink, uuid: Uuid) -> Result<TemperatureBounds> {
        let original = self.io(link.read(uuid)).await?;
        self.io(link.write(uuid, &[TEMPERATURE_RAW_WARMEST])).await?;
        tokio::time::sleep(self.config.calibration_settle).await;
        let reported = self.io(link.read(uuid)).await;

        if !original.is_empty()
            && let Err(e) = self.io(link.write(uuid, &original)).await
        {
            warn!("Restoring temperature after calibration failed: {}", e);
        }

        let reported = reported?;
        Ok(TemperatureBounds::calibrated(
            reported.first().copied().unwrap_or(TEMPERATURE_RAW_WARMEST),
        ))
    }

    /// Read the full state, preferring the combined frame.
    async fn read_state(
        &self,
        link: &AnyLampLink,
        chars: &CharacteristicHandles,
        bounds: Option<TemperatureBounds>,
    ) -> Result<LampState> {
        if let Some(uuid) = chars.frame {
            let raw = self.io(link.read(uuid)).await?;
            if let Some(frame) = parse_control(&raw) {
                return Ok(frame.to_state(bounds.as_ref()));
            }
            trace!(%uuid, "State frame unreadable, reading characteristics one by one");
        }

        let mut state = LampState::default();
        if let Some(uuid) = chars.power_read
            && let Some(on) = parse_power(&self.io(link.read(uuid)).await?)
        {
            state.is_on = on;
        }
        if let Some(uuid) = chars.brightness_read
            && let Some(raw) = self.io(link.read(uuid)).await?.first()
        {
            state.brightness = brightness_to_percent(*raw);
        }
        if let (Some(uuid), Some(bounds)) = (chars.temperature_read, bounds)
            && let Some(raw) = self.io(link.read(uuid)).await?.first()
        {
            state.temperature = Some(bounds.to_percent(*raw));
        }
        Ok(state)
    }

    async fn disconnect_locked(&self, slot: &LampSlot) {
        let link = {
            let mut state = slot.state();
            state.manual_disconnect = true;
            state.cancel_reconnect();
            state.mark_disconnected()
        };
        if let Some(link) = link {
            info!(lamp = %slot.id, "Disconnected");
            self.close_link(link).await;
        }
    }

    /// The link dropped, a write failed or a probe went unanswered.
    ///
    /// Clears the characteristic handles and schedules a reconnect.
    fn link_lost(self: &Arc<Self>, slot: &Arc<LampSlot>, link_id: u64, reason: &str) {
        let link = {
            let mut state = slot.state();
            if !state.is_live(link_id) {
                trace!(lamp = %slot.id, "Ignoring stale link event: {}", reason);
                return;
            }
            warn!(lamp = %slot.id, "Connection lost: {}", reason);
            state.last_error = Some(reason.to_string());
            let link = state.mark_disconnected();
            self.schedule_reconnect(slot, &mut state);
            link
        };
        if let Some(link) = link {
            self.close_detached(link);
        }
    }

    async fn close_link(&self, link: Arc<AnyLampLink>) {
        if timeout(self.config.io_timeout, link.disconnect()).await.is_err() {
            warn!("Link close timeout ({}ms)", millis(self.config.io_timeout));
        }
    }

    fn close_detached(&self, link: Arc<AnyLampLink>) {
        let grace = self.config.io_timeout;
        tokio::spawn(async move {
            let _ = timeout(grace, link.disconnect()).await;
        });
    }

    /// Count a failed connect. Caller holds the operation lock.
    ///
    /// Blacklists lamps that never connected once the threshold is reached,
    /// schedules a reconnect otherwise.
    async fn after_connect_failure(self: &Arc<Self>, slot: &Arc<LampSlot>, error: &Error) {
        if matches!(error, Error::ShuttingDown | Error::NotFound { .. }) {
            return;
        }
        let class = classify_failure(error);
        let blacklist = {
            let mut state = slot.state();
            if state.removed {
                return;
            }
            state.failures += 1;
            if class == FailureClass::Authorization {
                state.pairing_required = true;
            }
            warn!(
                lamp = %slot.id,
                failures = state.failures,
                class = ?class,
                "Connect failed: {}",
                error
            );

            let blacklist = !state.config.has_connected_once
                && state.failures >= self.config.blacklist_threshold;
            if !blacklist {
                self.schedule_reconnect(slot, &mut state);
            }
            blacklist
        };

        if blacklist
            && let Err(e) = self.remove_locked(slot, "repeated connect failures").await
        {
            error!(lamp = %slot.id, "Blacklisting failed: {}", e);
        }
    }

    /// Blacklist the lamp's address and drop it from the live maps. Caller
    /// holds the operation lock.
    async fn remove_locked(&self, slot: &LampSlot, reason: &str) -> Result<String> {
        let address = slot.state().config.address.clone();
        let stored = self.blacklist.insert(&address).await;

        let link = {
            let mut state = slot.state();
            state.removed = true;
            state.cancel_reconnect();
            state.mark_disconnected()
        };
        self.lamps_write().remove(&slot.id);
        warn!(lamp = %slot.id, address = %address, reason, "Lamp blacklisted");

        if let Some(link) = link {
            self.close_link(link).await;
        }
        let saved = self.persist().await;
        stored?;
        saved?;
        Ok(normalize_address(&address))
    }

    // ------------------------------------------------------------------
    // Background reconnect
    // ------------------------------------------------------------------

    /// Arm the reconnect timer unless one is pending, the lamp was
    /// disconnected on purpose or removed, the budget is spent or we are
    /// shutting down.
    fn schedule_reconnect(self: &Arc<Self>, slot: &Arc<LampSlot>, state: &mut LampConnection) {
        if self.shutdown.is_cancelled()
            || state.manual_disconnect
            || state.removed
            || state.reconnect_task.is_some()
        {
            return;
        }

        let backoff = &self.config.reconnect;
        if backoff.exhausted(state.reconnect_attempts) {
            warn!(
                lamp = %slot.id,
                attempts = state.reconnect_attempts,
                "Giving up automatic reconnection until the next command"
            );
            return;
        }

        let delay = backoff.delay(state.reconnect_attempts);
        state.reconnect_attempts += 1;
        state.reconnect_epoch += 1;
        let epoch = state.reconnect_epoch;

        debug!(
            lamp = %slot.id,
            attempt = state.reconnect_attempts,
            delay_ms = millis(delay),
            "Scheduling reconnect"
        );

        let weak = Arc::downgrade(self);
        let slot = slot.clone();
        let shutdown = self.shutdown.clone();
        state.reconnect_task = Some(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(inner) = weak.upgrade() {
                inner.reconnect(&slot, epoch).await;
            }
        }));
    }

    async fn reconnect(self: &Arc<Self>, slot: &Arc<LampSlot>, epoch: u64) {
        let _op = slot.op_lock.lock().await;
        {
            let mut state = slot.state();
            if state.reconnect_epoch != epoch {
                return;
            }
            state.reconnect_task = None;
            if self.shutdown.is_cancelled()
                || state.manual_disconnect
                || state.removed
                || state.status != ConnectionStatus::Disconnected
            {
                return;
            }
        }

        match self.connect_locked(slot).await {
            Ok(()) => info!(lamp = %slot.id, "Reconnected"),
            Err(e) => self.after_connect_failure(slot, &e).await,
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn apply_change(self: &Arc<Self>, id: &LampId, change: Change) -> Result<LampState> {
        self.ensure_running()?;
        let slot = self.slot(id)?;
        let _op = slot.op_lock.lock().await;
        slot.state().manual_disconnect = false;
        self.ensure_connected(&slot).await?;

        let (link, link_id, chars, current, bounds) = {
            let state = slot.state();
            let Some(link) = state.link.clone() else {
                return Err(Error::not_connectable(id.as_str(), "no open link"));
            };
            (link, state.link_id, state.chars, state.lamp_state, state.temperature_bounds())
        };

        if change.temperature.is_some() && chars.temperature.is_none() {
            return Err(Error::unsupported(id.as_str(), "colour temperature"));
        }
        if change.brightness.is_some() && chars.control.is_none() && chars.brightness.is_none() {
            return Err(Error::unsupported(id.as_str(), "brightness"));
        }

        let target = LampState {
            is_on: change.power.unwrap_or(current.is_on),
            brightness: change.brightness.unwrap_or(current.brightness),
            temperature: change.temperature.or(current.temperature),
        };

        let written = match chars.control {
            Some(uuid) => {
                let payload = control_payload(&target, &bounds.unwrap_or_default());
                trace!(lamp = %id, ?payload, "Writing control frame");
                self.io(link.write(uuid, &payload)).await
            }
            None => self.write_separately(&link, &chars, change, bounds).await,
        };

        match written {
            Ok(()) => {
                let mut state = slot.state();
                if state.is_live(link_id) {
                    state.lamp_state = target;
                }
                debug!(
                    lamp = %id,
                    on = target.is_on,
                    brightness = target.brightness,
                    "Lamp state written"
                );
                Ok(target)
            }
            Err(e) => {
                self.link_lost(&slot, link_id, &format!("write failed: {e}"));
                Err(Error::command_failed(id.as_str(), 1, e))
            }
        }
    }

    /// Fallback for lamps without the combined control characteristic.
    async fn write_separately(
        &self,
        link: &AnyLampLink,
        chars: &CharacteristicHandles,
        change: Change,
        bounds: Option<TemperatureBounds>,
    ) -> Result<()> {
        if let (Some(on), Some(uuid)) = (change.power, chars.power) {
            self.io(link.write(uuid, &power_payload(on))).await?;
        }
        if let (Some(percent), Some(uuid)) = (change.brightness, chars.brightness) {
            self.io(link.write(uuid, &[brightness_to_raw(percent)])).await?;
        }
        if let (Some(percent), Some(uuid), Some(bounds)) =
            (change.temperature, chars.temperature, bounds)
        {
            self.io(link.write(uuid, &[bounds.to_raw(percent)])).await?;
        }
        Ok(())
    }

    /// Re-read the state of a connected lamp, optionally re-resolving its
    /// characteristics first. Caller holds the operation lock.
    async fn refresh_locked(
        self: &Arc<Self>,
        slot: &Arc<LampSlot>,
        rediscover: bool,
    ) -> Result<LampState> {
        let (link, link_id, chars, bounds) = {
            let state = slot.state();
            match state.link.clone() {
                Some(link) if state.status == ConnectionStatus::Connected => {
                    (link, state.link_id, state.chars, state.bounds)
                }
                _ => return Err(Error::not_connectable(slot.id.as_str(), "not connected")),
            }
        };

        match self.reread(slot, &link, chars, bounds, rediscover).await {
            Ok((chars, lamp_state)) => {
                let mut state = slot.state();
                if state.is_live(link_id) {
                    state.chars = chars;
                    state.capabilities = chars.capabilities();
                    state.lamp_state = lamp_state;
                    state.reachable = true;
                }
                trace!(lamp = %slot.id, on = lamp_state.is_on, "State refreshed");
                Ok(lamp_state)
            }
            Err(e) => {
                self.link_lost(slot, link_id, &format!("state read failed: {e}"));
                Err(e)
            }
        }
    }

    async fn reread(
        &self,
        slot: &LampSlot,
        link: &AnyLampLink,
        mut chars: CharacteristicHandles,
        bounds: Option<TemperatureBounds>,
        rediscover: bool,
    ) -> Result<(CharacteristicHandles, LampState)> {
        if rediscover {
            chars = CharacteristicHandles::resolve(&self.io(link.discover()).await?);
            if !chars.controllable() {
                return Err(Error::unsupported(slot.id.as_str(), "power control"));
            }
        }
        let bounds = chars.temperature.map(|_| bounds.unwrap_or_default());
        let state = self.read_state(link, &chars, bounds).await?;
        Ok((chars, state))
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    async fn scan(self: &Arc<Self>) -> Result<ScanReport> {
        self.ensure_running()?;
        let _scan = self.scan_lock.lock().await;
        let window = self.config.scan_window;

        let advertisements =
            match timeout(window + self.config.io_timeout, self.transport.scan(window)).await {
                Ok(result) => result?,
                Err(_) => return Err(Error::timeout(millis(window + self.config.io_timeout))),
            };
        self.ensure_running()?;

        let mut report = ScanReport {
            advertisements: advertisements.len(),
            ..ScanReport::default()
        };
        let mut seen = HashSet::new();
        for ad in &advertisements {
            if self.blacklist.contains(&ad.address) {
                trace!(address = %ad.address, "Ignoring blacklisted advertisement");
                report.ignored += 1;
                continue;
            }
            if self.process_advertisement(ad) {
                report.new_lamps += 1;
            }
            seen.insert(ad.id.clone());
        }

        for slot in self.slots() {
            let mut state = slot.state();
            if !seen.contains(&slot.id) && state.status != ConnectionStatus::Connected {
                state.reachable = false;
            }
        }
        if !seen.is_empty() {
            let _ = self.persist().await;
        }

        let verified = join_all(self.slots().iter().map(|slot| self.verify(slot))).await;
        report.verified = verified.iter().filter(|v| **v == Verification::Verified).count();
        report.dropped = verified.iter().filter(|v| **v == Verification::Dropped).count();

        if self.config.auto_connect {
            let candidates: Vec<_> = self
                .slots()
                .into_iter()
                .filter(|slot| {
                    let state = slot.state();
                    state.reachable
                        && state.status == ConnectionStatus::Disconnected
                        && !state.manual_disconnect
                        && !state.removed
                })
                .collect();
            report.connect_attempts = candidates.len();
            let connected = join_all(candidates.iter().map(|slot| self.connect_discovered(slot))).await;
            report.connected = connected.into_iter().filter(|ok| *ok).count();
        }

        info!(
            advertisements = report.advertisements,
            new = report.new_lamps,
            verified = report.verified,
            dropped = report.dropped,
            connected = report.connected,
            "Scan finished"
        );
        Ok(report)
    }

    /// Register or refresh the lamp behind an advertisement. Returns whether
    /// a new lamp was created.
    fn process_advertisement(&self, ad: &Advertisement) -> bool {
        let now = Utc::now();
        if let Some(slot) = self.lamps_read().get(&ad.id) {
            let mut state = slot.state();
            state.reachable = true;
            state.rssi = ad.rssi.or(state.rssi);
            state.config.last_seen = Some(now);
            return false;
        }

        let Some(matched) = match_lamp(ad) else {
            return false;
        };
        let name = ad
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map_or_else(|| default_name(&ad.address), str::to_string);

        let mut config = LampConfig::new(ad.id.clone(), name, ad.address.clone());
        config.last_seen = Some(now);
        let slot = LampSlot::new(config);
        {
            let mut state = slot.state();
            state.reachable = true;
            state.rssi = ad.rssi;
        }

        let mut lamps = self.lamps_write();
        if lamps.contains_key(&ad.id) {
            return false;
        }
        info!(lamp = %ad.id, rule = ?matched, "Discovered lamp {}", slot.state().config.name);
        lamps.insert(ad.id.clone(), Arc::new(slot));
        true
    }

    /// Probe a connected lamp and refresh it. Skips lamps that are not
    /// connected.
    async fn verify(self: &Arc<Self>, slot: &Arc<LampSlot>) -> Verification {
        let _op = slot.op_lock.lock().await;
        let (link, link_id, probe) = {
            let state = slot.state();
            match state.link.clone() {
                Some(link) if state.status == ConnectionStatus::Connected => {
                    (link, state.link_id, state.chars.probe())
                }
                _ => return Verification::Skipped,
            }
        };

        // Without a readable characteristic the rediscovery below is the check.
        let answered = match probe {
            Some(uuid) => matches!(
                timeout(self.config.verify_timeout, link.read(uuid)).await,
                Ok(Ok(_))
            ),
            None => true,
        };
        if !answered {
            self.link_lost(slot, link_id, "no answer to reachability probe");
            return Verification::Dropped;
        }

        match self.refresh_locked(slot, true).await {
            Ok(_) => Verification::Verified,
            Err(_) => Verification::Dropped,
        }
    }

    async fn connect_discovered(self: &Arc<Self>, slot: &Arc<LampSlot>) -> bool {
        let _op = slot.op_lock.lock().await;
        {
            let mut state = slot.state();
            if state.status != ConnectionStatus::Disconnected
                || state.manual_disconnect
                || state.removed
            {
                return state.status == ConnectionStatus::Connected;
            }
            state.cancel_reconnect();
        }
        match self.connect_locked(slot).await {
            Ok(()) => true,
            Err(e) => {
                self.after_connect_failure(slot, &e).await;
                false
            }
        }
    }

    fn spawn_scan_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                if let Err(e) = inner.scan().await {
                    warn!("Scan failed: {}", e);
                }
            }
            debug!("Scan loop stopped");
        })
    }

    fn spawn_poll_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                inner.poll().await;
            }
            debug!("Poll loop stopped");
        })
    }

    /// Refresh every connected lamp that is not busy.
    async fn poll(self: &Arc<Self>) {
        let connected: Vec<_> = self
            .slots()
            .into_iter()
            .filter(|slot| slot.state().status == ConnectionStatus::Connected)
            .collect();

        join_all(connected.iter().map(|slot| async move {
            let Ok(_op) = slot.op_lock.try_lock() else {
                trace!(lamp = %slot.id, "Poll skipped, operation in flight");
                return;
            };
            let _ = self.refresh_locked(slot, false).await;
        }))
        .await;
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn handle_event(self: &Arc<Self>, event: LampEvent) {
        let Ok(slot) = self.slot(&event.lamp) else {
            trace!(lamp = %event.lamp, "Event for unknown lamp");
            return;
        };

        match event.kind {
            LampEventKind::Notification { uuid, value } => {
                let mut state = slot.state();
                if !state.is_live(event.link) {
                    trace!(lamp = %slot.id, "Ignoring notification from stale link");
                    return;
                }
                match notified_state(&state, uuid, &value) {
                    Some(lamp_state) => {
                        debug!(
                            lamp = %slot.id,
                            on = lamp_state.is_on,
                            brightness = lamp_state.brightness,
                            "State notified"
                        );
                        state.lamp_state = lamp_state;
                    }
                    None => trace!(lamp = %slot.id, %uuid, "Ignoring notification"),
                }
            }
            LampEventKind::Disconnected => {
                self.link_lost(&slot, event.link, "disconnected by peripheral");
            }
        }
    }
}

/// Apply a connect result. Returns whether the persisted config changed.
fn commit(state: &mut LampConnection, link: Arc<AnyLampLink>, prepared: Prepared) -> bool {
    let mut changed = !state.config.has_connected_once;
    if prepared.model.is_some() && prepared.model != state.config.model {
        state.config.model = prepared.model;
        changed = true;
    }

    state.status = ConnectionStatus::Connected;
    state.link = Some(link);
    state.chars = prepared.chars;
    state.capabilities = prepared.chars.capabilities();
    state.lamp_state = prepared.state;
    if let Some(bounds) = prepared.calibrated {
        state.bounds = Some(bounds);
    }
    state.firmware = prepared.firmware.or(state.firmware.take());
    state.config.has_connected_once = true;
    state.reachable = true;
    state.pairing_required = false;
    state.failures = 0;
    state.reconnect_attempts = 0;
    state.last_error = None;
    changed
}

/// State carried by a notification, if the characteristic carries any.
fn notified_state(state: &LampConnection, uuid: Uuid, value: &[u8]) -> Option<LampState> {
    let chars = &state.chars;
    if chars.carries_frame(uuid) {
        let bounds = state.temperature_bounds();
        parse_control(value).map(|frame| frame.to_state(bounds.as_ref()))
    } else if Some(uuid) == chars.power {
        parse_power(value).map(|is_on| LampState {
            is_on,
            ..state.lamp_state
        })
    } else if Some(uuid) == chars.brightness {
        value.first().map(|raw| LampState {
            brightness: brightness_to_percent(*raw),
            ..state.lamp_state
        })
    } else {
        None
    }
}

/// Name for lamps that advertise none: `Lamp` plus the last four hex digits
/// of the address.
fn default_name(address: &str) -> String {
    let digits: String = address.chars().filter(char::is_ascii_hexdigit).collect();
    let tail = digits.get(digits.len().saturating_sub(4)..).unwrap_or_default();
    format!("Lamp {}", tail.to_ascii_uppercase())
}

async fn run_event_pump(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<LampEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        inner.handle_event(event);
    }
    debug!("Lamp event pump stopped");
}
