//! Local-protocol device manager.
//!
//! Owns one connection state machine per configured appliance:
//!
//! ```text
//!                 connect / command / status
//!  ┌──────────────┐ ───────────────────────► ┌────────────┐
//!  │ Disconnected │                          │ Connecting │
//!  └──────────────┘ ◄─────────────────────── └────────────┘
//!     ▲      │          failure / timeout          │
//!     │      │ reconnect timer                     │ session opened
//!     │      ▼ (backoff + jitter)                  ▼
//!     │   (one attempt)                      ┌───────────┐
//!     └───────────────────────────────────── │ Connected │──► heartbeat
//!          socket closed / error / timeout   └───────────┘
//! ```
//!
//! Caller operations on one device are serialized through its operation
//! lock; operations on different devices never wait on each other. Inbound
//! pushes from all sessions arrive on one channel and are applied by a
//! single pump task through the device's state mutex.
//!
//! Background work (reconnects, heartbeats, the pump) holds only a weak
//! reference to the manager, checks the shutdown token before every step and
//! never reports errors to callers.

use crate::config::LocalManagerConfig;
use crate::device::{ConnectionStats, DeviceSlot};
use crate::transport::{
    AnyLocalSession, AnyLocalTransport, EventKind, EventSink, LocalSession, LocalTransport,
    TransportEvent,
};
use futures::future::join_all;
use pethub_core::{ConnectionStatus, DeviceConfig, DeviceId, DeviceKind, DpsMap, Error, Result};
use pethub_protocol::meal_plan::{self, MealPlanEntry};
use pethub_protocol::status::feeder;
use pethub_protocol::{DeviceStatus, is_corrupted, is_corrupted_bytes, translate};
use pethub_storage::MealPlanCache;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Manager of all local-protocol appliances.
///
/// Cheap to clone; clones share the same devices.
///
/// # Examples
///
/// ```
/// use pethub_core::{DeviceConfig, DeviceId, LocalKey};
/// use pethub_local::{DeviceManager, LocalManagerConfig, mock::MockLocalTransport};
/// use pethub_storage::MealPlanCache;
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> pethub_core::Result<()> {
/// let feeder = DeviceId::new("feeder-1")?;
/// let config = DeviceConfig::new(feeder.clone(), LocalKey::new("0123456789abcdef"), "192.168.1.40")
///     .with_category("cwwsq");
///
/// let (transport, _handle) = MockLocalTransport::new();
/// let dir = std::env::temp_dir().join("pethub-doc-manager");
/// let manager = DeviceManager::new(
///     vec![config],
///     transport,
///     MealPlanCache::empty(dir.join("meal_plans.json")),
///     LocalManagerConfig::default(),
/// )?;
///
/// manager.send_command(&feeder, "3", json!(1), false).await?;
/// assert_eq!(manager.get_connection_stats().connected, 1);
///
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DeviceManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: LocalManagerConfig,
    transport: AnyLocalTransport,
    devices: HashMap<DeviceId, Arc<DeviceSlot>>,
    order: Vec<DeviceId>,
    meal_plans: MealPlanCache,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(pump) = self.pump.get_mut().ok().and_then(Option::take) {
            pump.abort();
        }
    }
}

impl DeviceManager {
    /// Create a manager for `devices` and start its event pump.
    ///
    /// No connection is opened until a caller asks for one (see
    /// [`connect_all`](Self::connect_all)).
    ///
    /// # Errors
    /// Returns `Error::Config` if two devices share an id.
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime.
    pub fn new(
        devices: Vec<DeviceConfig>,
        transport: impl Into<AnyLocalTransport>,
        meal_plans: MealPlanCache,
        config: LocalManagerConfig,
    ) -> Result<Self> {
        let mut slots = HashMap::with_capacity(devices.len());
        let mut order = Vec::with_capacity(devices.len());
        for device in devices {
            let id = device.id.clone();
            if slots.contains_key(&id) {
                return Err(Error::Config(format!("Duplicate device id '{id}'")));
            }
            let slot = DeviceSlot::new(device);
            debug!(device = %id, kind = %slot.kind, "Registered device");
            slots.insert(id.clone(), Arc::new(slot));
            order.push(id);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            transport: transport.into(),
            devices: slots,
            order,
            meal_plans,
            events_tx,
            shutdown: CancellationToken::new(),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(run_event_pump(
            Arc::downgrade(&inner),
            events_rx,
            inner.shutdown.clone(),
        ));
        if let Ok(mut slot) = inner.pump.lock() {
            *slot = Some(pump);
        }

        info!("Device manager started with {} devices", inner.order.len());
        Ok(Self { inner })
    }

    /// Ids of all configured devices, in configuration order.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.inner.order.clone()
    }

    pub fn device_config(&self, id: &DeviceId) -> Result<DeviceConfig> {
        Ok(self.inner.slot(id)?.config.clone())
    }

    pub fn device_kind(&self, id: &DeviceId) -> Result<DeviceKind> {
        Ok(self.inner.slot(id)?.kind)
    }

    pub fn connection_status(&self, id: &DeviceId) -> Result<ConnectionStatus> {
        Ok(self.inner.slot(id)?.state().status)
    }

    /// Connect a device. Succeeds immediately if already connected.
    ///
    /// Clears a previous explicit disconnect. If every synchronous attempt
    /// fails, background reconnection takes over and the last error is
    /// returned.
    pub async fn connect(&self, id: &DeviceId) -> Result<()> {
        self.inner.ensure_running()?;
        let slot = self.inner.slot(id)?;
        let _op = slot.op_lock.lock().await;
        slot.state().manual_disconnect = false;

        match self.inner.ensure_connected(&slot).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.inner.schedule_reconnect_if_idle(&slot);
                Err(e)
            }
        }
    }

    /// Disconnect a device, cancelling its heartbeat and any pending
    /// reconnect. Background reconnection stays off until the next explicit
    /// connect or command.
    pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let slot = self.inner.slot(id)?;
        let _op = slot.op_lock.lock().await;
        self.inner.disconnect_locked(&slot).await;
        Ok(())
    }

    /// Connect every device concurrently. Returns the devices that failed.
    pub async fn connect_all(&self) -> Vec<(DeviceId, Error)> {
        let results = join_all(self.inner.order.iter().map(|id| async move {
            (id.clone(), self.connect(id).await)
        }))
        .await;

        let failures: Vec<_> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();
        info!(
            "Connected {} of {} devices",
            self.inner.order.len() - failures.len(),
            self.inner.order.len()
        );
        failures
    }

    /// Disconnect every device concurrently.
    pub async fn disconnect_all(&self) {
        join_all(self.inner.order.iter().map(|id| self.disconnect(id))).await;
    }

    /// Write one data point.
    ///
    /// Connects first if needed. Transient failures are retried up to
    /// `command_attempts` times with a linear delay. With `disconnect_after`
    /// the session is closed once the write succeeded.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, `ShuttingDown` after shutdown,
    /// `CommandFailed` carrying the last cause otherwise.
    pub async fn send_command(
        &self,
        id: &DeviceId,
        field: &str,
        value: Value,
        disconnect_after: bool,
    ) -> Result<()> {
        self.inner
            .send_command(id, field, &value, disconnect_after)
            .await
    }

    /// Read all data points of a device.
    ///
    /// Each attempt, connect included, is bounded by `status_timeout`; the
    /// attempt budget is smaller than for commands so polling fails fast.
    ///
    /// # Errors
    /// `NotFound`, `ShuttingDown`, or `StatusTimeout` carrying the last cause.
    pub async fn get_status(&self, id: &DeviceId) -> Result<DpsMap> {
        self.inner.get_status(id).await
    }

    /// Read a device and translate its merged data points.
    pub async fn get_device_status(&self, id: &DeviceId) -> Result<DeviceStatus> {
        let dps = self.get_status(id).await?;
        let slot = self.inner.slot(id)?;
        let cached = slot.state().last_status.clone();
        Ok(cached.unwrap_or_else(|| translate(slot.kind, &dps)))
    }

    /// Last merged data points received from a device.
    pub fn last_data(&self, id: &DeviceId) -> Result<DpsMap> {
        Ok(self.inner.slot(id)?.state().last_data.clone())
    }

    /// Translation of [`last_data`](Self::last_data), if anything was received.
    pub fn last_status(&self, id: &DeviceId) -> Result<Option<DeviceStatus>> {
        Ok(self.inner.slot(id)?.state().last_status.clone())
    }

    /// Cached encoded meal plan of a device.
    pub fn get_meal_plan(&self, id: &DeviceId) -> Result<Option<String>> {
        self.inner.slot(id)?;
        Ok(self.inner.meal_plans.get(id))
    }

    /// Replace the cached meal plan without talking to the device.
    pub async fn set_meal_plan_cache(&self, id: &DeviceId, encoded: impl Into<String>) -> Result<()> {
        self.inner.slot(id)?;
        self.inner.meal_plans.set(id, encoded).await;
        Ok(())
    }

    /// Send an encoded meal plan to a feeder and cache it.
    ///
    /// The plan is decoded first so malformed input never reaches the
    /// device.
    ///
    /// # Errors
    /// `Unsupported` for non-feeders, `Decoding` for invalid base64, and the
    /// errors of [`send_command`](Self::send_command).
    pub async fn set_meal_plan(&self, id: &DeviceId, encoded: &str) -> Result<Vec<MealPlanEntry>> {
        let slot = self.inner.slot(id)?;
        if slot.kind != DeviceKind::Feeder {
            return Err(Error::unsupported(id.as_str(), "meal plan"));
        }

        let encoded = encoded.trim();
        let entries = meal_plan::decode(encoded)?;
        self.send_command(id, feeder::dp::MEAL_PLAN, Value::from(encoded), false)
            .await?;
        info!(device = %id, entries = entries.len(), "Meal plan applied");
        Ok(entries)
    }

    /// Encode `entries` and send them to a feeder.
    pub async fn apply_meal_plan(&self, id: &DeviceId, entries: &[MealPlanEntry]) -> Result<String> {
        let encoded = meal_plan::encode(entries)?;
        self.set_meal_plan(id, &encoded).await?;
        Ok(encoded)
    }

    /// Connection snapshot of all devices.
    pub fn get_connection_stats(&self) -> ConnectionStats {
        ConnectionStats::from_devices(
            self.inner
                .order
                .iter()
                .filter_map(|id| self.inner.devices.get(id))
                .map(|slot| slot.info())
                .collect(),
        )
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop all background work and close every session.
    ///
    /// Later calls return `ShuttingDown`. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down device manager");
        self.inner.shutdown.cancel();

        let sessions: Vec<_> = self
            .inner
            .devices
            .values()
            .filter_map(|slot| {
                let mut state = slot.state();
                state.cancel_reconnect();
                state.mark_disconnected()
            })
            .collect();

        join_all(sessions.into_iter().map(|s| self.inner.close_session(s))).await;

        let pump = self.inner.pump.lock().ok().and_then(|mut p| p.take());
        if let Some(pump) = pump {
            pump.abort();
        }
        debug!("Device manager stopped");
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

    fn slot(&self, id: &DeviceId) -> Result<Arc<DeviceSlot>> {
        self.devices
            .get(id)
            .cloned()
            .ok_or_else(|| Error::device_not_found(id.as_str()))
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Bounded synchronous connect. Caller holds the operation lock.
    async fn ensure_connected(self: &Arc<Self>, slot: &Arc<DeviceSlot>) -> Result<Arc<AnyLocalSession>> {
        let id = slot.id();
        {
            let mut state = slot.state();
            if state.status == ConnectionStatus::Connected
                && let Some(session) = &state.session
            {
                return Ok(session.clone());
            }

            if state.status == ConnectionStatus::Connecting {
                let stuck_for = state
                    .connecting_since
                    .map(|since| since.elapsed())
                    .unwrap_or_default();
                if stuck_for >= self.config.connect_timeout {
                    warn!(
                        device = %id,
                        stuck_ms = millis(stuck_for),
                        "Stuck connecting beyond timeout, forcing reset"
                    );
                } else {
                    debug!(device = %id, "Resetting abandoned connect attempt");
                }
                if let Some(session) = state.mark_disconnected() {
                    self.close_detached(session);
                }
            }

            state.cancel_reconnect();
            state.reconnect_attempts = 0;
        }

        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            self.ensure_running()?;
            match self.connect_once(slot).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    debug!(device = %id, attempt, "Connect attempt failed: {}", e);
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::not_connectable(id.as_str(), "no attempt made")))
    }

    /// One connect attempt bounded by `connect_timeout`.
    async fn connect_once(self: &Arc<Self>, slot: &Arc<DeviceSlot>) -> Result<Arc<AnyLocalSession>> {
        let id = slot.id();
        let session_id = {
            let mut state = slot.state();
            state.status = ConnectionStatus::Connecting;
            state.connecting_since = Some(Instant::now());
            state.session_id += 1;
            state.session_id
        };

        debug!(device = %id, "Connecting to {}:{}", slot.config.ip, slot.config.port);
        let events = EventSink::new(id.clone(), session_id, self.events_tx.clone());
        let result = match timeout(
            self.config.connect_timeout,
            self.transport.connect(&slot.config, events),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::connection_timeout(
                id.as_str(),
                millis(self.config.connect_timeout),
            )),
        };

        let mut state = slot.state();
        if state.session_id != session_id || state.status != ConnectionStatus::Connecting {
            // superseded by shutdown
            if let Ok(session) = result {
                self.close_detached(Arc::new(session));
            }
            self.ensure_running()?;
            return Err(Error::transport("connection attempt superseded"));
        }

        match result {
            Ok(session) => {
                let session = Arc::new(session);
                state.status = ConnectionStatus::Connected;
                state.session = Some(session.clone());
                state.connecting_since = None;
                state.reconnect_attempts = 0;
                state.last_error = None;
                if let Some(interval) = self.config.heartbeat_interval {
                    state.heartbeat_task = Some(self.spawn_heartbeat(slot, session_id, interval));
                }
                info!(device = %id, "Connected to {}", slot.config.display_name());
                Ok(session)
            }
            Err(e) => {
                state.status = ConnectionStatus::Disconnected;
                state.connecting_since = None;
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn disconnect_locked(&self, slot: &DeviceSlot) {
        let session = {
            let mut state = slot.state();
            state.manual_disconnect = true;
            state.cancel_reconnect();
            state.mark_disconnected()
        };
        if let Some(session) = session {
            info!(device = %slot.id(), "Disconnected");
            self.close_session(session).await;
        }
    }

    /// Drop the session after a failed or timed-out operation. No reconnect
    /// is scheduled: the caller retries synchronously.
    fn drop_link(&self, slot: &DeviceSlot, reason: &str) {
        let session = {
            let mut state = slot.state();
            state.last_error = Some(reason.to_string());
            state.mark_disconnected()
        };
        if let Some(session) = session {
            debug!(device = %slot.id(), "Dropping session: {}", reason);
            self.close_detached(session);
        }
    }

    /// The session reported a close or error, or the heartbeat failed.
    fn link_lost(self: &Arc<Self>, slot: &Arc<DeviceSlot>, session_id: u64, reason: &str) {
        let session = {
            let mut state = slot.state();
            if !state.is_live(session_id) {
                trace!(device = %slot.id(), "Ignoring stale link event: {}", reason);
                return;
            }
            warn!(device = %slot.id(), "Connection lost: {}", reason);
            state.last_error = Some(reason.to_string());
            let session = state.mark_disconnected();
            self.schedule_reconnect(slot, &mut state);
            session
        };
        if let Some(session) = session {
            self.close_detached(session);
        }
    }

    async fn close_session(&self, session: Arc<AnyLocalSession>) {
        if timeout(self.config.close_timeout, session.close()).await.is_err() {
            warn!(
                "Session close timeout ({}ms)",
                millis(self.config.close_timeout)
            );
        }
    }

    fn close_detached(&self, session: Arc<AnyLocalSession>) {
        let grace = self.config.close_timeout;
        tokio::spawn(async move {
            let _ = timeout(grace, session.close()).await;
        });
    }

    // ------------------------------------------------------------------
    // Background reconnect
    // ------------------------------------------------------------------

    fn schedule_reconnect_if_idle(self: &Arc<Self>, slot: &Arc<DeviceSlot>) {
        let mut state = slot.state();
        if state.status == ConnectionStatus::Disconnected {
            self.schedule_reconnect(slot, &mut state);
        }
    }

    /// Arm the reconnect timer unless one is pending, the device was
    /// disconnected on purpose, the attempt budget is spent or we are
    /// shutting down.
    fn schedule_reconnect(
        self: &Arc<Self>,
        slot: &Arc<DeviceSlot>,
        state: &mut crate::device::DeviceConnection,
    ) {
        if self.shutdown.is_cancelled() || state.manual_disconnect || state.reconnect_task.is_some()
        {
            return;
        }

        let backoff = &self.config.reconnect;
        if backoff.exhausted(state.reconnect_attempts) {
            warn!(
                device = %slot.id(),
                attempts = state.reconnect_attempts,
                "Giving up automatic reconnection until the next command"
            );
            return;
        }

        let delay = backoff.delay(state.reconnect_attempts);
        state.reconnect_attempts += 1;
        state.last_reconnect_delay = Some(delay);
        state.reconnect_epoch += 1;
        let epoch = state.reconnect_epoch;

        info!(
            device = %slot.id(),
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

    async fn reconnect(self: &Arc<Self>, slot: &Arc<DeviceSlot>, epoch: u64) {
        let _op = slot.op_lock.lock().await;
        {
            let mut state = slot.state();
            if state.reconnect_epoch != epoch {
                return;
            }
            // our own handle; dropping it detaches without aborting
            state.reconnect_task = None;
            if self.shutdown.is_cancelled()
                || state.manual_disconnect
                || state.status != ConnectionStatus::Disconnected
            {
                return;
            }
        }

        match self.connect_once(slot).await {
            Ok(_) => info!(device = %slot.id(), "Reconnected"),
            Err(e) => {
                warn!(device = %slot.id(), "Reconnect failed: {}", e);
                let mut state = slot.state();
                self.schedule_reconnect(slot, &mut state);
            }
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    fn spawn_heartbeat(
        self: &Arc<Self>,
        slot: &Arc<DeviceSlot>,
        session_id: u64,
        interval: Duration,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let slot = slot.clone();
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
                if !inner.heartbeat(&slot, session_id).await {
                    break;
                }
            }
        })
    }

    /// One heartbeat read. Returns whether the heartbeat should continue.
    async fn heartbeat(self: &Arc<Self>, slot: &Arc<DeviceSlot>, session_id: u64) -> bool {
        let Ok(_op) = slot.op_lock.try_lock() else {
            trace!(device = %slot.id(), "Heartbeat skipped, operation in flight");
            return true;
        };

        let session = {
            let state = slot.state();
            if !state.is_live(session_id) {
                return false;
            }
            state.session.clone()
        };
        let Some(session) = session else {
            return false;
        };

        match timeout(self.config.status_timeout, session.status()).await {
            Ok(Ok(dps)) => {
                trace!(device = %slot.id(), "Heartbeat ok");
                if is_corrupted(&dps) {
                    warn!(device = %slot.id(), "Discarding corrupted heartbeat payload");
                } else {
                    self.apply_update(slot, session_id, &dps).await;
                }
                true
            }
            Ok(Err(e)) => {
                self.link_lost(slot, session_id, &format!("heartbeat failed: {e}"));
                false
            }
            Err(_) => {
                self.link_lost(slot, session_id, "heartbeat timed out");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands and status
    // ------------------------------------------------------------------

    async fn send_command(
        self: &Arc<Self>,
        id: &DeviceId,
        field: &str,
        value: &Value,
        disconnect_after: bool,
    ) -> Result<()> {
        self.ensure_running()?;
        let slot = self.slot(id)?;
        let _op = slot.op_lock.lock().await;
        slot.state().manual_disconnect = false;

        let attempts = self.config.command_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.write_once(&slot, field, value).await {
                Ok(()) => {
                    trace!(device = %id, field, attempt, "Command applied");
                    self.after_write(&slot, field, value).await;
                    if disconnect_after {
                        self.disconnect_locked(&slot).await;
                    }
                    return Ok(());
                }
                Err(Error::ShuttingDown) => return Err(Error::ShuttingDown),
                Err(e) if !e.is_transient() => {
                    error!(device = %id, field, "Command rejected: {}", e);
                    return Err(Error::command_failed(id.as_str(), attempt, e));
                }
                Err(e) => {
                    warn!(device = %id, field, attempt, "Command attempt failed: {}", e);
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }
        }

        self.schedule_reconnect_if_idle(&slot);
        let cause = last_error.unwrap_or_else(|| Error::transport("no attempt made"));
        error!(device = %id, field, attempts, "Command failed: {}", cause);
        Err(Error::command_failed(id.as_str(), attempts, cause))
    }

    async fn write_once(self: &Arc<Self>, slot: &Arc<DeviceSlot>, field: &str, value: &Value) -> Result<()> {
        let session = self.ensure_connected(slot).await?;
        match timeout(self.config.command_timeout, session.set(field, value)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                if e.is_transient() {
                    self.drop_link(slot, &format!("write failed: {e}"));
                }
                Err(e)
            }
            Err(_) => {
                self.drop_link(slot, "write timed out");
                Err(Error::timeout(millis(self.config.command_timeout)))
            }
        }
    }

    async fn after_write(&self, slot: &DeviceSlot, field: &str, value: &Value) {
        if slot.kind == DeviceKind::Feeder
            && field == feeder::dp::MEAL_PLAN
            && let Some(encoded) = value.as_str()
        {
            self.meal_plans.set(slot.id(), encoded).await;
        }
    }

    async fn get_status(self: &Arc<Self>, id: &DeviceId) -> Result<DpsMap> {
        self.ensure_running()?;
        let slot = self.slot(id)?;
        let _op = slot.op_lock.lock().await;

        let attempts = self.config.status_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let result = match timeout(self.config.status_timeout, self.status_once(&slot)).await {
                Ok(result) => result,
                Err(_) => {
                    self.drop_link(&slot, "status timed out");
                    Err(Error::timeout(millis(self.config.status_timeout)))
                }
            };

            match result {
                Ok(dps) => return Ok(dps),
                Err(Error::ShuttingDown) => return Err(Error::ShuttingDown),
                Err(e) if !e.is_transient() => {
                    return Err(Error::status_timeout(id.as_str(), attempt, e));
                }
                Err(e) => {
                    debug!(device = %id, attempt, "Status attempt failed: {}", e);
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }
        }

        self.schedule_reconnect_if_idle(&slot);
        let cause = last_error.unwrap_or_else(|| Error::transport("no attempt made"));
        warn!(device = %id, attempts, "Status request failed: {}", cause);
        Err(Error::status_timeout(id.as_str(), attempts, cause))
    }

    async fn status_once(self: &Arc<Self>, slot: &Arc<DeviceSlot>) -> Result<DpsMap> {
        let session = self.ensure_connected(slot).await?;
        let session_id = slot.state().session_id;

        match session.status().await {
            Ok(dps) if is_corrupted(&dps) => {
                warn!(device = %slot.id(), "Discarding corrupted status payload, check the local key");
                Err(Error::corrupted(slot.id().as_str()))
            }
            Ok(dps) => {
                self.apply_update(slot, session_id, &dps).await;
                Ok(dps)
            }
            Err(e) => {
                if e.is_transient() {
                    self.drop_link(slot, &format!("status failed: {e}"));
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound data
    // ------------------------------------------------------------------

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        let Some(slot) = self.devices.get(&event.device).cloned() else {
            trace!(device = %event.device, "Event for unknown device");
            return;
        };

        match event.kind {
            EventKind::Data(dps) => self.handle_push(&slot, event.session, dps).await,
            EventKind::Frame(raw) => {
                if is_corrupted_bytes(&raw) {
                    warn!(
                        device = %slot.id(),
                        bytes = raw.len(),
                        "Discarding corrupted frame, check the local key"
                    );
                    return;
                }
                match parse_frame(&raw) {
                    Some(dps) => self.handle_push(&slot, event.session, dps).await,
                    None => debug!(device = %slot.id(), "Ignoring undecodable frame"),
                }
            }
            EventKind::Closed => self.link_lost(&slot, event.session, "closed by device"),
            EventKind::Error(message) => self.link_lost(&slot, event.session, &message),
        }
    }

    async fn handle_push(&self, slot: &DeviceSlot, session_id: u64, dps: DpsMap) {
        if is_corrupted(&dps) {
            warn!(device = %slot.id(), "Discarding corrupted payload, check the local key");
            return;
        }
        trace!(device = %slot.id(), fields = dps.len(), "Data pushed");
        self.apply_update(slot, session_id, &dps).await;
    }

    /// Merge clean data points into the cache of a live session.
    async fn apply_update(&self, slot: &DeviceSlot, session_id: u64, dps: &DpsMap) {
        let meal_plan = {
            let mut state = slot.state();
            if !state.is_live(session_id) {
                trace!(device = %slot.id(), "Ignoring data from stale session");
                return;
            }
            for (key, value) in dps {
                state.last_data.insert(key.clone(), value.clone());
            }
            state.last_status = Some(translate(slot.kind, &state.last_data));

            (slot.kind == DeviceKind::Feeder)
                .then(|| dps.get(feeder::dp::MEAL_PLAN).and_then(Value::as_str))
                .flatten()
                .map(str::to_string)
        };

        if let Some(encoded) = meal_plan
            && self.meal_plans.set(slot.id(), encoded).await
        {
            debug!(device = %slot.id(), "Meal plan cache updated from device data");
        }
    }
}

/// Decode a frame body: either `{"dps": {...}}` or a bare data point object.
fn parse_frame(raw: &[u8]) -> Option<DpsMap> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    let object = match value {
        Value::Object(mut map) => match map.remove("dps") {
            Some(Value::Object(dps)) => dps,
            Some(_) => return None,
            None => map,
        },
        _ => return None,
    };
    Some(object.into_iter().collect())
}

async fn run_event_pump(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
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
        inner.handle_event(event).await;
    }
    debug!("Event pump stopped");
}
