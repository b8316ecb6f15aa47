// Device session.
//
// Owns the connection lifecycle for one Smart Paci: connect, feature
// discovery, sensor/control notification dispatch, reconnect on unexpected
// link drops, and the post-reconnect firmware confirm step. All device
// events are republished on a typed broadcast channel.
//
// Per-connection tasks (notification dispatch, watchdog, reconnect loop)
// are scoped to a generation counter: every task captures the generation of
// the connection that spawned it and becomes a no-op once a newer connect
// or a disconnect bumps the counter, so a slow in-flight callback from a
// stale connection can never mutate fresh state.

use crate::ble::{
    CHARACTERISTIC_BATTERY_LEVEL_UUID, CHARACTERISTIC_BITE_UUID, CHARACTERISTIC_CONTROL_UUID,
    CHARACTERISTIC_FORCE_UUID, CHARACTERISTIC_TOUCH_UUID,
};
use crate::control::ControlChannel;
use crate::discovery;
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, Feature, FeatureSet};
use crate::mcumgr::{ImageManagement, McuMgrEvent};
use crate::transport::{DeviceLink, NotificationStream};
use crate::version::FirmwareVersion;
use crate::wire::{CalibrateTarget, ControlRequest, ControlResponse};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};

/// Pause between reconnect attempts while the link stays unreachable.
const RECONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Poll interval of the link watchdog.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

/// Retry interval for the post-connect image-state query.
const IMAGE_STATE_RETRY_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Types
// ============================================================================

/// Sensor inputs that can be calibrated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputType {
    Bite,
    Suck,
}

/// Calibration endpoints for a sensor input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationType {
    Min,
    Max,
}

/// Session lifecycle state. The `Connected` variant owns the per-connection
/// handles so "is there a control channel" and "are we connected" cannot
/// disagree.
enum SessionState {
    Disconnected,
    Connecting,
    Connected { control: Arc<ControlChannel> },
    Reconnecting,
}

/// Observable session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStateKind {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl SessionState {
    fn kind(&self) -> SessionStateKind {
        match self {
            SessionState::Disconnected => SessionStateKind::Disconnected,
            SessionState::Connecting => SessionStateKind::Connecting,
            SessionState::Connected { .. } => SessionStateKind::Connected,
            SessionState::Reconnecting => SessionStateKind::Reconnecting,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

struct SessionInner {
    link: Mutex<Option<Arc<dyn DeviceLink>>>,
    state: Mutex<SessionState>,
    features: Mutex<FeatureSet>,
    events: broadcast::Sender<DeviceEvent>,
    /// Bumped on every connect attempt and every disconnect; tasks holding
    /// an older generation are stale.
    generation: AtomicU64,
    /// Level-triggered: set on successful link connect, cleared only by an
    /// explicit `disconnect()`.
    should_reconnect: AtomicBool,
    name: Mutex<Option<String>>,
    /// One in-flight/memoized version exchange per connection.
    firmware_version: Mutex<Arc<OnceCell<FirmwareVersion>>>,
    image_manager: Arc<dyn ImageManagement>,
}

/// A session against one Smart Paci peripheral.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session with no peripheral bound. `connect()` fails with
    /// `NoDeviceSelected` until `bind()` is called.
    pub fn new(image_manager: Arc<dyn ImageManagement>) -> Self {
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(SessionInner {
            link: Mutex::new(None),
            state: Mutex::new(SessionState::Disconnected),
            features: Mutex::new(FeatureSet::empty()),
            events,
            generation: AtomicU64::new(0),
            should_reconnect: AtomicBool::new(false),
            name: Mutex::new(None),
            firmware_version: Mutex::new(Arc::new(OnceCell::new())),
            image_manager,
        });
        SessionInner::spawn_image_event_handler(inner.clone());
        Self { inner }
    }

    /// Create a session bound to a peripheral.
    pub fn with_link(link: Arc<dyn DeviceLink>, image_manager: Arc<dyn ImageManagement>) -> Self {
        let session = Self::new(image_manager);
        session.bind(link);
        session
    }

    /// Bind (or replace) the peripheral this session drives.
    pub fn bind(&self, link: Arc<dyn DeviceLink>) {
        *self.inner.link.lock().unwrap() = Some(link);
    }

    /// Subscribe to the device event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SessionStateKind {
        self.inner.state.lock().unwrap().kind()
    }

    /// Capability set of the current connection; empty when disconnected.
    pub fn features(&self) -> FeatureSet {
        *self.inner.features.lock().unwrap()
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features().contains(feature)
    }

    pub fn image_manager(&self) -> Arc<dyn ImageManagement> {
        self.inner.image_manager.clone()
    }

    pub(crate) fn send_event(&self, event: DeviceEvent) {
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn link(&self) -> Result<Arc<dyn DeviceLink>> {
        self.inner
            .link
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NoDeviceSelected)
    }

    fn control(&self) -> Result<Arc<ControlChannel>> {
        match &*self.inner.state.lock().unwrap() {
            SessionState::Connected { control } => Ok(control.clone()),
            _ => Err(Error::ConnectionLost("session is not connected".to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect to the bound peripheral and run the full setup sequence:
    /// link connect, feature discovery, subscription wiring.
    ///
    /// A link-class failure with the link not yet up triggers one automatic
    /// reconnect cycle instead of surfacing; anything else propagates and
    /// aborts the attempt.
    pub async fn connect(&self) -> Result<()> {
        let link = self.link()?;
        info!("[session] Connecting");
        self.inner.set_state(SessionState::Connecting);

        let err = match SessionInner::run_connect(self.inner.clone(), link.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if err.is_link_error() && !link.is_connected().await {
            warn!("[session] Connect failed on the link ({err}), retrying once");
            self.inner.set_state(SessionState::Reconnecting);
            self.send_event(DeviceEvent::Reconnecting);
            return match SessionInner::run_connect(self.inner.clone(), link).await {
                Ok(()) => Ok(()),
                Err(retry_err) => {
                    self.inner.set_state(SessionState::Disconnected);
                    Err(retry_err)
                }
            };
        }

        self.inner.set_state(SessionState::Disconnected);
        Err(err)
    }

    /// Tear the session down: clears the reconnect flag, invalidates all
    /// per-connection tasks, resets the capability set, detaches the
    /// firmware-management transport, closes the link and emits
    /// `Disconnected`.
    pub async fn disconnect(&self) -> Result<()> {
        debug!("[session] Disconnecting");
        self.inner.should_reconnect.store(false, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        *self.inner.features.lock().unwrap() = FeatureSet::empty();
        let previous = std::mem::replace(
            &mut *self.inner.state.lock().unwrap(),
            SessionState::Disconnected,
        );
        if let SessionState::Connected { control } = previous {
            control.fail_pending("explicit disconnect");
        }

        self.inner.image_manager.detach().await;

        let link = self.inner.link.lock().unwrap().clone();
        if let Some(link) = link {
            // Best-effort: the peripheral may already be gone.
            let _ = link.unsubscribe(CHARACTERISTIC_CONTROL_UUID).await;
            let _ = link.disconnect().await;
        }

        self.send_event(DeviceEvent::Disconnected);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Name
    // ------------------------------------------------------------------

    /// Cached device name, or block until the next name announcement.
    pub async fn get_name(&self) -> Result<String> {
        // Subscribe before checking the cache so an announcement between
        // the two cannot be missed.
        let mut events = self.inner.events.subscribe();
        if let Some(name) = self.inner.name.lock().unwrap().clone() {
            return Ok(name);
        }
        loop {
            match events.recv().await {
                Ok(DeviceEvent::NameChanged { name }) => return Ok(name),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::ConnectionLost("session dropped".to_string()));
                }
            }
        }
    }

    /// Write a new device name.
    ///
    /// The transport layer is known to not reliably reflect device-name
    /// writes back on read, so the local cache is rewritten proactively and
    /// `NameChanged` fires as soon as the write succeeds.
    pub async fn set_name(&self, name: &str) -> Result<()> {
        let control = self.control()?;
        control
            .send(&ControlRequest::Setting {
                name: name.to_string(),
            })
            .await?;

        *self.inner.name.lock().unwrap() = Some(name.to_string());
        self.send_event(DeviceEvent::NameChanged {
            name: name.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Firmware version
    // ------------------------------------------------------------------

    /// Fetch (or return the memoized) firmware version of this connection.
    /// Concurrent callers share a single control-channel exchange.
    async fn firmware_version(&self) -> Result<FirmwareVersion> {
        let cell = self.inner.firmware_version.lock().unwrap().clone();
        cell.get_or_try_init(|| async {
            let control = self.control()?;
            let response = control.send(&ControlRequest::FirmwareVersion).await?;
            match response {
                ControlResponse::FirmwareVersion(v) => Ok(firmware_version_from_wire(v)),
                other => Err(Error::UnexpectedResponse(format!(
                    "expected a firmware version, got {:?}",
                    other.kind()
                ))),
            }
        })
        .await
        .map(FirmwareVersion::clone)
    }

    pub async fn get_firmware_version(&self) -> Result<String> {
        Ok(self.firmware_version().await?.to_string())
    }

    pub async fn get_firmware_date(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.firmware_version().await?.timestamp)
    }

    pub async fn get_firmware_commit(&self) -> Result<String> {
        Ok(self.firmware_version().await?.commit_hex())
    }

    pub async fn get_firmware_hash(&self) -> Result<String> {
        Ok(self.firmware_version().await?.hash_hex())
    }

    // ------------------------------------------------------------------
    // Calibration
    // ------------------------------------------------------------------

    /// Calibrate a sensor input against its current reading.
    pub async fn calibrate_input(
        &self,
        input: InputType,
        calibration: CalibrationType,
    ) -> Result<()> {
        let target = match (input, calibration) {
            (InputType::Bite, CalibrationType::Min) => CalibrateTarget::BiteMin,
            (InputType::Bite, CalibrationType::Max) => CalibrateTarget::BiteMax,
            (InputType::Suck, CalibrationType::Min) => CalibrateTarget::SuckMin,
            (InputType::Suck, CalibrationType::Max) => CalibrateTarget::SuckMax,
        };
        self.control()?
            .send(&ControlRequest::CalibrateSensor(target))
            .await?;
        Ok(())
    }
}

// ============================================================================
// Connection internals
// ============================================================================

impl SessionInner {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Update the cached name, emitting `NameChanged` when it differs.
    fn update_name(&self, name: &str) {
        let changed = {
            let mut cached = self.name.lock().unwrap();
            if cached.as_deref() != Some(name) {
                *cached = Some(name.to_string());
                true
            } else {
                false
            }
        };
        if changed {
            let _ = self.events.send(DeviceEvent::NameChanged {
                name: name.to_string(),
            });
        }
    }

    /// The full connect sequence against an already-bound link.
    ///
    /// Returns an explicitly boxed `Send` future rather than an opaque
    /// `async fn` type to break the Send auto-trait cycle: `run_connect`
    /// spawns `dispatch_notifications`, which awaits `handle_link_drop`,
    /// which awaits `run_connect`. The boxed trait object severs the
    /// self-referential bound without changing behavior.
    fn run_connect(
        inner: Arc<SessionInner>,
        link: Arc<dyn DeviceLink>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
        // A fresh generation invalidates every task of the previous
        // connection before its stream is even closed.
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *inner.firmware_version.lock().unwrap() = Arc::new(OnceCell::new());

        link.connect().await?;
        inner.should_reconnect.store(true, Ordering::SeqCst);
        link.discover_services().await?;

        if let Some(name) = link.device_name().await {
            inner.update_name(&name);
        }

        let features = discovery::discover(&link, &inner.events).await?;

        let control = Arc::new(ControlChannel::new(
            link.clone(),
            CHARACTERISTIC_CONTROL_UUID,
        ));
        let stream = link.notifications().await?;
        tokio::spawn(SessionInner::dispatch_notifications(
            inner.clone(),
            link.clone(),
            control.clone(),
            stream,
            generation,
        ));

        if features.contains(Feature::Firmware) {
            let transport = link.smp_transport().await?;
            inner.image_manager.attach(transport).await;
            tokio::spawn(SessionInner::initial_image_state_query(
                inner.clone(),
                link.clone(),
                generation,
            ));
        }

        tokio::spawn(SessionInner::watchdog(
            inner.clone(),
            link.clone(),
            generation,
        ));

        *inner.features.lock().unwrap() = features;
        inner.set_state(SessionState::Connected { control });

        // Capability bits are final before `Connected` fires.
        let _ = inner.events.send(DeviceEvent::FeaturesUpdated { features });
        let _ = inner.events.send(DeviceEvent::Connected);
        info!("[session] Connected (features: {features})");
        Ok(())
        })
    }

    /// Decode and dispatch notifications for one connection.
    async fn dispatch_notifications(
        inner: Arc<SessionInner>,
        link: Arc<dyn DeviceLink>,
        control: Arc<ControlChannel>,
        mut stream: NotificationStream,
        generation: u64,
    ) {
        while let Some(notification) = stream.next().await {
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            let value = notification.value;
            match notification.characteristic {
                u if u == CHARACTERISTIC_BITE_UUID => {
                    let _ = inner.events.send(DeviceEvent::Bite {
                        value: value.first().copied().unwrap_or(0),
                    });
                }
                u if u == CHARACTERISTIC_FORCE_UUID => {
                    let _ = inner.events.send(DeviceEvent::Suck { values: value });
                }
                u if u == CHARACTERISTIC_TOUCH_UUID => {
                    // One byte, read as a presence bitmap of pads 0-7.
                    let bitmap = value.first().copied().unwrap_or(0);
                    let values: Vec<u8> = (0u8..8).filter(|i| bitmap & (1 << i) != 0).collect();
                    let _ = inner.events.send(DeviceEvent::Touch { values });
                }
                u if u == CHARACTERISTIC_BATTERY_LEVEL_UUID => {
                    let _ = inner.events.send(DeviceEvent::Battery {
                        value: value.first().copied().unwrap_or(0),
                    });
                }
                u if u == CHARACTERISTIC_CONTROL_UUID => {
                    if let Some(response) = control.handle_notification(&value) {
                        if let ControlResponse::FirmwareVersion(v) = response {
                            let _ = inner.events.send(DeviceEvent::FirmwareVersion {
                                version: firmware_version_from_wire(v),
                            });
                        }
                    }
                }
                other => debug!("[session] Notification from unknown characteristic {other}"),
            }
        }

        // Stream end means the platform closed the connection.
        debug!("[session] Notification stream ended");
        SessionInner::handle_link_drop(inner, link, Some(control), generation).await;
    }

    /// Poll the link, catching drops the notification stream misses.
    async fn watchdog(inner: Arc<SessionInner>, link: Arc<dyn DeviceLink>, generation: u64) {
        loop {
            tokio::time::sleep(WATCHDOG_INTERVAL).await;
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if !link.is_connected().await {
                debug!("[session] Watchdog: link no longer connected");
                SessionInner::handle_link_drop(inner, link, None, generation).await;
                return;
            }
        }
    }

    /// React to an unexpected link drop: exactly one observer of each
    /// connection generation wins the compare-exchange and runs this.
    async fn handle_link_drop(
        inner: Arc<SessionInner>,
        link: Arc<dyn DeviceLink>,
        control: Option<Arc<ControlChannel>>,
        generation: u64,
    ) {
        if inner
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // A newer connect or an explicit disconnect got here first.
            return;
        }

        let state_control = match std::mem::replace(
            &mut *inner.state.lock().unwrap(),
            SessionState::Disconnected,
        ) {
            SessionState::Connected { control } => Some(control),
            _ => None,
        };
        if let Some(control) = control.or(state_control) {
            control.fail_pending("link dropped");
        }
        *inner.features.lock().unwrap() = FeatureSet::empty();
        inner.image_manager.detach().await;

        if !inner.should_reconnect.load(Ordering::SeqCst) {
            info!("[session] Link dropped");
            let _ = inner.events.send(DeviceEvent::Disconnected);
            return;
        }

        info!("[session] Link dropped, reconnecting");
        loop {
            inner.set_state(SessionState::Reconnecting);
            let _ = inner.events.send(DeviceEvent::Reconnecting);

            match SessionInner::run_connect(inner.clone(), link.clone()).await {
                Ok(()) => return,
                Err(err) if err.is_link_error() && inner.should_reconnect.load(Ordering::SeqCst) => {
                    warn!("[session] Reconnect attempt failed: {err}");
                    tokio::time::sleep(RECONNECT_RETRY_DELAY).await;
                }
                Err(err) => {
                    warn!("[session] Giving up on reconnect: {err}");
                    inner.set_state(SessionState::Disconnected);
                    let _ = inner.events.send(DeviceEvent::Disconnected);
                    return;
                }
            }
        }
    }

    /// Ask for the image slot states once the connection is up, retrying
    /// while the device is still settling. The State response drives the
    /// confirm step in `handle_image_event`.
    async fn initial_image_state_query(
        inner: Arc<SessionInner>,
        link: Arc<dyn DeviceLink>,
        generation: u64,
    ) {
        loop {
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match inner.image_manager.query_image_state().await {
                Ok(()) => return,
                Err(err) => {
                    debug!("[session] Image state query failed ({err}), retrying");
                    tokio::time::sleep(IMAGE_STATE_RETRY_DELAY).await;
                    if !link.is_connected().await {
                        return;
                    }
                }
            }
        }
    }

    /// Session-lifetime task: forward image-management events to the device
    /// event surface and run the confirm half of the dual-bank protocol.
    fn spawn_image_event_handler(inner: Arc<SessionInner>) {
        let mut events = inner.image_manager.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => SessionInner::handle_image_event(&inner, event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[session] Image event handler lagged, skipped {skipped}");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    async fn handle_image_event(inner: &Arc<SessionInner>, event: McuMgrEvent) {
        match event {
            McuMgrEvent::UploadProgress { percent } => {
                let _ = inner
                    .events
                    .send(DeviceEvent::FirmwareUploadProgress { percent });
            }
            McuMgrEvent::UploadComplete => {
                let _ = inner.events.send(DeviceEvent::FirmwareUploadComplete);
            }
            McuMgrEvent::State { slots } => {
                // If the running image was just updated, a successful
                // connection is good enough proof to mark it as a success;
                // without the confirm the bootloader rolls back on the next
                // reset.
                if let Some(running) = slots.first() {
                    if running.active && !running.confirmed {
                        info!(
                            "[session] Confirming the active firmware {} ({}) as a success",
                            running.version,
                            running.hash_hex()
                        );
                        if let Err(err) = inner.image_manager.confirm_image(&running.hash).await {
                            warn!("[session] Failed to confirm active image: {err}");
                        }
                    }
                }
            }
            McuMgrEvent::Reset => {}
        }
    }
}

fn firmware_version_from_wire(v: crate::wire::Version) -> FirmwareVersion {
    FirmwareVersion {
        major: v.major as u16,
        minor: v.minor as u16,
        revision: v.revision as u16,
        build: v.build,
        commit: v.commit,
        timestamp: if v.timestamp == 0 {
            None
        } else {
            DateTime::from_timestamp(v.timestamp, 0)
        },
        hash: v.hash,
    }
}
