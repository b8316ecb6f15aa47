// Test fakes.
//
// In-process stand-ins for the two external boundaries: `FakeLink` scripts
// a peripheral behind the `DeviceLink` trait (services, characteristics,
// injected notifications, busy subscriptions), `FakeImageManager` scripts
// the image-management collaborator at the slot level. Only compiled for
// tests.

use crate::error::{Error, Result};
use crate::events::DeviceEvent;
use crate::image;
use crate::mcumgr::{ImageManagement, ImageSlot, McuMgrEvent};
use crate::transport::{DeviceLink, Notification, NotificationStream};
use async_trait::async_trait;
use mcumgr_smp::transport::error::Error as SmpError;
use mcumgr_smp::transport::smp::SmpTransportAsync;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

const WAIT_DEADLINE: Duration = Duration::from_secs(2);
const WAIT_POLL: Duration = Duration::from_millis(10);

// ============================================================================
// FakeLink
// ============================================================================

#[derive(Default)]
struct LinkState {
    services: HashSet<Uuid>,
    characteristics: HashSet<Uuid>,
    read_values: HashMap<Uuid, Vec<u8>>,
    busy_subscribes: HashMap<Uuid, u32>,
    subscribe_failures: HashMap<Uuid, Error>,
    next_write_failure: Option<Error>,
    writes: HashMap<Uuid, Vec<Vec<u8>>>,
    subscribe_attempts: HashMap<Uuid, usize>,
    unsubscribes: HashMap<Uuid, usize>,
    connected: bool,
    connect_count: usize,
    device_name: Option<String>,
    notify_tx: Option<mpsc::UnboundedSender<Notification>>,
}

/// Scriptable `DeviceLink`.
pub struct FakeLink {
    state: Mutex<LinkState>,
}

impl FakeLink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LinkState::default()),
        }
    }

    pub fn with_service(self, service: Uuid) -> Self {
        self.state.lock().unwrap().services.insert(service);
        self
    }

    pub fn with_characteristic(self, characteristic: Uuid) -> Self {
        self.state
            .lock()
            .unwrap()
            .characteristics
            .insert(characteristic);
        self
    }

    pub fn with_read_value(self, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.state
            .lock()
            .unwrap()
            .read_values
            .insert(characteristic, value);
        self
    }

    /// Reject the next `count` subscribe calls for `characteristic` with
    /// `DeviceBusy`.
    pub fn with_busy_subscribes(self, characteristic: Uuid, count: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .busy_subscribes
            .insert(characteristic, count);
        self
    }

    /// Fail the next subscribe for `characteristic` with `err`.
    pub fn fail_subscribe(&self, characteristic: Uuid, err: Error) {
        self.state
            .lock()
            .unwrap()
            .subscribe_failures
            .insert(characteristic, err);
    }

    /// Fail the next write (any characteristic) with `err`.
    pub fn fail_next_write(&self, err: Error) {
        self.state.lock().unwrap().next_write_failure = Some(err);
    }

    /// Push a notification into the current notification stream.
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        let tx = self.state.lock().unwrap().notify_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(Notification {
                characteristic,
                value,
            });
        }
    }

    /// End the current notification stream, as a platform disconnect does.
    pub fn close_notifications(&self) {
        self.state.lock().unwrap().notify_tx = None;
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().unwrap().connected = connected;
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connect_count
    }

    pub fn subscribe_attempts(&self, characteristic: Uuid) -> usize {
        *self
            .state
            .lock()
            .unwrap()
            .subscribe_attempts
            .get(&characteristic)
            .unwrap_or(&0)
    }

    pub fn unsubscribe_count(&self, characteristic: Uuid) -> usize {
        *self
            .state
            .lock()
            .unwrap()
            .unsubscribes
            .get(&characteristic)
            .unwrap_or(&0)
    }

    pub fn write_count(&self, characteristic: Uuid) -> usize {
        self.state
            .lock()
            .unwrap()
            .writes
            .get(&characteristic)
            .map(|w| w.len())
            .unwrap_or(0)
    }

    /// Block until `characteristic` has seen at least `count` writes.
    pub async fn wait_for_write(&self, characteristic: Uuid, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
        while self.write_count(characteristic) < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for write #{count} to {characteristic}"
            );
            tokio::time::sleep(WAIT_POLL).await;
        }
    }
}

#[async_trait]
impl DeviceLink for FakeLink {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.connected = true;
        state.connect_count += 1;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn discover_services(&self) -> Result<()> {
        Ok(())
    }

    async fn device_name(&self) -> Option<String> {
        self.state.lock().unwrap().device_name.clone()
    }

    fn has_service(&self, service: Uuid) -> bool {
        self.state.lock().unwrap().services.contains(&service)
    }

    fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.state
            .lock()
            .unwrap()
            .characteristics
            .contains(&characteristic)
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .read_values
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no read value for {characteristic}")))
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8], _with_response: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.next_write_failure.take() {
            return Err(err);
        }
        if !state.characteristics.contains(&characteristic) {
            return Err(Error::NotFound(format!(
                "characteristic {characteristic} not found"
            )));
        }
        state
            .writes
            .entry(characteristic)
            .or_default()
            .push(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.subscribe_attempts.entry(characteristic).or_default() += 1;
        if let Some(err) = state.subscribe_failures.remove(&characteristic) {
            return Err(err);
        }
        if let Some(busy) = state.busy_subscribes.get_mut(&characteristic) {
            if *busy > 0 {
                *busy -= 1;
                return Err(Error::DeviceBusy("GATT operation in progress".to_string()));
            }
        }
        if !state.characteristics.contains(&characteristic) {
            return Err(Error::NotFound(format!(
                "characteristic {characteristic} not found"
            )));
        }
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.unsubscribes.entry(characteristic).or_default() += 1;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().notify_tx = Some(tx);
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async {
            rx.recv().await.map(|n| (n, rx))
        })))
    }

    async fn smp_transport(&self) -> Result<Box<dyn SmpTransportAsync + Send>> {
        Ok(Box::new(FakeSmpTransport::with_responses(vec![])))
    }
}

/// A link with the full Smart Paci sensor complement and no battery.
pub fn paci_fake_link() -> Arc<FakeLink> {
    Arc::new(
        FakeLink::new()
            .with_service(crate::ble::SERVICE_PACI_UUID)
            .with_characteristic(crate::ble::CHARACTERISTIC_CONTROL_UUID)
            .with_characteristic(crate::ble::CHARACTERISTIC_BITE_UUID)
            .with_characteristic(crate::ble::CHARACTERISTIC_FORCE_UUID)
            .with_characteristic(crate::ble::CHARACTERISTIC_TOUCH_UUID),
    )
}

// ============================================================================
// FakeSmpTransport
// ============================================================================

/// SMP transport with scripted responses; `receive` fails once they run out.
pub struct FakeSmpTransport {
    pub sent: Vec<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
}

impl FakeSmpTransport {
    pub fn with_responses(responses: Vec<Vec<u8>>) -> Self {
        Self {
            sent: Vec::new(),
            responses: responses.into(),
        }
    }
}

#[async_trait]
impl SmpTransportAsync for FakeSmpTransport {
    async fn send(&mut self, frame: Vec<u8>) -> std::result::Result<(), SmpError> {
        self.sent.push(frame);
        Ok(())
    }

    async fn receive(&mut self) -> std::result::Result<Vec<u8>, SmpError> {
        match self.responses.pop_front() {
            Some(response) => Ok(response),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "no scripted response",
            )
            .into()),
        }
    }
}

// ============================================================================
// FakeImageManager
// ============================================================================

/// Image-management collaborator scripted at the slot level.
pub struct FakeImageManager {
    events: broadcast::Sender<McuMgrEvent>,
    slots: Mutex<Vec<ImageSlot>>,
    confirmed: Mutex<Vec<Vec<u8>>>,
    tested: Mutex<Vec<Vec<u8>>>,
    uploads: Mutex<Vec<usize>>,
    resets: AtomicUsize,
    queries: AtomicUsize,
}

impl FakeImageManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            slots: Mutex::new(Vec::new()),
            confirmed: Mutex::new(Vec::new()),
            tested: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn set_slots(&self, slots: Vec<ImageSlot>) {
        *self.slots.lock().unwrap() = slots;
    }

    pub fn confirmed_hashes(&self) -> Vec<Vec<u8>> {
        self.confirmed.lock().unwrap().clone()
    }

    pub fn tested_hashes(&self) -> Vec<Vec<u8>> {
        self.tested.lock().unwrap().clone()
    }

    pub fn uploaded_sizes(&self) -> Vec<usize> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub async fn wait_for_confirms(&self, count: usize) {
        wait_until(|| self.confirmed.lock().unwrap().len() >= count, "confirms").await;
    }

    pub async fn wait_for_queries(&self, count: usize) {
        wait_until(|| self.queries.load(Ordering::SeqCst) >= count, "queries").await;
    }

    fn emit_state(&self) {
        let slots = self.slots.lock().unwrap().clone();
        let _ = self.events.send(McuMgrEvent::State { slots });
    }
}

#[async_trait]
impl ImageManagement for FakeImageManager {
    async fn attach(&self, _transport: Box<dyn SmpTransportAsync + Send>) {}

    async fn detach(&self) {}

    async fn query_image_state(&self) -> Result<()> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.emit_state();
        Ok(())
    }

    async fn upload(&self, image: &[u8]) -> Result<()> {
        self.uploads.lock().unwrap().push(image.len());
        let _ = self.events.send(McuMgrEvent::UploadProgress { percent: 50.0 });
        let _ = self.events.send(McuMgrEvent::UploadProgress { percent: 100.0 });
        let _ = self.events.send(McuMgrEvent::UploadComplete);
        Ok(())
    }

    async fn test_image(&self, hash: &[u8]) -> Result<()> {
        self.tested.lock().unwrap().push(hash.to_vec());
        for slot in self.slots.lock().unwrap().iter_mut() {
            if slot.hash == hash {
                slot.pending = true;
            }
        }
        self.emit_state();
        Ok(())
    }

    async fn confirm_image(&self, hash: &[u8]) -> Result<()> {
        self.confirmed.lock().unwrap().push(hash.to_vec());
        for slot in self.slots.lock().unwrap().iter_mut() {
            if slot.hash == hash {
                slot.confirmed = true;
            }
        }
        self.emit_state();
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(McuMgrEvent::Reset);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<McuMgrEvent> {
        self.events.subscribe()
    }
}

pub fn make_slot(
    slot: i32,
    hash: Vec<u8>,
    active: bool,
    confirmed: bool,
    pending: bool,
) -> ImageSlot {
    ImageSlot {
        slot,
        version: "0.2.7".to_string(),
        hash,
        bootable: true,
        pending,
        confirmed,
        active,
        permanent: false,
        image: None,
    }
}

// ============================================================================
// Event helpers
// ============================================================================

/// Receive the next device event, skipping lag, panicking on timeout.
pub async fn recv_event_within(rx: &mut broadcast::Receiver<DeviceEvent>) -> DeviceEvent {
    loop {
        match tokio::time::timeout(WAIT_DEADLINE, rx.recv()).await {
            Ok(Ok(event)) => return event,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for a device event"),
        }
    }
}

/// Drain all currently buffered device events.
pub fn recv_events(mut rx: broadcast::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(WAIT_POLL).await;
    }
}

// ============================================================================
// Image builder
// ============================================================================

/// Assemble a minimal valid MCUboot image: header, payload, then an
/// unprotected TLV area holding the SHA-256 and the given vendor tags.
pub fn build_image(
    version: (u8, u8, u16, u32),
    payload: &[u8],
    vendor_tags: &[(u16, Vec<u8>)],
    corrupt_hash: bool,
) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&image::IMAGE_MAGIC.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes()); // load addr
    data.extend_from_slice(&(image::HEADER_SIZE as u16).to_le_bytes());
    data.extend_from_slice(&0u16.to_le_bytes()); // protected TLV size
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes()); // flags
    data.push(version.0);
    data.push(version.1);
    data.extend_from_slice(&version.2.to_le_bytes());
    data.extend_from_slice(&version.3.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes()); // pad
    assert_eq!(data.len(), image::HEADER_SIZE);
    data.extend_from_slice(payload);

    let mut hash = Sha256::digest(&data).to_vec();
    if corrupt_hash {
        hash[0] ^= 0xFF;
    }

    let mut entries = Vec::new();
    for (tlv_type, value) in std::iter::once(&(image::TLV_SHA256, hash)).chain(vendor_tags.iter()) {
        entries.extend_from_slice(&tlv_type.to_le_bytes());
        entries.extend_from_slice(&(value.len() as u16).to_le_bytes());
        entries.extend_from_slice(value);
    }
    data.extend_from_slice(&image::TLV_INFO_MAGIC.to_le_bytes());
    data.extend_from_slice(&((entries.len() + 4) as u16).to_le_bytes());
    data.extend_from_slice(&entries);

    data
}
