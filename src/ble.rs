// btleplug transport backend.
//
// Shared adapter management, device scanning and the production
// `DeviceLink` implementation for the Smart Paci GATT layout.
//
// Smart Paci service UUID: abbd1ef0-62e8-493b-8549-8cb891483e20
// SMP service UUID:        8d53dc1d-1db7-4cd3-868b-8a527460aa84

use crate::error::{Error, Result};
use crate::transport::{DeviceLink, Notification, NotificationStream};
use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info};
use mcumgr_smp::transport::ble::BleTransport;
use mcumgr_smp::transport::smp::SmpTransportAsync;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// GATT UUIDs
// ============================================================================

/// Build a 128-bit UUID from the same 5-field encoding used by Zephyr's
/// BT_UUID_128_ENCODE macro.
pub const fn uuid_from_fields(a: u32, b: u16, c: u16, d: u16, e: u64) -> Uuid {
    let hi: u64 = (a as u64) << 32 | (b as u64) << 16 | c as u64;
    let lo: u64 = (d as u64) << 48 | e;
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

/// Smart Paci primary service.
pub const SERVICE_PACI_UUID: Uuid =
    uuid_from_fields(0xabbd1ef0, 0x62e8, 0x493b, 0x8549, 0x8cb891483e20);
/// Control request/response endpoint.
pub const CHARACTERISTIC_CONTROL_UUID: Uuid =
    uuid_from_fields(0xabbd1ef1, 0x62e8, 0x493b, 0x8549, 0x8cb891483e20);
/// Suck (force) sensor array.
pub const CHARACTERISTIC_FORCE_UUID: Uuid =
    uuid_from_fields(0xabbd1ef2, 0x62e8, 0x493b, 0x8549, 0x8cb891483e20);
/// Bite sensor.
pub const CHARACTERISTIC_BITE_UUID: Uuid =
    uuid_from_fields(0xabbd1ef3, 0x62e8, 0x493b, 0x8549, 0x8cb891483e20);
/// Touch pads.
pub const CHARACTERISTIC_TOUCH_UUID: Uuid =
    uuid_from_fields(0xabbd1ef4, 0x62e8, 0x493b, 0x8549, 0x8cb891483e20);

/// Bluetooth SIG battery service / battery level.
pub const SERVICE_BATTERY_UUID: Uuid =
    uuid_from_fields(0x0000180f, 0x0000, 0x1000, 0x8000, 0x00805f9b34fb);
pub const CHARACTERISTIC_BATTERY_LEVEL_UUID: Uuid =
    uuid_from_fields(0x00002a19, 0x0000, 0x1000, 0x8000, 0x00805f9b34fb);

/// Standard SMP GATT service (MCUmgr firmware management).
pub const SERVICE_SMP_UUID: Uuid =
    uuid_from_fields(0x8d53dc1d, 0x1db7, 0x4cd3, 0x868b, 0x8a527460aa84);

/// Connect / service-discovery deadlines.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Shared adapter state
// ============================================================================

struct BleAdapterState {
    manager: Option<Manager>,
    adapter: Option<Adapter>,
}

static BLE_ADAPTER: Lazy<Arc<Mutex<BleAdapterState>>> = Lazy::new(|| {
    Arc::new(Mutex::new(BleAdapterState {
        manager: None,
        adapter: None,
    }))
});

/// Initialise the BLE manager and adapter if not already done.
async fn ensure_adapter() -> Result<Adapter> {
    let mut state = BLE_ADAPTER.lock().await;
    if let Some(adapter) = state.adapter.clone() {
        return Ok(adapter);
    }
    let manager = Manager::new()
        .await
        .map_err(|e| Error::Link(format!("BLE manager init failed: {e}")))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| Error::Link(format!("failed to list BLE adapters: {e}")))?;
    let adapter = adapters
        .into_iter()
        .next()
        .ok_or_else(|| Error::Link("no BLE adapter found".to_string()))?;
    state.adapter = Some(adapter.clone());
    state.manager = Some(manager);
    Ok(adapter)
}

// ============================================================================
// Error classification
// ============================================================================

/// Map a btleplug error into the driver taxonomy.
///
/// `NotSupported` is how the platform stacks report the peripheral's
/// single-threaded GATT server rejecting a concurrent operation, so it maps
/// to the retryable `DeviceBusy` class.
fn map_ble_error(context: &str, err: btleplug::Error) -> Error {
    match err {
        btleplug::Error::NotSupported(msg) => Error::DeviceBusy(format!("{context}: {msg}")),
        btleplug::Error::DeviceNotFound => Error::NotFound(format!("{context}: device not found")),
        btleplug::Error::UnexpectedCharacteristic => {
            Error::NotFound(format!("{context}: characteristic not found"))
        }
        other => Error::Link(format!("{context}: {other}")),
    }
}

// ============================================================================
// Scanning
// ============================================================================

/// A peripheral advertising the Smart Paci service.
pub struct DiscoveredDevice {
    pub name: String,
    pub id: String,
    pub rssi: Option<i16>,
    peripheral: Peripheral,
}

impl DiscoveredDevice {
    /// Bind the discovered peripheral into a connectable link.
    pub fn into_link(self) -> BleDeviceLink {
        BleDeviceLink::new(self.peripheral)
    }
}

/// Scan for peripherals advertising the Smart Paci service.
///
/// The scan runs unfiltered and matches advertised UUIDs on the
/// application side: on macOS, CoreBluetooth's scan filter only matches
/// UUIDs in the primary advertisement packet, but Zephyr devices typically
/// place 128-bit service UUIDs in the scan response data instead.
pub async fn scan(duration: Duration) -> Result<Vec<DiscoveredDevice>> {
    let adapter = ensure_adapter().await?;

    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| map_ble_error("failed to start BLE scan", e))?;
    info!("[ble] Scan started (filtering for service {SERVICE_PACI_UUID})");

    let mut found = Vec::new();
    let mut seen_ids = HashSet::new();
    let deadline = tokio::time::Instant::now() + duration;

    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(500)).await;

        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| map_ble_error("failed to list peripherals", e))?;
        for peripheral in peripherals {
            let id = peripheral.id().to_string();
            if seen_ids.contains(&id) {
                continue;
            }

            let props = match peripheral.properties().await.ok().flatten() {
                Some(p) => p,
                None => continue,
            };

            let advertises_service = props.services.contains(&SERVICE_PACI_UUID)
                || props.service_data.contains_key(&SERVICE_PACI_UUID);
            if !advertises_service {
                continue;
            }

            let name = props.local_name.clone().unwrap_or_else(|| id.clone());
            debug!("[ble] Matched: {} ({}), RSSI: {:?}", name, id, props.rssi);
            seen_ids.insert(id.clone());
            found.push(DiscoveredDevice {
                name,
                id,
                rssi: props.rssi,
                peripheral,
            });
        }
    }

    let _ = adapter.stop_scan().await;
    info!("[ble] Scan finished, {} device(s) matched", found.len());
    Ok(found)
}

// ============================================================================
// DeviceLink implementation
// ============================================================================

/// Production transport over a btleplug peripheral.
pub struct BleDeviceLink {
    peripheral: Peripheral,
}

impl BleDeviceLink {
    pub fn new(peripheral: Peripheral) -> Self {
        Self { peripheral }
    }

    /// Find a GATT characteristic by UUID on the connected peripheral.
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::NotFound(format!("characteristic {uuid} not found")))
    }
}

#[async_trait]
impl DeviceLink for BleDeviceLink {
    async fn connect(&self) -> Result<()> {
        match tokio::time::timeout(CONNECT_TIMEOUT, self.peripheral.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(map_ble_error("failed to connect", e)),
            Err(_) => {
                // Attempt to clean up the half-open attempt.
                let _ = self.peripheral.disconnect().await;
                Err(Error::Timeout(CONNECT_TIMEOUT))
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| map_ble_error("failed to disconnect", e))
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn discover_services(&self) -> Result<()> {
        match tokio::time::timeout(DISCOVER_TIMEOUT, self.peripheral.discover_services()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(map_ble_error("failed to discover services", e)),
            Err(_) => Err(Error::Timeout(DISCOVER_TIMEOUT)),
        }
    }

    async fn device_name(&self) -> Option<String> {
        self.peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name)
    }

    fn has_service(&self, service: Uuid) -> bool {
        self.peripheral.services().iter().any(|s| s.uuid == service)
    }

    fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.peripheral
            .characteristics()
            .iter()
            .any(|c| c.uuid == characteristic)
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let c = self.characteristic(characteristic)?;
        self.peripheral
            .read(&c)
            .await
            .map_err(|e| map_ble_error("read failed", e))
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8], with_response: bool) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&c, payload, write_type)
            .await
            .map_err(|e| map_ble_error("write failed", e))
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        if !c.properties.contains(CharPropFlags::NOTIFY) {
            return Err(Error::NotFound(format!(
                "characteristic {characteristic} does not support notifications"
            )));
        }
        self.peripheral
            .subscribe(&c)
            .await
            .map_err(|e| map_ble_error("subscribe failed", e))
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        self.peripheral
            .unsubscribe(&c)
            .await
            .map_err(|e| map_ble_error("unsubscribe failed", e))
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let stream = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| map_ble_error("failed to open notification stream", e))?;
        Ok(Box::pin(stream.map(|n| Notification {
            characteristic: n.uuid,
            value: n.value,
        })))
    }

    async fn smp_transport(&self) -> Result<Box<dyn SmpTransportAsync + Send>> {
        let transport = BleTransport::from_peripheral(self.peripheral.clone())
            .await
            .map_err(|e| Error::Link(format!("failed to create SMP transport: {e}")))?;
        Ok(Box::new(transport))
    }
}
