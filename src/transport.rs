// Transport capability interface.
//
// The session drives a peripheral through this trait instead of a concrete
// BLE stack: `ble.rs` implements it over btleplug for production, the test
// fakes implement it in-process. One trait object per bound peripheral; the
// session owns connect/disconnect ordering and never issues concurrent GATT
// operations (the peripheral's GATT server is single-threaded).

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use mcumgr_smp::transport::smp::SmpTransportAsync;
use std::pin::Pin;
use uuid::Uuid;

/// A value notification from any subscribed characteristic. The stream is
/// multiplexed; consumers dispatch on `characteristic`.
#[derive(Clone, Debug)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// Capability interface over one peripheral.
///
/// Error classes matter to callers: `NotFound` marks an absent optional
/// service/characteristic, `DeviceBusy` a transient single-operation
/// rejection worth retrying, `Link` an unhealthy connection.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Establish the link. Idempotent on an already-connected peripheral.
    async fn connect(&self) -> Result<()>;

    /// Close the link. Best-effort; the peripheral may already be gone.
    async fn disconnect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    /// Populate the service/characteristic table. Must be called after
    /// `connect` and before any presence query or characteristic I/O.
    async fn discover_services(&self) -> Result<()>;

    /// Advertised device name, when the platform exposes one.
    async fn device_name(&self) -> Option<String>;

    fn has_service(&self, service: Uuid) -> bool;

    fn has_characteristic(&self, characteristic: Uuid) -> bool;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write `payload`; `with_response` requests a GATT acknowledgement.
    async fn write(&self, characteristic: Uuid, payload: &[u8], with_response: bool) -> Result<()>;

    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// The multiplexed notification stream. The stream ends when the link
    /// drops; callers treat that as a disconnect signal.
    async fn notifications(&self) -> Result<NotificationStream>;

    /// Build an SMP transport over this link for the firmware-management
    /// sub-protocol.
    async fn smp_transport(&self) -> Result<Box<dyn SmpTransportAsync + Send>>;
}
