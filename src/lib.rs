//! Client driver for the Smart Paci, a battery-powered BLE sensing device.
//!
//! The driver owns the GATT session (connect, feature discovery, reconnect
//! on link drops), decodes sensor telemetry (bite, suck, touch, battery),
//! runs the request/response control channel, and orchestrates dual-bank
//! OTA firmware updates over the MCUmgr SMP service, including the
//! post-reconnect confirm step that keeps the bootloader from rolling a
//! working image back.
//!
//! ```no_run
//! use smartpaci::{McuMgrClient, Session};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> smartpaci::Result<()> {
//!     let mut devices = smartpaci::ble::scan(Duration::from_secs(10)).await?;
//!     let link = Arc::new(devices.remove(0).into_link());
//!
//!     let session = Session::with_link(link, Arc::new(McuMgrClient::new()));
//!     let mut events = session.subscribe();
//!     session.connect().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod ble;
mod control;
mod discovery;
pub mod error;
pub mod events;
pub mod image;
pub mod mcumgr;
pub mod ota;
pub mod session;
#[cfg(test)]
mod testutil;
pub mod transport;
pub mod version;
pub mod wire;

pub use error::{Error, Result};
pub use events::{DeviceEvent, Feature, FeatureSet};
pub use image::FirmwareImageInfo;
pub use mcumgr::{ImageManagement, ImageSlot, McuMgrClient, McuMgrEvent};
pub use ota::{OtaOrchestrator, OtaPhase};
pub use session::{CalibrationType, InputType, Session, SessionStateKind};
pub use transport::{DeviceLink, Notification};
pub use version::FirmwareVersion;
