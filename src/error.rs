// Error taxonomy for the Smart Paci driver.
//
// Every variant carries a displayable reason so connection and OTA failures
// can be shown to a user as-is. Feature-absence (`NotFound`) is recovered
// inside discovery for optional services and only ever surfaces for the
// mandatory control service.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the driver.
#[derive(Error, Debug)]
pub enum Error {
    /// `connect()` was called with no peripheral bound to the session.
    #[error("no device selected")]
    NoDeviceSelected,

    /// A control request was issued while another was still in flight.
    /// The device GATT stack services one operation at a time.
    #[error("control channel busy: a request is already awaiting its response")]
    ChannelBusy,

    /// The link dropped while an operation was pending.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A service or characteristic is not present on the peripheral.
    #[error("not found: {0}")]
    NotFound(String),

    /// The peripheral's GATT server rejected an operation because it is
    /// already servicing another one. Retried internally where allowed.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// Link-level failure (radio, adapter, platform BLE stack).
    #[error("link error: {0}")]
    Link(String),

    /// A dotted version string could not be parsed into numeric fields.
    #[error("malformed version string: {0:?}")]
    MalformedVersionString(String),

    /// A control-channel payload could not be decoded.
    #[error("malformed control message: {0}")]
    MalformedMessage(String),

    /// The firmware image container is truncated or not an MCUboot image.
    #[error("invalid firmware image: {0}")]
    InvalidImage(String),

    /// The firmware image's declared content hash does not match the
    /// computed hash.
    #[error("invalid image hash: {0}")]
    InvalidImageHash(String),

    /// The firmware file exceeds the upload ceiling.
    #[error("firmware file too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: usize, limit: usize },

    /// The firmware to upload is already running on the device.
    #[error("cannot upload the firmware that is already running on the device ({0})")]
    DuplicateFirmware(String),

    /// Both image slots hold byte-for-byte identical firmware; there is
    /// nothing to apply.
    #[error("uploaded firmware is identical to the running firmware ({0})")]
    IdenticalImages(String),

    /// A response arrived whose (group, command) pair does not match the
    /// request that was issued.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The device answered with a non-zero management response code.
    #[error("device reported failure (rc {rc}): {reason}")]
    DeviceReportedFailure { rc: i32, reason: String },

    /// An exchange did not complete within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Link-class failures are transient: during an initial connect they
    /// trigger one automatic reconnect cycle instead of surfacing.
    pub fn is_link_error(&self) -> bool {
        matches!(self, Error::Link(_) | Error::ConnectionLost(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
