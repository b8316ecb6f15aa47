// Device event surface and capability bitmap.
//
// Every runtime signal a session produces is a variant of `DeviceEvent`,
// delivered over a broadcast channel. Payloads serialize so embedding
// applications can forward them (to a UI bridge, a log, a websocket)
// without re-mapping.

use crate::version::FirmwareVersion;
use serde::Serialize;
use std::fmt;

// ============================================================================
// Capability bitmap
// ============================================================================

/// Optional device features discovered on a connection.
/// Each variant is a bit-shifted value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Feature {
    /// Control request/response protocol (mandatory service).
    Control = 1 << 0,
    /// MCUmgr firmware-management service.
    Firmware = 1 << 1,
    /// Bite force sensor.
    Bite = 1 << 2,
    /// Suck force sensor array.
    Suck = 1 << 3,
    /// Capacitive touch sensors.
    Touch = 1 << 4,
}

/// Bit-set of discovered [`Feature`]s. Built once per connection attempt,
/// final before `Connected` fires, empty after disconnect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FeatureSet(u8);

impl FeatureSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, feature: Feature) {
        self.0 |= feature as u8;
    }

    pub fn contains(self, feature: Feature) -> bool {
        self.0 & feature as u8 != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (feature, label) in [
            (Feature::Control, "control"),
            (Feature::Firmware, "firmware"),
            (Feature::Bite, "bite"),
            (Feature::Suck, "suck"),
            (Feature::Touch, "touch"),
        ] {
            if self.contains(feature) {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{label}")?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

// ============================================================================
// Events
// ============================================================================

/// Events published by a [`crate::session::Session`].
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DeviceEvent {
    /// Feature discovery finished and the session is ready. Always preceded
    /// by `FeaturesUpdated`.
    Connected,
    Disconnected,
    /// The link dropped and the session is re-running the connect sequence.
    Reconnecting,
    NameChanged { name: String },
    FeaturesUpdated { features: FeatureSet },
    /// Battery charge percent, 0-100. A device without a battery service
    /// reports a synthetic 0 once per connection.
    Battery { value: u8 },
    /// Bite force, 0-255.
    Bite { value: u8 },
    /// One magnitude per force-sensing element, in characteristic order.
    Suck { values: Vec<u8> },
    /// Indices (0-7) of the touch pads currently in contact.
    Touch { values: Vec<u8> },
    FirmwareVersion { version: FirmwareVersion },
    /// Image upload progress percent, 0-100.
    FirmwareUploadProgress { percent: f32 },
    FirmwareUploadComplete,
}
