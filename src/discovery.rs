// Per-connection feature discovery.
//
// Assembles the capability set for a freshly connected peripheral and wires
// the notification subscriptions for whichever optional services are
// present. Every optional probe is isolated: an absent service or
// characteristic marks the capability missing and moves on, while any
// link-class failure aborts the whole connect sequence, since it means the
// link itself is unhealthy rather than a feature missing.

use crate::ble::{
    CHARACTERISTIC_BATTERY_LEVEL_UUID, CHARACTERISTIC_BITE_UUID, CHARACTERISTIC_CONTROL_UUID,
    CHARACTERISTIC_FORCE_UUID, CHARACTERISTIC_TOUCH_UUID, SERVICE_BATTERY_UUID, SERVICE_PACI_UUID,
    SERVICE_SMP_UUID,
};
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, Feature, FeatureSet};
use crate::transport::DeviceLink;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Backoff between subscription attempts while the peripheral's GATT server
/// reports busy. It only services one operation at a time.
const SUBSCRIBE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Probe the connected peripheral and wire sensor subscriptions.
///
/// Emits the initial battery reading (synthetic 0 when no battery service
/// is present — downstream consumers always expect a battery value once
/// connected). The caller emits `FeaturesUpdated` and `Connected` after
/// this returns, so capability bits are final before `Connected` fires.
pub async fn discover(
    link: &Arc<dyn DeviceLink>,
    events: &broadcast::Sender<DeviceEvent>,
) -> Result<FeatureSet> {
    let mut features = FeatureSet::empty();

    // The control service is mandatory; a Smart Paci without it is not a
    // device we can drive.
    if !link.has_service(SERVICE_PACI_UUID) {
        return Err(Error::NotFound(format!(
            "device does not have the Smart Paci service {SERVICE_PACI_UUID}"
        )));
    }
    features.insert(Feature::Control);

    // Firmware management is presence-only here; the session attaches the
    // SMP transport once discovery has finished.
    if link.has_service(SERVICE_SMP_UUID) {
        features.insert(Feature::Firmware);
    } else {
        debug!("[discovery] No firmware-management service");
    }

    match probe_battery(link, events).await {
        Ok(()) => {}
        Err(err) if matches!(err, Error::NotFound(_)) => {
            // Assume no battery is present.
            debug!("[discovery] No battery service: {err}");
            let _ = events.send(DeviceEvent::Battery { value: 0 });
        }
        Err(err) => return Err(err),
    }

    for (characteristic, feature, label) in [
        (CHARACTERISTIC_BITE_UUID, Feature::Bite, "bite"),
        (CHARACTERISTIC_FORCE_UUID, Feature::Suck, "suck"),
        (CHARACTERISTIC_TOUCH_UUID, Feature::Touch, "touch"),
    ] {
        match probe_sensor(link, characteristic).await {
            Ok(()) => features.insert(feature),
            Err(err) if matches!(err, Error::NotFound(_)) => {
                warn!("[discovery] No {label} sensor available");
            }
            Err(err) => return Err(err),
        }
    }

    // The control characteristic is part of the mandatory service; failure
    // to subscribe here is fatal to the connect.
    subscribe_with_retry(link, CHARACTERISTIC_CONTROL_UUID).await?;

    Ok(features)
}

/// Subscribe to the battery level and emit the initial reading.
async fn probe_battery(
    link: &Arc<dyn DeviceLink>,
    events: &broadcast::Sender<DeviceEvent>,
) -> Result<()> {
    if !link.has_service(SERVICE_BATTERY_UUID)
        || !link.has_characteristic(CHARACTERISTIC_BATTERY_LEVEL_UUID)
    {
        return Err(Error::NotFound("battery service not present".to_string()));
    }

    subscribe_with_retry(link, CHARACTERISTIC_BATTERY_LEVEL_UUID).await?;
    let level = link.read(CHARACTERISTIC_BATTERY_LEVEL_UUID).await?;
    let _ = events.send(DeviceEvent::Battery {
        value: level.first().copied().unwrap_or(0),
    });
    Ok(())
}

async fn probe_sensor(link: &Arc<dyn DeviceLink>, characteristic: Uuid) -> Result<()> {
    if !link.has_characteristic(characteristic) {
        return Err(Error::NotFound(format!(
            "characteristic {characteristic} not present"
        )));
    }
    subscribe_with_retry(link, characteristic).await
}

/// Subscribe, retrying while the peripheral reports busy.
///
/// The GATT server only supports one concurrent operation; a busy rejection
/// is expected while another subscription is still settling. Any other
/// failure class is fatal to the connect sequence.
async fn subscribe_with_retry(link: &Arc<dyn DeviceLink>, characteristic: Uuid) -> Result<()> {
    loop {
        match link.subscribe(characteristic).await {
            Ok(()) => return Ok(()),
            Err(Error::DeviceBusy(reason)) => {
                debug!(
                    "[discovery] Device busy, could not subscribe to {characteristic} ({reason}). Retrying..."
                );
                tokio::time::sleep(SUBSCRIBE_RETRY_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{recv_events, FakeLink};

    fn event_channel() -> (
        broadcast::Sender<DeviceEvent>,
        broadcast::Receiver<DeviceEvent>,
    ) {
        broadcast::channel(64)
    }

    #[tokio::test]
    async fn test_capability_set_with_partial_features() {
        // Control present, firmware absent, battery absent, bite present,
        // suck absent, touch present.
        let link = FakeLink::new()
            .with_service(SERVICE_PACI_UUID)
            .with_characteristic(CHARACTERISTIC_CONTROL_UUID)
            .with_characteristic(CHARACTERISTIC_BITE_UUID)
            .with_characteristic(CHARACTERISTIC_TOUCH_UUID);
        let link: Arc<dyn DeviceLink> = Arc::new(link);
        let (events, rx) = event_channel();

        let features = discover(&link, &events).await.unwrap();

        assert!(features.contains(Feature::Control));
        assert!(features.contains(Feature::Bite));
        assert!(features.contains(Feature::Touch));
        assert!(!features.contains(Feature::Firmware));
        assert!(!features.contains(Feature::Suck));

        // Absent battery surfaces as a synthetic reading of 0.
        let seen = recv_events(rx);
        assert!(seen
            .iter()
            .any(|e| matches!(e, DeviceEvent::Battery { value: 0 })));
    }

    #[tokio::test]
    async fn test_battery_present_emits_initial_level() {
        let link = FakeLink::new()
            .with_service(SERVICE_PACI_UUID)
            .with_service(SERVICE_BATTERY_UUID)
            .with_characteristic(CHARACTERISTIC_CONTROL_UUID)
            .with_characteristic(CHARACTERISTIC_BATTERY_LEVEL_UUID)
            .with_read_value(CHARACTERISTIC_BATTERY_LEVEL_UUID, vec![83]);
        let link: Arc<dyn DeviceLink> = Arc::new(link);
        let (events, rx) = event_channel();

        discover(&link, &events).await.unwrap();

        let seen = recv_events(rx);
        assert!(seen
            .iter()
            .any(|e| matches!(e, DeviceEvent::Battery { value: 83 })));
    }

    #[tokio::test]
    async fn test_missing_control_service_is_fatal() {
        let link: Arc<dyn DeviceLink> = Arc::new(FakeLink::new());
        let (events, _rx) = event_channel();

        let err = discover(&link, &events).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_link_error_during_probe_aborts() {
        let link = FakeLink::new()
            .with_service(SERVICE_PACI_UUID)
            .with_characteristic(CHARACTERISTIC_CONTROL_UUID)
            .with_characteristic(CHARACTERISTIC_BITE_UUID);
        link.fail_subscribe(
            CHARACTERISTIC_BITE_UUID,
            Error::Link("link dropped mid-probe".to_string()),
        );
        let link: Arc<dyn DeviceLink> = Arc::new(link);
        let (events, _rx) = event_channel();

        let err = discover(&link, &events).await.unwrap_err();
        assert!(matches!(err, Error::Link(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_subscribe_retries_until_success() {
        let fake = Arc::new(
            FakeLink::new()
                .with_service(SERVICE_PACI_UUID)
                .with_characteristic(CHARACTERISTIC_CONTROL_UUID)
                .with_busy_subscribes(CHARACTERISTIC_CONTROL_UUID, 3),
        );
        let link: Arc<dyn DeviceLink> = fake.clone();
        let (events, _rx) = event_channel();

        let features = discover(&link, &events).await.unwrap();
        assert!(features.contains(Feature::Control));
        // Three busy rejections, then the successful attempt.
        assert_eq!(fake.subscribe_attempts(CHARACTERISTIC_CONTROL_UUID), 4);
    }
}
