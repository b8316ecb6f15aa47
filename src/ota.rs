// OTA firmware update orchestration.
//
// Drives the dual-bank update sequence against the image-management
// sub-protocol: upload into the secondary slot, verify the image is
// actually new, mark it for a test boot, reset. The second half of the
// protocol — confirming the test-booted image once a live reconnect proves
// it works — runs in the session's image event handler; this module only
// tracks its outcome in the OTA phase.
//
// The device services one management operation at a time, so every
// query/response pair here is strictly sequential: the next command is not
// issued until the previous response has been observed.

use crate::ble::CHARACTERISTIC_CONTROL_UUID;
use crate::error::{Error, Result};
use crate::events::DeviceEvent;
use crate::image::{self, FirmwareImageInfo};
use crate::mcumgr::{ImageManagement, ImageSlot, McuMgrEvent};
use crate::session::Session;
use log::{debug, info};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Deadline for one awaited State event.
const STATE_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Types
// ============================================================================

/// Phase of the current OTA attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OtaPhase {
    Idle,
    Uploading,
    /// The image sits in the secondary slot, waiting for `apply_update`.
    AwaitingTest,
    /// Test and reset issued; the device is rebooting into the new image.
    AwaitingReset,
    /// Reconnected on the new image, confirm not yet observed.
    Confirming,
    Complete,
    Failed(String),
}

/// Orchestrates firmware updates over an established session.
pub struct OtaOrchestrator {
    session: Arc<Session>,
    phase: Arc<Mutex<OtaPhase>>,
    image_info: Mutex<Option<FirmwareImageInfo>>,
}

impl OtaOrchestrator {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            phase: Arc::new(Mutex::new(OtaPhase::Idle)),
            image_info: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> OtaPhase {
        self.phase.lock().unwrap().clone()
    }

    /// Metadata of the image handed to the last `upload_firmware` call.
    pub fn image_info(&self) -> Option<FirmwareImageInfo> {
        self.image_info.lock().unwrap().clone()
    }

    /// Reset the OTA state so a new attempt can start. Failed attempts are
    /// never retried automatically; retry is an explicit caller action.
    pub fn clear(&self) {
        *self.phase.lock().unwrap() = OtaPhase::Idle;
        *self.image_info.lock().unwrap() = None;
    }

    fn set_phase(&self, phase: OtaPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    fn fail(&self, err: Error) -> Error {
        self.set_phase(OtaPhase::Failed(err.to_string()));
        err
    }

    /// Wait for the next State event, dropping unrelated events.
    async fn await_state(
        &self,
        events: &mut broadcast::Receiver<McuMgrEvent>,
    ) -> Result<Vec<ImageSlot>> {
        let deadline = tokio::time::Instant::now() + STATE_EVENT_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(Error::Timeout(STATE_EVENT_TIMEOUT))?;
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(McuMgrEvent::State { slots })) => return Ok(slots),
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(Error::ConnectionLost(
                        "image-management event channel closed".to_string(),
                    ));
                }
                Err(_) => return Err(Error::Timeout(STATE_EVENT_TIMEOUT)),
            }
        }
    }

    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    /// Inspect and upload a firmware image into the secondary slot.
    ///
    /// Refuses to transfer an image that is already running
    /// (`DuplicateFirmware`); an image already sitting in the secondary
    /// slot counts as uploaded and only emits the completion signal.
    pub async fn upload_firmware(&self, image: &[u8]) -> Result<()> {
        match self.upload_inner(image).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn upload_inner(&self, image: &[u8]) -> Result<()> {
        // All local metadata is computed before any device I/O.
        let info = image::inspect(image)?;
        info!(
            "[ota] Uploading firmware {} ({} bytes, hash {})",
            info.version,
            info.file_size,
            hex::encode(&info.hash)
        );
        *self.image_info.lock().unwrap() = Some(info.clone());
        self.set_phase(OtaPhase::Uploading);

        let manager = self.session.image_manager();
        let mut events = manager.events();
        manager.query_image_state().await?;
        let slots = self.await_state(&mut events).await?;

        let running = slots
            .first()
            .ok_or_else(|| Error::UnexpectedResponse("no image slots reported".to_string()))?;
        if running.hash == info.hash {
            return Err(Error::DuplicateFirmware(info.version.to_string()));
        }

        // Already uploaded, or left over from a reverted attempt?
        if let Some(secondary) = slots.get(1) {
            if secondary.hash == info.hash {
                info!("[ota] Image already present in the secondary slot");
                self.session.send_event(DeviceEvent::FirmwareUploadComplete);
                self.set_phase(OtaPhase::AwaitingTest);
                return Ok(());
            }
        }

        manager.upload(image).await?;
        self.set_phase(OtaPhase::AwaitingTest);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Apply
    // ------------------------------------------------------------------

    /// Select the firmware in the secondary slot and reboot into it.
    ///
    /// The device cannot service control and image-management traffic
    /// reliably at once, so control notifications are suspended for the
    /// whole sequence.
    pub async fn apply_update(&self) -> Result<()> {
        match self.apply_inner().await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn apply_inner(&self) -> Result<()> {
        let manager = self.session.image_manager();
        let mut events = manager.events();

        // Nothing to apply when both banks hold the same bytes.
        manager.query_image_state().await?;
        let slots = self.await_state(&mut events).await?;
        let running = slots
            .first()
            .ok_or_else(|| Error::UnexpectedResponse("no image slots reported".to_string()))?;
        if let Some(secondary) = slots.get(1) {
            if running.hash == secondary.hash {
                return Err(Error::IdenticalImages(running.hash_hex()));
            }
        }

        // Suspend control messages for the rest of the sequence.
        self.session
            .link()?
            .unsubscribe(CHARACTERISTIC_CONTROL_UUID)
            .await?;

        manager.query_image_state().await?;
        let slots = self.await_state(&mut events).await?;
        let secondary = slots
            .get(1)
            .cloned()
            .ok_or_else(|| Error::NotFound("no secondary image slot".to_string()))?;
        debug!(
            "[ota] Uploaded firmware {} ({}) is ready to apply",
            secondary.version,
            secondary.hash_hex()
        );

        manager.test_image(&secondary.hash).await?;
        let slots = self.await_state(&mut events).await?;
        if let Some(slot) = slots.get(1) {
            debug!(
                "[ota] Slot 1 firmware {} is {} pending",
                slot.version,
                if slot.pending { "now" } else { "not" }
            );
        }

        manager.reset().await?;
        self.set_phase(OtaPhase::AwaitingReset);
        self.watch_for_confirmation(secondary.hash);
        Ok(())
    }

    /// Track the post-reset half of the protocol: the session's image event
    /// handler confirms the test-booted image after the next reconnect;
    /// this just advances the phase as those State events go by.
    fn watch_for_confirmation(&self, expected_hash: Vec<u8>) {
        let phase = self.phase.clone();
        let mut events = self.session.image_manager().events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(McuMgrEvent::State { slots }) => {
                        let Some(running) = slots.first() else { continue };
                        if running.hash != expected_hash || !running.active {
                            continue;
                        }
                        if running.confirmed {
                            info!("[ota] Updated firmware confirmed");
                            *phase.lock().unwrap() = OtaPhase::Complete;
                            return;
                        }
                        *phase.lock().unwrap() = OtaPhase::Confirming;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }
}
