// MCUmgr image-management client.
//
// Drives the SMP firmware sub-protocol (image state, chunked upload, test,
// confirm, reset) over a transport created from the session's link. The
// device services one SMP operation at a time, so the transport sits behind
// a mutex and every command is a strict send/receive pair.
//
// Results are republished on a typed event channel keyed by the SMP
// (group, command) pair of the response: callers subscribe before issuing a
// command and correlate the emitted event to the call that triggered it.

use crate::error::{Error, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use mcumgr_smp::application_management;
use mcumgr_smp::os_management;
use mcumgr_smp::smp::SmpFrame;
use mcumgr_smp::transport::smp::SmpTransportAsync;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

// ============================================================================
// Constants
// ============================================================================

/// SMP group/command identifiers for the exchanges this client issues.
const GROUP_OS: u16 = 0;
const GROUP_IMAGE: u16 = 1;
const CMD_IMAGE_STATE: u8 = 0;
const CMD_IMAGE_UPLOAD: u8 = 1;
const CMD_OS_RESET: u8 = 5;

/// Chunk size for BLE firmware upload (bytes).
/// 500 bytes is safely below the 512-byte SMP MTU (8-byte SMP header + payload).
const BLE_CHUNK_SIZE: usize = 500;

/// Deadline for one SMP exchange. Uploads pay it per chunk.
const SMP_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a reset acknowledgement before assuming the device
/// rebooted without replying.
const RESET_ACK_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Types
// ============================================================================

/// One firmware image slot as reported by the bootloader.
/// Slot 0 is the running image, slot 1 the secondary bank.
#[derive(Clone, Debug, Serialize)]
pub struct ImageSlot {
    pub slot: i32,
    pub version: String,
    pub hash: Vec<u8>,
    pub bootable: bool,
    pub pending: bool,
    pub confirmed: bool,
    pub active: bool,
    pub permanent: bool,
    pub image: Option<i32>,
}

impl ImageSlot {
    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }
}

/// Typed results of SMP exchanges, broadcast to all subscribers.
#[derive(Clone, Debug)]
pub enum McuMgrEvent {
    /// Image state response: the ordered list of slot descriptors.
    State { slots: Vec<ImageSlot> },
    /// Upload progress, 0-100.
    UploadProgress { percent: f32 },
    UploadComplete,
    /// The reset command went out.
    Reset,
}

/// Image-management operations consumed by the session and the OTA
/// orchestrator. Implemented by [`McuMgrClient`] in production and by a
/// scripted fake in tests.
#[async_trait]
pub trait ImageManagement: Send + Sync {
    /// Bind an SMP transport for the current connection.
    async fn attach(&self, transport: Box<dyn SmpTransportAsync + Send>);

    /// Drop the transport. Pending exchanges fail with `ConnectionLost`.
    async fn detach(&self);

    /// Query slot states; the result arrives as `McuMgrEvent::State`.
    async fn query_image_state(&self) -> Result<()>;

    /// Upload an image into the secondary slot, emitting progress events.
    async fn upload(&self, image: &[u8]) -> Result<()>;

    /// Mark the image with `hash` for a test boot on the next reset.
    async fn test_image(&self, hash: &[u8]) -> Result<()>;

    /// Permanently confirm the image with `hash` (prevents rollback).
    async fn confirm_image(&self, hash: &[u8]) -> Result<()>;

    /// Reboot the device.
    async fn reset(&self) -> Result<()>;

    fn events(&self) -> broadcast::Receiver<McuMgrEvent>;
}

// ============================================================================
// Client
// ============================================================================

struct ClientInner {
    transport: Option<Box<dyn SmpTransportAsync + Send>>,
    seq: u8,
}

impl ClientInner {
    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = seq.wrapping_add(1);
        seq
    }
}

/// Production [`ImageManagement`] over `mcumgr-smp`.
pub struct McuMgrClient {
    inner: Mutex<ClientInner>,
    events: broadcast::Sender<McuMgrEvent>,
}

impl McuMgrClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(ClientInner {
                transport: None,
                seq: 0,
            }),
            events,
        }
    }

    /// Send one frame and receive the matching response.
    async fn exchange(
        inner: &mut ClientInner,
        encoded: Vec<u8>,
        expect_group: u16,
        expect_command: u8,
    ) -> Result<Vec<u8>> {
        let transport = inner
            .transport
            .as_mut()
            .ok_or_else(|| Error::ConnectionLost("no SMP transport attached".to_string()))?;

        transport
            .send(encoded)
            .await
            .map_err(|e| Error::Link(format!("SMP send failed: {e}")))?;

        let response = tokio::time::timeout(SMP_RESPONSE_TIMEOUT, transport.receive())
            .await
            .map_err(|_| Error::Timeout(SMP_RESPONSE_TIMEOUT))?
            .map_err(|e| Error::Link(format!("SMP receive failed: {e}")))?;

        let (group, command) = parse_smp_header(&response)?;
        if (group, command) != (expect_group, expect_command) {
            return Err(Error::UnexpectedResponse(format!(
                "SMP response for group {group} command {command}, expected group {expect_group} command {expect_command}"
            )));
        }
        Ok(response)
    }

    /// Decode an image-state response and publish it as a State event.
    fn publish_image_state(&self, response: &[u8]) -> Result<Vec<ImageSlot>> {
        let frame: SmpFrame<application_management::GetImageStateResult> =
            SmpFrame::decode_with_cbor(response)
                .map_err(|e| Error::MalformedMessage(format!("bad image state response: {e}")))?;

        let slots: Vec<ImageSlot> = match frame.data {
            application_management::GetImageStateResult::Ok(payload) => payload
                .images
                .into_iter()
                .map(|img| ImageSlot {
                    slot: img.slot,
                    version: img.version,
                    hash: img.hash,
                    bootable: img.bootable,
                    pending: img.pending,
                    confirmed: img.confirmed,
                    active: img.active,
                    permanent: img.permanent,
                    image: img.image,
                })
                .collect(),
            application_management::GetImageStateResult::Err(e) => {
                return Err(Error::DeviceReportedFailure {
                    rc: e.rc as i32,
                    reason: format!("image state request failed (rsn {:?})", e.rsn),
                });
            }
        };

        let _ = self.events.send(McuMgrEvent::State { slots: slots.clone() });
        Ok(slots)
    }

    /// Issue a set-state command (test or confirm) and publish the slot
    /// states the device answers with.
    async fn set_state(&self, hash: &[u8], confirm: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        let frame = application_management::set_state(hash.to_vec(), confirm, seq);
        let response = Self::exchange(
            &mut inner,
            frame.encode_with_cbor(),
            GROUP_IMAGE,
            CMD_IMAGE_STATE,
        )
        .await?;
        drop(inner);

        self.publish_image_state(&response)?;
        debug!(
            "[mcumgr] Image {}",
            if confirm { "confirmed" } else { "marked for test boot" }
        );
        Ok(())
    }
}

impl Default for McuMgrClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageManagement for McuMgrClient {
    async fn attach(&self, transport: Box<dyn SmpTransportAsync + Send>) {
        let mut inner = self.inner.lock().await;
        inner.transport = Some(transport);
    }

    async fn detach(&self) {
        let mut inner = self.inner.lock().await;
        inner.transport = None;
    }

    async fn query_image_state(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        let frame = application_management::get_state(seq);
        let response = Self::exchange(
            &mut inner,
            frame.encode_with_cbor(),
            GROUP_IMAGE,
            CMD_IMAGE_STATE,
        )
        .await?;
        drop(inner);

        self.publish_image_state(&response)?;
        Ok(())
    }

    async fn upload(&self, image: &[u8]) -> Result<()> {
        let total_bytes = image.len();
        let hash = Sha256::digest(image).to_vec();
        info!("[mcumgr] Starting firmware upload ({total_bytes} bytes)");

        let mut inner = self.inner.lock().await;
        let mut writer =
            application_management::ImageWriter::new(None, total_bytes, Some(&hash), false);

        let mut offset = 0;
        while offset < total_bytes {
            let end = std::cmp::min(offset + BLE_CHUNK_SIZE, total_bytes);
            let frame = writer.write_chunk(&image[offset..end]);
            let response = Self::exchange(
                &mut inner,
                frame.encode_with_cbor(),
                GROUP_IMAGE,
                CMD_IMAGE_UPLOAD,
            )
            .await?;

            let result: SmpFrame<application_management::WriteImageChunkResult> =
                SmpFrame::decode_with_cbor(&response)
                    .map_err(|e| Error::MalformedMessage(format!("bad upload response: {e}")))?;
            match result.data {
                application_management::WriteImageChunkResult::Ok(_) => {}
                application_management::WriteImageChunkResult::Err(e) => {
                    return Err(Error::DeviceReportedFailure {
                        rc: e.rc as i32,
                        reason: format!("device rejected upload at offset {offset} (rsn {:?})", e.rsn),
                    });
                }
            }

            offset = end;
            let percent = (offset as f32 / total_bytes as f32) * 100.0;
            let _ = self.events.send(McuMgrEvent::UploadProgress { percent });
        }
        drop(inner);

        info!("[mcumgr] Upload complete ({total_bytes} bytes)");
        let _ = self.events.send(McuMgrEvent::UploadComplete);
        Ok(())
    }

    async fn test_image(&self, hash: &[u8]) -> Result<()> {
        self.set_state(hash, false).await
    }

    async fn confirm_image(&self, hash: &[u8]) -> Result<()> {
        self.set_state(hash, true).await
    }

    async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        let frame = os_management::reset(seq, false);

        let transport = inner
            .transport
            .as_mut()
            .ok_or_else(|| Error::ConnectionLost("no SMP transport attached".to_string()))?;
        transport
            .send(frame.encode_with_cbor())
            .await
            .map_err(|e| Error::Link(format!("SMP send failed: {e}")))?;

        // The device may disconnect before sending a response, so a missing
        // or late acknowledgement is tolerated here.
        match tokio::time::timeout(RESET_ACK_TIMEOUT, transport.receive()).await {
            Ok(Ok(response)) => {
                if let Ok((group, command)) = parse_smp_header(&response) {
                    if (group, command) == (GROUP_OS, CMD_OS_RESET) {
                        let _ = SmpFrame::<os_management::ResetResult>::decode_with_cbor(&response);
                    }
                }
            }
            Ok(Err(_)) | Err(_) => {
                warn!("[mcumgr] No response to reset (device likely rebooted)");
            }
        }
        drop(inner);

        info!("[mcumgr] Reset command sent");
        let _ = self.events.send(McuMgrEvent::Reset);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<McuMgrEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Header parsing
// ============================================================================

/// Extract (group, command) from an 8-byte SMP header:
/// op, flags, length (u16 BE), group (u16 BE), sequence, command.
fn parse_smp_header(frame: &[u8]) -> Result<(u16, u8)> {
    if frame.len() < 8 {
        return Err(Error::MalformedMessage(format!(
            "SMP frame of {} bytes is shorter than the header",
            frame.len()
        )));
    }
    let group = u16::from_be_bytes([frame[4], frame[5]]);
    let command = frame[7];
    Ok((group, command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeSmpTransport;

    #[test]
    fn test_parse_smp_header() {
        // op 1, flags 0, len 0x0004, group 0x0001, seq 7, command 0.
        let frame = [0x01, 0x00, 0x00, 0x04, 0x00, 0x01, 0x07, 0x00, 0xBF, 0xFF];
        assert_eq!(parse_smp_header(&frame).unwrap(), (GROUP_IMAGE, CMD_IMAGE_STATE));

        assert!(matches!(
            parse_smp_header(&[0x01, 0x00]),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_query_without_transport_fails() {
        let client = McuMgrClient::new();
        let err = client.query_image_state().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_mismatched_response_group_is_rejected() {
        let client = McuMgrClient::new();
        // An OS-group header where an image-state response was expected.
        let transport = FakeSmpTransport::with_responses(vec![vec![
            0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05,
        ]]);
        client.attach(Box::new(transport)).await;

        let err = client.query_image_state().await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedResponse(_)));
    }

    #[tokio::test]
    async fn test_reset_tolerates_missing_response() {
        let client = McuMgrClient::new();
        let mut events = client.events();
        // No scripted responses: receive fails as if the device rebooted.
        client.attach(Box::new(FakeSmpTransport::with_responses(vec![]))).await;

        client.reset().await.unwrap();
        assert!(matches!(events.try_recv().unwrap(), McuMgrEvent::Reset));
    }
}
