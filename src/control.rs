// Control-channel request/response correlation.
//
// The control characteristic supports write + notify only; responses carry
// no request identifiers. Correlation works because the device services one
// request at a time: the channel admits a single pending request and
// resolves it with the next notification whose discriminant matches the
// expected response kind. Notifications with any other discriminant are
// logged and dropped without disturbing the pending request.

use crate::error::{Error, Result};
use crate::transport::DeviceLink;
use crate::wire::{self, ControlRequest, ControlResponse, ResponseKind};
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Deadline for a response to a control request. The link-level disconnect
/// would eventually fail a pending request too; this keeps a wedged
/// peripheral from pinning a caller indefinitely.
pub(crate) const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

struct PendingRequest {
    expects: ResponseKind,
    waiter: oneshot::Sender<Result<ControlResponse>>,
}

/// One request/response exchange at a time over the control characteristic.
pub struct ControlChannel {
    link: Arc<dyn DeviceLink>,
    characteristic: Uuid,
    pending: Mutex<Option<PendingRequest>>,
}

impl ControlChannel {
    pub fn new(link: Arc<dyn DeviceLink>, characteristic: Uuid) -> Self {
        Self {
            link,
            characteristic,
            pending: Mutex::new(None),
        }
    }

    /// Send a request and await the matching response.
    ///
    /// Fails fast with `ChannelBusy` while another request is outstanding;
    /// the transport does not support pipelined operations and must not be
    /// made to.
    pub async fn send(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let receiver = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_some() {
                return Err(Error::ChannelBusy);
            }
            let (waiter, receiver) = oneshot::channel();
            *pending = Some(PendingRequest {
                expects: request.expected_response(),
                waiter,
            });
            receiver
        };

        let payload = wire::encode_request(request);
        if let Err(err) = self.link.write(self.characteristic, &payload, true).await {
            // The request never reached the device; free the slot.
            self.pending.lock().unwrap().take();
            return Err(err);
        }

        match tokio::time::timeout(RESPONSE_TIMEOUT, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost(
                "control channel torn down while awaiting a response".to_string(),
            )),
            Err(_) => {
                self.pending.lock().unwrap().take();
                Err(Error::Timeout(RESPONSE_TIMEOUT))
            }
        }
    }

    /// Feed a notification from the control characteristic.
    ///
    /// Resolves the pending request only on a matching discriminant.
    /// Returns the decoded response either way so the session can
    /// republish responses that arrive unsolicited.
    pub fn handle_notification(&self, payload: &[u8]) -> Option<ControlResponse> {
        let response = match wire::decode_response(payload) {
            Ok(response) => response,
            Err(err) => {
                warn!("[control] Dropping undecodable notification: {err}");
                return None;
            }
        };

        let mut pending = self.pending.lock().unwrap();
        match pending.as_ref() {
            Some(p) if p.expects == response.kind() => {
                let p = pending.take().unwrap();
                // The caller may have timed out and gone away.
                let _ = p.waiter.send(Ok(response.clone()));
            }
            Some(p) => {
                debug!(
                    "[control] Ignoring {:?} notification while awaiting {:?}",
                    response.kind(),
                    p.expects
                );
            }
            None => {
                debug!("[control] Unsolicited {:?} notification", response.kind());
            }
        }

        Some(response)
    }

    /// Fail the pending request, if any. Called on link drop and teardown.
    pub fn fail_pending(&self, reason: &str) {
        if let Some(p) = self.pending.lock().unwrap().take() {
            let _ = p.waiter.send(Err(Error::ConnectionLost(reason.to_string())));
        }
    }
}
