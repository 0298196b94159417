use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{CellularError, Result};
use crate::ril::{send_and_wait, RilErrno, RilRequest, RilResponse, Transport};

/// PDU-mode SMS submission.
pub struct CellularSms {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
}

impl CellularSms {
    pub fn new(transport: Arc<dyn Transport>, request_timeout: Duration) -> Self {
        Self {
            transport,
            request_timeout,
        }
    }

    /// Submit one hex-encoded PDU and return the network's message reference.
    pub fn send_sms(&self, smsc: Option<&str>, pdu: &str) -> Result<i32> {
        if pdu.is_empty() {
            return Err(CellularError::Parameter);
        }
        let message_ref = send_and_wait(
            self.transport.as_ref(),
            RilRequest::SendSms {
                smsc: smsc.map(str::to_string),
                pdu: pdu.to_string(),
            },
            self.request_timeout,
            |err, resp| match (err, resp) {
                (RilErrno::Success, RilResponse::Sms(sms)) => Ok(sms.message_ref),
                (RilErrno::RequestNotSupported, _) => Err(CellularError::Unsupported),
                _ => Err(CellularError::DeviceError),
            },
        )?;
        debug!(message_ref, "sms submitted");
        Ok(message_ref)
    }
}
