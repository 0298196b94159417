//! Modem identity queries.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{CellularError, Result};
use crate::ril::{send_and_wait, RilRequest, RilResponse, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialNumberType {
    Sn,
    Imei,
    Imeisv,
    Svn,
}

pub struct CellularInformation {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
}

impl CellularInformation {
    pub fn new(transport: Arc<dyn Transport>, request_timeout: Duration) -> Self {
        Self {
            transport,
            request_timeout,
        }
    }

    pub fn get_revision(&self, max_len: usize) -> Result<String> {
        self.query_text(RilRequest::BasebandVersion, max_len)
    }

    pub fn get_imsi(&self, max_len: usize) -> Result<String> {
        self.query_text(RilRequest::GetImsi, max_len)
    }

    pub fn get_serial_number(&self, kind: SerialNumberType, max_len: usize) -> Result<String> {
        match kind {
            SerialNumberType::Imei => self.query_text(RilRequest::GetImei, max_len),
            SerialNumberType::Sn | SerialNumberType::Imeisv | SerialNumberType::Svn => {
                Err(CellularError::Unsupported)
            }
        }
    }

    pub fn get_manufacturer(&self, _max_len: usize) -> Result<String> {
        Err(CellularError::Unsupported)
    }

    pub fn get_model(&self, _max_len: usize) -> Result<String> {
        Err(CellularError::Unsupported)
    }

    pub fn get_iccid(&self, _max_len: usize) -> Result<String> {
        Err(CellularError::Unsupported)
    }

    fn query_text(&self, request: RilRequest, max_len: usize) -> Result<String> {
        if max_len == 0 {
            return Err(CellularError::Parameter);
        }
        let text = send_and_wait(
            self.transport.as_ref(),
            request,
            self.request_timeout,
            |err, resp| {
                err.into_result().map_err(|_| CellularError::DeviceError)?;
                match resp {
                    RilResponse::Text(s) => Ok(s),
                    RilResponse::Strings(v) => v
                        .into_iter()
                        .next()
                        .flatten()
                        .ok_or(CellularError::DeviceError),
                    _ => Err(CellularError::DeviceError),
                }
            },
        )?;
        Ok(truncate(text, max_len))
    }
}

/// Cut `s` to at most `max_len` bytes on a character boundary.
fn truncate(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
