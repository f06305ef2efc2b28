//! Request encoding and response parsing for the supported services.
//!
//! Everything here is pure byte handling; [`crate::UdsClient`] adds the conversation.

use std::time::Duration;

use crate::errors::{Nrc, UdsError};

/// Service identifiers.
pub mod sid {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFORMATION: u8 = 0x14;
    pub const READ_DTC_INFORMATION: u8 = 0x19;
    pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const WRITE_DATA_BY_IDENTIFIER: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const REQUEST_UPLOAD: u8 = 0x35;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Added to a service identifier in its positive response.
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
/// Sub-function bit asking the server not to send a positive response.
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// DiagnosticSessionControl session types.
pub mod session {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
    pub const SAFETY_SYSTEM: u8 = 0x04;
}

/// ECUReset types.
pub mod reset {
    pub const HARD: u8 = 0x01;
    pub const KEY_OFF_ON: u8 = 0x02;
    pub const SOFT: u8 = 0x03;
    pub const ENABLE_RAPID_POWER_SHUTDOWN: u8 = 0x04;
    pub const DISABLE_RAPID_POWER_SHUTDOWN: u8 = 0x05;
}

/// ReadDTCInformation report types.
pub mod dtc_report {
    pub const NUMBER_BY_STATUS_MASK: u8 = 0x01;
    pub const BY_STATUS_MASK: u8 = 0x02;
    pub const SUPPORTED: u8 = 0x0A;
}

/// RoutineControl types.
pub mod routine {
    pub const START: u8 = 0x01;
    pub const STOP: u8 = 0x02;
    pub const REQUEST_RESULTS: u8 = 0x03;
}

/// ControlDTCSetting types.
pub mod dtc_setting {
    pub const ON: u8 = 0x01;
    pub const OFF: u8 = 0x02;
}

/// One diagnostic request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub service: u8,
    pub subfunction: Option<u8>,
    pub data: Vec<u8>,
}

impl Request {
    pub fn new(service: u8) -> Self {
        Self {
            service,
            subfunction: None,
            data: Vec::new(),
        }
    }

    pub fn with_subfunction(mut self, subfunction: u8) -> Self {
        self.subfunction = Some(subfunction);
        self
    }

    pub fn with_data(mut self, data: &[u8]) -> Self {
        self.data.extend_from_slice(data);
        self
    }

    /// Wire payload. Suppression only applies to services with a sub-function.
    pub fn encode(&self, suppress_positive_response: bool) -> Result<Vec<u8>, UdsError> {
        let mut out = Vec::with_capacity(2 + self.data.len());
        out.push(self.service);
        match self.subfunction {
            Some(sub) => {
                let sub = if suppress_positive_response {
                    sub | SUPPRESS_POSITIVE_RESPONSE
                } else {
                    sub
                };
                out.push(sub);
            }
            None if suppress_positive_response => {
                return Err(UdsError::InvalidRequest(
                    "service has no sub-function to suppress a response with",
                ));
            }
            None => {}
        }
        out.extend_from_slice(&self.data);
        Ok(out)
    }
}

/// A positive response with the service identifier stripped of its offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub service: u8,
    /// Everything after the response service identifier.
    pub data: Vec<u8>,
}

impl Response {
    /// Raw payload as it came from the server.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = vec![self.service + POSITIVE_RESPONSE_OFFSET];
        out.extend_from_slice(&self.data);
        out
    }

    fn require(&self, len: usize) -> Result<&[u8], UdsError> {
        if self.data.len() < len {
            return Err(UdsError::MalformedResponse {
                service: self.service,
                reason: "response too short",
            });
        }
        Ok(&self.data)
    }

    /// First data byte, which echoes the sub-function for most services.
    pub fn echo_u8(&self, field: &'static str, expected: u8) -> Result<(), UdsError> {
        let got = self.require(1)?[0];
        if got != expected {
            return Err(UdsError::EchoMismatch {
                field,
                expected: expected.into(),
                got: got.into(),
            });
        }
        Ok(())
    }

    /// Big-endian 16-bit echo at `offset`.
    pub fn echo_u16(&self, field: &'static str, offset: usize, expected: u16) -> Result<(), UdsError> {
        let data = self.require(offset + 2)?;
        let got = u16::from_be_bytes([data[offset], data[offset + 1]]);
        if got != expected {
            return Err(UdsError::EchoMismatch {
                field,
                expected: expected.into(),
                got: got.into(),
            });
        }
        Ok(())
    }
}

/// What the server said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Positive(Response),
    Negative { service: u8, nrc: Nrc },
}

pub fn parse_reply(payload: &[u8]) -> Result<Reply, UdsError> {
    match payload {
        [] => Err(UdsError::MalformedResponse {
            service: 0,
            reason: "empty response",
        }),
        [sid::NEGATIVE_RESPONSE, service, code, ..] => Ok(Reply::Negative {
            service: *service,
            nrc: Nrc::from_byte(*code),
        }),
        [sid::NEGATIVE_RESPONSE, ..] => Err(UdsError::MalformedResponse {
            service: sid::NEGATIVE_RESPONSE,
            reason: "truncated negative response",
        }),
        [rsid, rest @ ..] if *rsid >= POSITIVE_RESPONSE_OFFSET => Ok(Reply::Positive(Response {
            service: rsid - POSITIVE_RESPONSE_OFFSET,
            data: rest.to_vec(),
        })),
        [rsid, ..] => Err(UdsError::MalformedResponse {
            service: *rsid,
            reason: "not a response service identifier",
        }),
    }
}

/// Server timing announced by DiagnosticSessionControl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub p2: Duration,
    pub p2_star: Duration,
}

impl SessionTimings {
    /// `data` starts with the session echo.
    pub fn parse(response: &Response) -> Option<Self> {
        let data = &response.data;
        if data.len() < 5 {
            return None;
        }
        let p2 = u16::from_be_bytes([data[1], data[2]]);
        let p2_star = u16::from_be_bytes([data[3], data[4]]);
        Some(Self {
            p2: Duration::from_millis(p2.into()),
            p2_star: Duration::from_millis(u64::from(p2_star) * 10),
        })
    }
}

/// Reply to reportNumberOfDTCByStatusMask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtcCount {
    pub availability_mask: u8,
    pub format: u8,
    pub count: u16,
}

impl DtcCount {
    pub fn parse(response: &Response) -> Result<Self, UdsError> {
        let data = response.require(5)?;
        Ok(Self {
            availability_mask: data[1],
            format: data[2],
            count: u16::from_be_bytes([data[3], data[4]]),
        })
    }
}

/// One diagnostic trouble code with its status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtc {
    /// 24-bit code.
    pub code: u32,
    pub status: u8,
}

/// Reply to reportDTCByStatusMask and reportSupportedDTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtcReport {
    pub availability_mask: u8,
    pub dtcs: Vec<Dtc>,
}

impl DtcReport {
    pub fn parse(response: &Response) -> Result<Self, UdsError> {
        let data = response.require(2)?;
        let records = &data[2..];
        if !records.len().is_multiple_of(4) {
            return Err(UdsError::MalformedResponse {
                service: response.service,
                reason: "DTC records are 4 bytes each",
            });
        }
        let dtcs = records
            .chunks_exact(4)
            .map(|r| Dtc {
                code: u32::from_be_bytes([0, r[0], r[1], r[2]]),
                status: r[3],
            })
            .collect();
        Ok(Self {
            availability_mask: data[1],
            dtcs,
        })
    }
}

/// Memory region for RequestDownload / RequestUpload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLocation {
    pub address: u64,
    pub size: u64,
    address_len: u8,
    size_len: u8,
}

impl MemoryLocation {
    /// Use the fewest bytes that hold each value.
    pub fn new(address: u64, size: u64) -> Self {
        Self {
            address,
            size,
            address_len: min_len(address),
            size_len: min_len(size),
        }
    }

    /// Fixed field widths in bytes, as some servers require.
    pub fn with_format(mut self, address_len: u8, size_len: u8) -> Result<Self, UdsError> {
        if !(1..=8).contains(&address_len) || !(1..=8).contains(&size_len) {
            return Err(UdsError::InvalidRequest("field width must be 1..=8 bytes"));
        }
        if address_len < min_len(self.address) || size_len < min_len(self.size) {
            return Err(UdsError::InvalidRequest("value does not fit the field width"));
        }
        self.address_len = address_len;
        self.size_len = size_len;
        Ok(self)
    }

    /// addressAndLengthFormatIdentifier followed by address and size.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![(self.size_len << 4) | self.address_len];
        out.extend_from_slice(&self.address.to_be_bytes()[8 - self.address_len as usize..]);
        out.extend_from_slice(&self.size.to_be_bytes()[8 - self.size_len as usize..]);
        out
    }
}

fn min_len(value: u64) -> u8 {
    let bytes = (64 - value.leading_zeros()).div_ceil(8);
    bytes.max(1) as u8
}

/// maxNumberOfBlockLength from a RequestDownload / RequestUpload reply.
pub fn parse_max_block_length(response: &Response) -> Result<u64, UdsError> {
    let data = response.require(1)?;
    let len = (data[0] >> 4) as usize;
    if len == 0 || len > 8 || data.len() < 1 + len {
        return Err(UdsError::MalformedResponse {
            service: response.service,
            reason: "invalid lengthFormatIdentifier",
        });
    }
    Ok(data[1..=len]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// SecurityAccess levels: seeds are requested on odd levels, keys sent on the next even one.
pub fn seed_level(level: u8) -> u8 {
    if level % 2 == 1 {
        level
    } else {
        level.saturating_sub(1)
    }
}

pub fn key_level(level: u8) -> u8 {
    if level % 2 == 0 {
        level
    } else {
        level.saturating_add(1)
    }
}
