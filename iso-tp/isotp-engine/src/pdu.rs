//! Encode and decode ISO-TP protocol control information.

use core::time::Duration;
use embedded_can::Id;

use crate::errors::FrameError;
use crate::frame::{CAN_MAX_DLC, LinkFrame};

/// Largest payload a single classic ISO-TP connection can carry (12-bit First Frame length).
pub const MAX_PAYLOAD_LEN: usize = 4095;
/// Payload bytes carried by a Single Frame.
pub const SF_MAX_DATA: usize = 7;
/// Payload bytes carried by a First Frame.
pub const FF_DATA: usize = 6;
/// Payload bytes carried by a Consecutive Frame.
pub const CF_MAX_DATA: usize = 7;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

/// Flow control status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Clear to send more consecutive frames.
    ContinueToSend,
    /// Wait before resuming.
    Wait,
    /// Abort due to overflow.
    Overflow,
}

impl FlowStatus {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x0 => Some(FlowStatus::ContinueToSend),
            0x1 => Some(FlowStatus::Wait),
            0x2 => Some(FlowStatus::Overflow),
            _ => None,
        }
    }

    fn nibble(self) -> u8 {
        match self {
            FlowStatus::ContinueToSend => 0x0,
            FlowStatus::Wait => 0x1,
            FlowStatus::Overflow => 0x2,
        }
    }
}

/// Parsed ISO-TP Protocol Data Unit (PDU).
///
/// Borrowed view over the link frame's bytes; used by the encoder/decoder and by the send/receive
/// state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu<'a> {
    /// Complete payload of 1..=7 bytes.
    SingleFrame { data: &'a [u8] },
    /// Opening frame of a segmented transfer: 12-bit total length and up to 6 bytes.
    FirstFrame { len: u16, data: &'a [u8] },
    /// Continuation carrying a 4-bit sequence number and up to 7 bytes.
    ConsecutiveFrame { sn: u8, data: &'a [u8] },
    /// Flow Control feedback.
    FlowControl {
        /// Flow status from receiver to sender.
        status: FlowStatus,
        /// Block size requested by receiver (0 = unlimited).
        block_size: u8,
        /// STmin (encoded byte form, not a `Duration`).
        st_min: u8,
    },
}

impl Pdu<'_> {
    /// Short PDU-type name for log output.
    pub fn kind(&self) -> &'static str {
        match self {
            Pdu::SingleFrame { .. } => "SF",
            Pdu::FirstFrame { .. } => "FF",
            Pdu::ConsecutiveFrame { .. } => "CF",
            Pdu::FlowControl { .. } => "FC",
        }
    }
}

/// Build a CAN frame representing the given PDU.
///
/// With `padding = Some(b)` the frame is filled up to eight bytes with `b`; otherwise the DLC is
/// the minimum the PDU needs.
pub fn encode(id: Id, pdu: &Pdu<'_>, padding: Option<u8>) -> Result<LinkFrame, FrameError> {
    let mut buf = [0u8; CAN_MAX_DLC];

    let used = match pdu {
        Pdu::SingleFrame { data } => {
            if data.is_empty() || data.len() > SF_MAX_DATA {
                return Err(FrameError::InvalidSingleFrameLength(data.len() as u8));
            }
            buf[0] = (PCI_SINGLE << 4) | data.len() as u8;
            buf[1..=data.len()].copy_from_slice(data);
            1 + data.len()
        }
        Pdu::FirstFrame { len, data } => {
            if (*len as usize) <= SF_MAX_DATA || *len as usize > MAX_PAYLOAD_LEN {
                return Err(FrameError::InvalidFirstFrameLength(*len));
            }
            if data.len() > FF_DATA {
                return Err(FrameError::Oversized);
            }
            buf[0] = (PCI_FIRST << 4) | ((*len >> 8) as u8 & 0x0F);
            buf[1] = (*len & 0xFF) as u8;
            buf[2..2 + data.len()].copy_from_slice(data);
            2 + data.len()
        }
        Pdu::ConsecutiveFrame { sn, data } => {
            if data.is_empty() {
                return Err(FrameError::TooShort { len: 1 });
            }
            if data.len() > CF_MAX_DATA {
                return Err(FrameError::Oversized);
            }
            buf[0] = (PCI_CONSECUTIVE << 4) | (*sn & 0x0F);
            buf[1..=data.len()].copy_from_slice(data);
            1 + data.len()
        }
        Pdu::FlowControl {
            status,
            block_size,
            st_min,
        } => {
            buf[0] = (PCI_FLOW_CONTROL << 4) | status.nibble();
            buf[1] = *block_size;
            buf[2] = *st_min;
            3
        }
    };

    let used = if let Some(pad) = padding {
        buf[used..].fill(pad);
        CAN_MAX_DLC
    } else {
        used
    };

    LinkFrame::new(id, &buf[..used]).ok_or(FrameError::Oversized)
}

/// Decode raw CAN data into a PDU view.
///
/// Structural checks only: the frame must carry every byte its PCI announces. Whether a PDU is
/// acceptable in the current conversation state is the state machines' decision.
pub fn decode(data: &[u8]) -> Result<Pdu<'_>, FrameError> {
    let Some(&pci) = data.first() else {
        return Err(FrameError::TooShort { len: 0 });
    };

    match pci >> 4 {
        PCI_SINGLE => {
            let len = pci & 0x0F;
            if len == 0 || len as usize > SF_MAX_DATA {
                return Err(FrameError::InvalidSingleFrameLength(len));
            }
            let end = 1 + len as usize;
            if data.len() < end {
                return Err(FrameError::TooShort { len: data.len() });
            }
            Ok(Pdu::SingleFrame {
                data: &data[1..end],
            })
        }
        PCI_FIRST => {
            if data.len() < 2 + FF_DATA {
                return Err(FrameError::TooShort { len: data.len() });
            }
            let len = (((pci & 0x0F) as u16) << 8) | data[1] as u16;
            if (len as usize) <= SF_MAX_DATA {
                return Err(FrameError::InvalidFirstFrameLength(len));
            }
            Ok(Pdu::FirstFrame {
                len,
                data: &data[2..2 + FF_DATA],
            })
        }
        PCI_CONSECUTIVE => {
            if data.len() < 2 {
                return Err(FrameError::TooShort { len: data.len() });
            }
            Ok(Pdu::ConsecutiveFrame {
                sn: pci & 0x0F,
                data: &data[1..],
            })
        }
        PCI_FLOW_CONTROL => {
            if data.len() < 3 {
                return Err(FrameError::TooShort { len: data.len() });
            }
            let status = FlowStatus::from_nibble(pci & 0x0F)
                .ok_or(FrameError::InvalidFlowStatus(pci & 0x0F))?;
            Ok(Pdu::FlowControl {
                status,
                block_size: data[1],
                st_min: data[2],
            })
        }
        other => Err(FrameError::UnknownPci(other)),
    }
}

/// Whether a raw STmin byte lies in one of the two defined ranges.
pub fn is_valid_st_min(raw: u8) -> bool {
    matches!(raw, 0x00..=0x7F | 0xF1..=0xF9)
}

/// Convert STmin byte to a Duration, returning None for reserved values.
pub fn st_min_to_duration(raw: u8) -> Option<Duration> {
    match raw {
        0x00..=0x7F => Some(Duration::from_millis(raw as u64)),
        0xF1..=0xF9 => Some(Duration::from_micros((raw as u64 - 0xF0) * 100)),
        _ => None,
    }
}

/// STmin a sender must honour for a byte received from the peer.
///
/// Reserved values are treated as the longest defined separation (0x7F, 127 ms).
pub fn received_st_min(raw: u8) -> Duration {
    st_min_to_duration(raw).unwrap_or(Duration::from_millis(0x7F))
}

/// Encode a Duration into an STmin byte, clamping to the supported range.
pub fn duration_to_st_min(duration: Duration) -> u8 {
    let micros = duration.as_micros();
    if micros == 0 {
        return 0;
    }
    if (100..=900).contains(&micros) && micros.is_multiple_of(100) {
        return 0xF0 + (micros / 100) as u8;
    }
    let millis = duration.as_millis();
    if millis <= 0x7F { millis as u8 } else { 0x7F }
}
