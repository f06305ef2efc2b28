//! Classic CAN link frames and the outbound frame queue.

use std::collections::VecDeque;

use embedded_can::{Frame, Id};

use crate::errors::FrameError;
use crate::pdu::{self, Pdu};

/// Classic CAN payload size.
pub const CAN_MAX_DLC: usize = 8;

/// One classic CAN data frame: an arbitration identifier plus 0..=8 payload bytes.
///
/// Immutable once built. Implements [`embedded_can::Frame`] so any driver frame type can be
/// converted with [`LinkFrame::from_frame`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkFrame {
    id: Id,
    len: u8,
    data: [u8; CAN_MAX_DLC],
}

impl LinkFrame {
    /// Build a data frame; `None` when `data` exceeds eight bytes.
    pub fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > CAN_MAX_DLC {
            return None;
        }
        let mut buf = [0u8; CAN_MAX_DLC];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id: id.into(),
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Copy any `embedded-can` data frame. Remote frames are rejected.
    pub fn from_frame<F: Frame>(frame: &F) -> Option<Self> {
        if frame.is_remote_frame() {
            return None;
        }
        Self::new(frame.id(), frame.data())
    }

    /// Arbitration identifier.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Payload length.
    pub fn dlc(&self) -> usize {
        self.len as usize
    }
}

impl Frame for LinkFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        LinkFrame::new(id, data)
    }

    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        None
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.len as usize
    }

    fn data(&self) -> &[u8] {
        LinkFrame::data(self)
    }
}

impl core::fmt::Debug for LinkFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let raw = match self.id {
            Id::Standard(id) => u32::from(id.as_raw()),
            Id::Extended(id) => id.as_raw(),
        };
        write!(f, "{raw:#05x} [")?;
        for (i, b) in self.data().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02x}")?;
        }
        f.write_str("]")
    }
}

/// Encodes PDUs for one transmit identifier and appends them to the engine's frame queue.
pub struct Outbox<'q> {
    id: Id,
    padding: Option<u8>,
    queue: &'q mut VecDeque<LinkFrame>,
}

impl<'q> Outbox<'q> {
    pub fn new(id: Id, padding: Option<u8>, queue: &'q mut VecDeque<LinkFrame>) -> Self {
        Self { id, padding, queue }
    }

    /// Encode and enqueue.
    pub fn push(&mut self, pdu: &Pdu<'_>) -> Result<(), FrameError> {
        let frame = pdu::encode(self.id, pdu, self.padding)?;
        tracing::trace!(?frame, "tx");
        self.queue.push_back(frame);
        Ok(())
    }
}
