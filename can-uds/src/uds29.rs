//! 29-bit "normal fixed" diagnostic identifiers.
//!
//! Physical requests use `0x18DA_TA_SA`, functional ones `0x18DB_TA_SA`, where `TA` is the
//! target address and `SA` the source address.

use embedded_can::Id;
use isotp_engine::{Channel, IsoTpError};

/// Max 29-bit CAN identifier value.
pub const EXT_ID_MAX: u32 = 0x1FFF_FFFF;
/// Physical addressing base (PDU format `0xDA`).
pub const PHYS_BASE: u32 = 0x18DA_0000;
/// Functional addressing base (PDU format `0xDB`).
pub const FUNC_BASE: u32 = 0x18DB_0000;
/// Bits shared by every identifier of one base.
pub const BASE_MASK: u32 = 0x1FFF_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uds29Kind {
    Physical,
    Functional,
}

/// Parsed 29-bit diagnostic identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uds29Id {
    pub kind: Uds29Kind,
    pub target: u8,
    pub source: u8,
}

impl Uds29Id {
    /// Raw identifier value.
    pub const fn raw(&self) -> u32 {
        encode_id_raw(self.kind, self.target, self.source)
    }

    /// Channel a tester at `source` uses to talk to the node at `target`.
    ///
    /// Only physical identifiers name a single peer.
    pub fn tester_channel(&self) -> Result<Channel, IsoTpError> {
        match self.kind {
            Uds29Kind::Physical => Channel::normal_fixed_29(self.source, self.target),
            Uds29Kind::Functional => Err(IsoTpError::InvalidConfig(
                "functional identifier does not name a peer",
            )),
        }
    }
}

pub const fn encode_id_raw(kind: Uds29Kind, target: u8, source: u8) -> u32 {
    let base = match kind {
        Uds29Kind::Physical => PHYS_BASE,
        Uds29Kind::Functional => FUNC_BASE,
    };
    base | ((target as u32) << 8) | (source as u32)
}

pub const fn decode_id_raw(raw: u32) -> Option<Uds29Id> {
    if (raw & !EXT_ID_MAX) != 0 {
        return None;
    }
    let kind = match raw & BASE_MASK {
        PHYS_BASE => Uds29Kind::Physical,
        FUNC_BASE => Uds29Kind::Functional,
        _ => return None,
    };
    Some(Uds29Id {
        kind,
        target: ((raw >> 8) & 0xFF) as u8,
        source: (raw & 0xFF) as u8,
    })
}

/// Decode an `embedded-can` identifier; 11-bit identifiers never match.
pub fn decode_id(id: Id) -> Option<Uds29Id> {
    match id {
        Id::Extended(ext) => decode_id_raw(ext.as_raw()),
        Id::Standard(_) => None,
    }
}
