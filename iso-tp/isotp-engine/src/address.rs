//! Addressing: which identifiers one connection transmits and listens on.

use embedded_can::{ExtendedId, Id, StandardId};

use crate::errors::IsoTpError;

const NORMAL_FIXED_PHYSICAL: u32 = 0x18DA_0000;
const NORMAL_FIXED_FUNCTIONAL: u32 = 0x18DB_0000;

/// How an inbound frame was addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetAddressType {
    /// 1-to-1 communication (physical addressing).
    Physical,
    /// 1-to-n communication (functional addressing).
    Functional,
}

/// Identifiers of one ISO-TP connection, seen from the local node.
///
/// `tx_id` carries everything we send (data and our Flow Control). `rx_id` carries everything
/// the peer sends physically. `functional_id`, when set, is the broadcast identifier the peer may
/// also use to reach us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    pub tx_id: Id,
    pub rx_id: Id,
    pub functional_id: Option<Id>,
}

impl Channel {
    /// Physical pair only.
    pub fn new(tx_id: impl Into<Id>, rx_id: impl Into<Id>) -> Self {
        Self {
            tx_id: tx_id.into(),
            rx_id: rx_id.into(),
            functional_id: None,
        }
    }

    /// Also listen on a functional identifier.
    pub fn with_functional(mut self, id: impl Into<Id>) -> Self {
        self.functional_id = Some(id.into());
        self
    }

    /// Normal 11-bit addressing from raw identifiers.
    pub fn normal_11bit(tx: u16, rx: u16) -> Result<Self, IsoTpError> {
        Ok(Self::new(std_id(tx)?, std_id(rx)?))
    }

    /// Normal fixed 29-bit addressing between `source` (us) and `target` (the peer).
    ///
    /// Physical identifiers use the `0x18DA_TTSS` layout. The functional identifier the peer
    /// would use to reach us is `0x18DB_SS_TT`.
    pub fn normal_fixed_29(source: u8, target: u8) -> Result<Self, IsoTpError> {
        let tx = fixed_id(NORMAL_FIXED_PHYSICAL, target, source)?;
        let rx = fixed_id(NORMAL_FIXED_PHYSICAL, source, target)?;
        let functional = fixed_id(NORMAL_FIXED_FUNCTIONAL, source, target)?;
        Ok(Self::new(tx, rx).with_functional(functional))
    }

    /// The identifiers must be pairwise distinct.
    pub fn validate(&self) -> Result<(), IsoTpError> {
        if self.tx_id == self.rx_id {
            return Err(IsoTpError::InvalidConfig("tx and rx identifiers are equal"));
        }
        if let Some(fid) = self.functional_id
            && (fid == self.rx_id || fid == self.tx_id)
        {
            return Err(IsoTpError::InvalidConfig(
                "functional identifier collides with a physical one",
            ));
        }
        Ok(())
    }

    /// Classify an inbound identifier against this channel.
    pub fn classify(&self, id: Id) -> Option<TargetAddressType> {
        if id == self.rx_id {
            Some(TargetAddressType::Physical)
        } else if Some(id) == self.functional_id {
            Some(TargetAddressType::Functional)
        } else {
            None
        }
    }
}

fn std_id(raw: u16) -> Result<Id, IsoTpError> {
    StandardId::new(raw)
        .map(Id::Standard)
        .ok_or(IsoTpError::InvalidConfig("11-bit identifier out of range"))
}

fn fixed_id(base: u32, target: u8, source: u8) -> Result<Id, IsoTpError> {
    let raw = base | ((target as u32) << 8) | source as u32;
    ExtendedId::new(raw)
        .map(Id::Extended)
        .ok_or(IsoTpError::InvalidConfig("29-bit identifier out of range"))
}

/// Handle for one open connection inside an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u32);

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}
