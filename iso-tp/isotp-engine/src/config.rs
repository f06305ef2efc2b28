//! ISO-TP configuration container.

use core::time::Duration;

use crate::errors::IsoTpError;
use crate::pdu::{self, MAX_PAYLOAD_LEN};

/// What the Reassembler does with a Consecutive Frame carrying the wrong sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceErrorPolicy {
    /// Abort the reception silently; later frames of that transfer are unexpected.
    #[default]
    Abort,
    /// Drop the frame and keep waiting; the N_Cr timer is not reset.
    Ignore,
}

/// Configuration shared by every connection of an engine.
#[derive(Debug, Clone)]
pub struct IsoTpConfig {
    /// Timeout waiting for flow control after First Frame (or after a Wait).
    pub n_bs: Duration,
    /// Timeout waiting for the next Consecutive Frame, or for the FC opening the next block.
    pub n_cr: Duration,
    /// Default deadline for facade reads and writes.
    pub request_timeout: Duration,
    /// Optional padding byte for transmitted frames (None = minimum DLC).
    pub padding: Option<u8>,
    /// Block size advertised in emitted Flow Control frames (0 = unlimited).
    pub block_size: u8,
    /// STmin advertised in emitted Flow Control frames, raw byte form.
    pub st_min: u8,
    /// Margin added to the peer's STmin when pacing Consecutive Frames.
    pub st_min_guard: Duration,
    /// Maximum number of FlowControl(Wait) accepted per transfer (None = unlimited).
    pub wft_max: Option<u8>,
    /// Maximum application payload length accepted, in either direction.
    pub max_payload_len: usize,
    /// Treat received frames with DLC below 8 as malformed.
    pub strict_dlc: bool,
    /// Handling of out-of-order Consecutive Frames.
    pub sequence_errors: SequenceErrorPolicy,
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            n_bs: Duration::from_millis(75),
            n_cr: Duration::from_millis(150),
            request_timeout: Duration::from_secs(1),
            padding: Some(0xAA),
            block_size: 0,
            st_min: 0x14,
            st_min_guard: Duration::from_micros(500),
            wft_max: None,
            max_payload_len: MAX_PAYLOAD_LEN,
            strict_dlc: true,
            sequence_errors: SequenceErrorPolicy::Abort,
        }
    }
}

impl IsoTpConfig {
    /// Reject limits the engine cannot honour.
    pub fn validate(&self) -> Result<(), IsoTpError> {
        if self.max_payload_len == 0 || self.max_payload_len > MAX_PAYLOAD_LEN {
            return Err(IsoTpError::InvalidConfig("max_payload_len must be 1..=4095"));
        }
        if !pdu::is_valid_st_min(self.st_min) {
            return Err(IsoTpError::InvalidConfig("st_min is a reserved value"));
        }
        if self.n_bs.is_zero() || self.n_cr.is_zero() {
            return Err(IsoTpError::InvalidConfig("N_Bs and N_Cr must be non-zero"));
        }
        if self.st_min_guard >= Duration::from_millis(2) {
            return Err(IsoTpError::InvalidConfig("st_min_guard must stay below 2 ms"));
        }
        Ok(())
    }

    /// Builder-style setter for the advertised Flow Control parameters.
    pub fn with_flow_control(mut self, block_size: u8, st_min: u8) -> Self {
        self.block_size = block_size;
        self.st_min = st_min;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_target_timing() {
        let cfg = IsoTpConfig::default();
        assert_eq!(cfg.n_bs, Duration::from_millis(75));
        assert_eq!(cfg.n_cr, Duration::from_millis(150));
        assert_eq!(cfg.padding, Some(0xAA));
        assert_eq!(cfg.sequence_errors, SequenceErrorPolicy::Abort);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let cfg = IsoTpConfig {
            max_payload_len: 4096,
            ..IsoTpConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = IsoTpConfig::default().with_flow_control(0, 0x80);
        assert!(matches!(cfg.validate(), Err(IsoTpError::InvalidConfig(_))));

        let cfg = IsoTpConfig::default().with_flow_control(4, 0xF5);
        assert!(cfg.validate().is_ok());

        let cfg = IsoTpConfig {
            n_cr: Duration::ZERO,
            ..IsoTpConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
