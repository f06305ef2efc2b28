//! Transport-layer error types.
//!
//! ISO-TP defines no negative-acknowledge frame: every failure below is invisible on the link. The
//! engine uses these values to decide *what to ignore* and to tell the caller of the session
//! facade why a read or write did not complete.

/// Timeout category identifiers (ISO-TP naming).
///
/// - `N_Bs` bounds the sender's wait for a FlowControl frame after a First Frame (or after a
///   FlowControl(Wait)).
/// - `N_Cr` bounds the receiver's wait for the next Consecutive Frame, and the sender's wait for the
///   FlowControl that opens the next block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Timeout waiting for flow control.
    NBs,
    /// Timeout waiting for the next consecutive frame (or the next block's flow control).
    NCr,
}

impl core::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TimeoutKind::NBs => f.write_str("N_Bs"),
            TimeoutKind::NCr => f.write_str("N_Cr"),
        }
    }
}

/// Reasons a link frame fails to decode into a PDU.
///
/// A decode failure is always dropped silently; it is never answered on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The frame carries fewer bytes than its PCI type requires.
    #[error("frame too short for its PCI type ({len} bytes)")]
    TooShort { len: usize },
    /// The frame is shorter than the mandatory padded DLC.
    #[error("DLC {dlc} below the padded frame length")]
    ShortDlc { dlc: usize },
    /// Single Frame length nibble outside 1..=7.
    #[error("single frame length {0} out of range")]
    InvalidSingleFrameLength(u8),
    /// First Frame length below 8 or above the 12-bit ceiling.
    #[error("first frame length {0} out of range")]
    InvalidFirstFrameLength(u16),
    /// FlowControl status nibble 3..=15.
    #[error("invalid flow status {0:#x}")]
    InvalidFlowStatus(u8),
    /// PCI type nibble above 3.
    #[error("unknown PCI type {0:#x}")]
    UnknownPci(u8),
    /// The PDU does not fit in one classic CAN frame.
    #[error("PDU does not fit in a classic CAN frame")]
    Oversized,
}

/// Why a conversation ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A timing bound expired.
    Timeout(TimeoutKind),
    /// The peer answered with FlowControl(Overflow).
    PeerOverflow,
    /// A functionally addressed FlowControl arrived mid-transfer.
    PeerAbort,
    /// A Consecutive Frame carried an unexpected sequence number.
    WrongSequence { expected: u8, got: u8 },
    /// More FlowControl(Wait) frames than `wft_max` allowed.
    WaitLimitExceeded,
    /// The local caller tore the conversation down.
    Cancelled,
}

impl From<AbortReason> for IsoTpError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Timeout(kind) => IsoTpError::ProtocolTimeout(kind),
            AbortReason::PeerOverflow => IsoTpError::PeerOverflow,
            AbortReason::PeerAbort => IsoTpError::PeerAbort,
            AbortReason::WrongSequence { expected, got } => {
                IsoTpError::WrongSequence { expected, got }
            }
            AbortReason::WaitLimitExceeded => IsoTpError::WaitLimitExceeded,
            AbortReason::Cancelled => IsoTpError::Cancelled,
        }
    }
}

/// Transport-layer errors surfaced by the ISO-TP implementation.
#[derive(Debug, thiserror::Error)]
pub enum IsoTpError {
    /// Decode failure; the frame was dropped.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),
    /// N_Bs / N_Cr expired; the conversation was aborted silently.
    #[error("{0} timeout")]
    ProtocolTimeout(TimeoutKind),
    /// The peer signalled FlowControl(Overflow).
    #[error("peer reported overflow")]
    PeerOverflow,
    /// The peer aborted the transfer with a functionally addressed FlowControl.
    #[error("peer aborted the transfer")]
    PeerAbort,
    /// A valid frame arrived in a state that does not accept it; it was ignored.
    #[error("frame not expected in the current state")]
    UnexpectedFrame,
    /// Sequence number mismatch.
    #[error("wrong sequence number: expected {expected}, got {got}")]
    WrongSequence { expected: u8, got: u8 },
    /// FlowControl(Wait) limit exceeded.
    #[error("flow control wait limit exceeded")]
    WaitLimitExceeded,
    /// Operation attempted while a transfer is active.
    #[error("a transfer is already in progress")]
    NotIdle,
    /// Zero-length payloads cannot be carried.
    #[error("empty payload")]
    EmptyPayload,
    /// Payload exceeds the configured maximum.
    #[error("payload of {0} bytes exceeds the configured maximum")]
    PayloadTooLarge(usize),
    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The connection handle is not (or no longer) open.
    #[error("unknown connection")]
    UnknownConnection,
    /// Another open connection already receives on this identifier.
    #[error("receive identifier already in use")]
    AddressInUse,
    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// The caller's deadline elapsed before the operation completed.
    #[error("request timed out")]
    RequestTimeout,
    /// The engine task or the link has shut down.
    #[error("link closed")]
    LinkClosed,
    /// Backend-specific link failure.
    #[error("link error: {0}")]
    Link(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl IsoTpError {
    /// Whether this error is one the engine swallows (drops the frame, keeps the conversation).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            IsoTpError::MalformedFrame(_) | IsoTpError::UnexpectedFrame
        )
    }
}
