use isotp_engine::IsoTpError;

/// Negative response codes (ISO 14229-1 Annex A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nrc {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrInvalidFormat,
    ResponseTooLong,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    NoResponseFromSubnetComponent,
    FailurePreventsExecutionOfRequestedAction,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    /// 0x78: the server needs more time; a final response follows.
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    Other(u8),
}

impl Nrc {
    pub fn from_byte(code: u8) -> Self {
        match code {
            0x10 => Nrc::GeneralReject,
            0x11 => Nrc::ServiceNotSupported,
            0x12 => Nrc::SubFunctionNotSupported,
            0x13 => Nrc::IncorrectMessageLengthOrInvalidFormat,
            0x14 => Nrc::ResponseTooLong,
            0x21 => Nrc::BusyRepeatRequest,
            0x22 => Nrc::ConditionsNotCorrect,
            0x24 => Nrc::RequestSequenceError,
            0x25 => Nrc::NoResponseFromSubnetComponent,
            0x26 => Nrc::FailurePreventsExecutionOfRequestedAction,
            0x31 => Nrc::RequestOutOfRange,
            0x33 => Nrc::SecurityAccessDenied,
            0x35 => Nrc::InvalidKey,
            0x36 => Nrc::ExceededNumberOfAttempts,
            0x37 => Nrc::RequiredTimeDelayNotExpired,
            0x70 => Nrc::UploadDownloadNotAccepted,
            0x71 => Nrc::TransferDataSuspended,
            0x72 => Nrc::GeneralProgrammingFailure,
            0x73 => Nrc::WrongBlockSequenceCounter,
            0x78 => Nrc::ResponsePending,
            0x7E => Nrc::SubFunctionNotSupportedInActiveSession,
            0x7F => Nrc::ServiceNotSupportedInActiveSession,
            other => Nrc::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Nrc::GeneralReject => 0x10,
            Nrc::ServiceNotSupported => 0x11,
            Nrc::SubFunctionNotSupported => 0x12,
            Nrc::IncorrectMessageLengthOrInvalidFormat => 0x13,
            Nrc::ResponseTooLong => 0x14,
            Nrc::BusyRepeatRequest => 0x21,
            Nrc::ConditionsNotCorrect => 0x22,
            Nrc::RequestSequenceError => 0x24,
            Nrc::NoResponseFromSubnetComponent => 0x25,
            Nrc::FailurePreventsExecutionOfRequestedAction => 0x26,
            Nrc::RequestOutOfRange => 0x31,
            Nrc::SecurityAccessDenied => 0x33,
            Nrc::InvalidKey => 0x35,
            Nrc::ExceededNumberOfAttempts => 0x36,
            Nrc::RequiredTimeDelayNotExpired => 0x37,
            Nrc::UploadDownloadNotAccepted => 0x70,
            Nrc::TransferDataSuspended => 0x71,
            Nrc::GeneralProgrammingFailure => 0x72,
            Nrc::WrongBlockSequenceCounter => 0x73,
            Nrc::ResponsePending => 0x78,
            Nrc::SubFunctionNotSupportedInActiveSession => 0x7E,
            Nrc::ServiceNotSupportedInActiveSession => 0x7F,
            Nrc::Other(code) => code,
        }
    }
}

impl core::fmt::Display for Nrc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Nrc::Other(code) => write!(f, "NRC 0x{code:02X}"),
            named => write!(f, "{named:?} (0x{:02X})", named.as_byte()),
        }
    }
}

/// Failures of a diagnostic request.
#[derive(Debug, thiserror::Error)]
pub enum UdsError {
    /// The transport failed or timed out underneath the request.
    #[error("transport: {0}")]
    Transport(#[from] IsoTpError),
    /// The server answered with a negative response.
    #[error("service 0x{service:02X} rejected: {nrc}")]
    Negative { service: u8, nrc: Nrc },
    /// A positive response for another service arrived.
    #[error("expected response to service 0x{expected:02X}, got 0x{got:02X}")]
    UnexpectedService { expected: u8, got: u8 },
    /// The response echoed a different sub-function or identifier than requested.
    #[error("{field} echo mismatch: requested 0x{expected:X}, got 0x{got:X}")]
    EchoMismatch {
        field: &'static str,
        expected: u32,
        got: u32,
    },
    /// The response is too short or otherwise cannot be parsed.
    #[error("malformed response to service 0x{service:02X}: {reason}")]
    MalformedResponse { service: u8, reason: &'static str },
    /// ReadDataByIdentifier returned an identifier that was not asked for.
    #[error("unrequested data identifier 0x{0:04X} in response")]
    UnexpectedDataIdentifier(u16),
    /// ReadDataByIdentifier left out an identifier that was asked for.
    #[error("data identifier 0x{0:04X} missing from response")]
    MissingDataIdentifier(u16),
    /// The request cannot be encoded.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
}
