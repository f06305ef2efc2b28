//! `can-uds`: a UDS (ISO 14229) diagnostic client over ISO-TP.
//!
//! [`UdsClient`] wraps one [`isotp_engine`] connection and turns service calls into
//! request/response exchanges:
//! - positive responses can be suppressed for services with a sub-function;
//! - `0x7F <sid> 0x78` (ResponsePending) extends the wait instead of failing;
//! - other negative responses surface as [`UdsError::Negative`];
//! - sub-function and identifier echoes are checked.
//!
//! The transport is silent on failure, so a server that never answers shows up as
//! [`isotp_engine::IsoTpError::RequestTimeout`] inside [`UdsError::Transport`].
//!
//! [`uds29`] has helpers for the 29-bit normal fixed identifier layout.

pub mod client;
pub mod errors;
pub mod services;
pub mod uds29;

pub use client::{UdsClient, UdsConfig};
pub use errors::{Nrc, UdsError};
pub use services::{Dtc, DtcCount, DtcReport, MemoryLocation, Reply, Request, Response, SessionTimings};
