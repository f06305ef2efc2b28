//! `isotp-engine`: an ISO-TP (ISO 15765-2) transport engine for classic CAN.
//!
//! ISO-TP carries payloads of up to 4095 bytes over 8-byte CAN frames by segmenting them into:
//! - a **Single Frame** (payloads of 1..=7 bytes),
//! - a **First Frame** + **Consecutive Frames** (larger payloads), and
//! - **Flow Control** frames the receiver uses to regulate block size and pacing (STmin).
//!
//! The protocol has no negative acknowledgement. Malformed frames, frames arriving in the wrong
//! state and timer expiries all end silently; the only visible effect is a read or write that
//! does not complete.
//!
//! This crate provides:
//! - the per-connection state machines ([`Reassembler`], [`Segmenter`]) and the frame codec
//!   ([`pdu`]);
//! - [`IsoTpEngine`], a sans-IO multiplexer that owns many connections, is fed link frames and
//!   the current time, and hands back frames to transmit and [`EngineEvent`]s;
//! - a tokio session facade ([`IsoTpStack`], [`IsoTpReader`], [`IsoTpWriter`]) over any
//!   [`CanTx`] / [`CanRx`] pair, with a [`VirtualBus`] for tests.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use isotp_engine::{Channel, IsoTpConfig, IsoTpStack, VirtualBus};
//!
//! # async fn example() -> Result<(), isotp_engine::IsoTpError> {
//! let bus = VirtualBus::new();
//! let (tx, rx) = bus.attach();
//! let stack = IsoTpStack::spawn(tx, rx, IsoTpConfig::default())?;
//!
//! let (mut reader, mut writer) = stack
//!     .open_connection(Channel::normal_11bit(0x7E0, 0x7E8)?)
//!     .await?;
//! writer.write(&[0x22, 0xF1, 0x90]).await?;
//! let response = reader.read().await?;
//! println!("{:02x?}", response.payload);
//! # Ok(()) }
//! ```

pub mod address;
pub mod config;
pub mod demux;
pub mod errors;
pub mod frame;
pub mod link;
pub mod pdu;
pub mod rx;
pub mod session;
pub mod timer;
pub mod tx;

pub use address::{Channel, ConnectionId, TargetAddressType};
pub use config::{IsoTpConfig, SequenceErrorPolicy};
pub use demux::{Disposition, EngineEvent, IsoTpEngine};
pub use errors::{AbortReason, FrameError, IsoTpError, TimeoutKind};
pub use frame::LinkFrame;
pub use link::{CanRx, CanTx, VirtualBus, VirtualBusError, VirtualRx, VirtualTx};
pub use pdu::{FlowStatus, Pdu};
pub use rx::{Reassembler, RxOutcome, RxState};
pub use session::{IsoTpReader, IsoTpStack, IsoTpWriter, Received};
pub use timer::{Clock, TokioClock};
pub use tx::{Progress, Segmenter, TxState};
