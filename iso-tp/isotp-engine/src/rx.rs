//! Receive-side reassembly and flow-control decisions.

use core::cmp::min;

use crate::config::{IsoTpConfig, SequenceErrorPolicy};
use crate::errors::{AbortReason, IsoTpError, TimeoutKind};
use crate::pdu::{FlowStatus, Pdu};
use crate::timer::{Clock, Deadline};

/// High-level receive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// No transfer active; waiting for a Single or First Frame.
    Idle,
    /// First Frame accepted; waiting for Consecutive Frames.
    AwaitingConsecutive,
    /// Last payload delivered.
    Complete,
    /// Last segmented transfer ended without completing.
    Aborted(AbortReason),
}

/// Outcome after processing a PDU.
#[derive(Debug, PartialEq, Eq)]
pub enum RxOutcome {
    /// Nothing to send back yet.
    None,
    /// Emit a flow control frame.
    SendFlowControl {
        /// Flow status to transmit back to the sender.
        status: FlowStatus,
        /// Block size for the sender (0 = unlimited).
        block_size: u8,
        /// Encoded STmin value to send (not a `Duration`).
        st_min: u8,
    },
    /// Payload complete.
    Completed(Vec<u8>),
    /// The in-progress transfer was dropped.
    Aborted(AbortReason),
}

struct Reassembly<I> {
    buffer: Vec<u8>,
    expected_len: usize,
    next_sn: u8,
    block_remaining: u8,
    cf_received: usize,
    deadline: Deadline<I>,
}

enum Phase<I> {
    Idle,
    Receiving(Reassembly<I>),
    Complete,
    Aborted(AbortReason),
}

/// Receive state machine for one connection.
///
/// Single Frames are delivered whatever the state; they never disturb a segmented transfer in
/// progress. The caller is responsible for feeding PDUs in arrival order and for sending
/// flow-control frames when [`RxOutcome::SendFlowControl`] is returned.
pub struct Reassembler<I> {
    phase: Phase<I>,
}

impl<I> Default for Reassembler<I> {
    fn default() -> Self {
        Self { phase: Phase::Idle }
    }
}

impl<I: Copy + Ord> Reassembler<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> RxState {
        match &self.phase {
            Phase::Idle => RxState::Idle,
            Phase::Receiving(_) => RxState::AwaitingConsecutive,
            Phase::Complete => RxState::Complete,
            Phase::Aborted(reason) => RxState::Aborted(*reason),
        }
    }

    /// Whether a segmented transfer is in progress.
    pub fn is_receiving(&self) -> bool {
        matches!(self.phase, Phase::Receiving(_))
    }

    /// Bytes accumulated so far and the declared total, while receiving.
    pub fn progress(&self) -> Option<(usize, usize)> {
        match &self.phase {
            Phase::Receiving(r) => Some((r.buffer.len(), r.expected_len)),
            _ => None,
        }
    }

    /// The armed N_Cr deadline, if any.
    pub fn next_deadline(&self) -> Option<I> {
        match &self.phase {
            Phase::Receiving(r) => Some(r.deadline.at),
            _ => None,
        }
    }

    /// Handle an incoming PDU and return actions to take.
    ///
    /// `Err` values are always silent drops: the PDU had no effect on the state.
    pub fn on_pdu<C: Clock<Instant = I>>(
        &mut self,
        cfg: &IsoTpConfig,
        clock: &C,
        now: I,
        pdu: &Pdu<'_>,
    ) -> Result<RxOutcome, IsoTpError> {
        match *pdu {
            Pdu::SingleFrame { data } => self.handle_single(cfg, data),
            Pdu::FirstFrame { len, data } => self.handle_first(cfg, clock, now, len, data),
            Pdu::ConsecutiveFrame { sn, data } => self.handle_consecutive(cfg, clock, now, sn, data),
            Pdu::FlowControl { .. } => Err(IsoTpError::UnexpectedFrame),
        }
    }

    fn handle_single(&mut self, cfg: &IsoTpConfig, data: &[u8]) -> Result<RxOutcome, IsoTpError> {
        if data.len() > cfg.max_payload_len {
            return Err(IsoTpError::UnexpectedFrame);
        }
        if !self.is_receiving() {
            self.phase = Phase::Complete;
        }
        Ok(RxOutcome::Completed(data.to_vec()))
    }

    fn handle_first<C: Clock<Instant = I>>(
        &mut self,
        cfg: &IsoTpConfig,
        clock: &C,
        now: I,
        len: u16,
        data: &[u8],
    ) -> Result<RxOutcome, IsoTpError> {
        if let Phase::Receiving(r) = &self.phase
            && r.cf_received > 0
        {
            tracing::trace!("first frame ignored, reassembly already continued");
            return Err(IsoTpError::UnexpectedFrame);
        }

        let len = len as usize;
        if len > cfg.max_payload_len {
            tracing::debug!(len, "first frame exceeds receive limit, answering overflow");
            return Ok(RxOutcome::SendFlowControl {
                status: FlowStatus::Overflow,
                block_size: 0,
                st_min: 0,
            });
        }

        let mut buffer = Vec::with_capacity(len);
        buffer.extend_from_slice(&data[..min(data.len(), len)]);
        if self.is_receiving() {
            tracing::debug!("first frame replaces an uncontinued reassembly");
        }
        self.phase = Phase::Receiving(Reassembly {
            buffer,
            expected_len: len,
            next_sn: 1,
            block_remaining: cfg.block_size,
            cf_received: 0,
            deadline: Deadline::arm(clock, now, TimeoutKind::NCr, cfg.n_cr),
        });
        Ok(RxOutcome::SendFlowControl {
            status: FlowStatus::ContinueToSend,
            block_size: cfg.block_size,
            st_min: cfg.st_min,
        })
    }

    fn handle_consecutive<C: Clock<Instant = I>>(
        &mut self,
        cfg: &IsoTpConfig,
        clock: &C,
        now: I,
        sn: u8,
        data: &[u8],
    ) -> Result<RxOutcome, IsoTpError> {
        let Phase::Receiving(r) = &mut self.phase else {
            return Err(IsoTpError::UnexpectedFrame);
        };

        if sn != r.next_sn {
            return match cfg.sequence_errors {
                SequenceErrorPolicy::Abort => {
                    let reason = AbortReason::WrongSequence {
                        expected: r.next_sn,
                        got: sn,
                    };
                    tracing::debug!(?reason, "reassembly aborted");
                    self.phase = Phase::Aborted(reason);
                    Ok(RxOutcome::Aborted(reason))
                }
                SequenceErrorPolicy::Ignore => {
                    tracing::trace!(expected = r.next_sn, got = sn, "out-of-order CF dropped");
                    Err(IsoTpError::UnexpectedFrame)
                }
            };
        }

        let chunk = min(data.len(), r.expected_len - r.buffer.len());
        r.buffer.extend_from_slice(&data[..chunk]);
        r.next_sn = (r.next_sn + 1) & 0x0F;
        r.cf_received += 1;
        r.deadline = Deadline::arm(clock, now, TimeoutKind::NCr, cfg.n_cr);

        if r.buffer.len() >= r.expected_len {
            let payload = core::mem::take(&mut r.buffer);
            self.phase = Phase::Complete;
            return Ok(RxOutcome::Completed(payload));
        }

        if cfg.block_size > 0 {
            r.block_remaining = r.block_remaining.saturating_sub(1);
            if r.block_remaining == 0 {
                r.block_remaining = cfg.block_size;
                return Ok(RxOutcome::SendFlowControl {
                    status: FlowStatus::ContinueToSend,
                    block_size: cfg.block_size,
                    st_min: cfg.st_min,
                });
            }
        }

        Ok(RxOutcome::None)
    }

    /// Abort the reassembly if its N_Cr deadline has passed.
    pub fn poll_timeout(&mut self, now: I) -> Option<AbortReason> {
        match &self.phase {
            Phase::Receiving(r) if r.deadline.expired(now) => {
                let reason = AbortReason::Timeout(r.deadline.kind);
                self.phase = Phase::Aborted(reason);
                Some(reason)
            }
            _ => None,
        }
    }

    /// Drop an in-progress reassembly without emitting anything.
    pub fn cancel(&mut self) -> bool {
        if self.is_receiving() {
            self.phase = Phase::Aborted(AbortReason::Cancelled);
            true
        } else {
            false
        }
    }
}
