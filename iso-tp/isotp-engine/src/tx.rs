//! Transmit-side segmentation, flow-control handling and STmin pacing.

use core::mem;
use core::time::Duration;

use crate::address::TargetAddressType;
use crate::config::IsoTpConfig;
use crate::errors::{AbortReason, IsoTpError, TimeoutKind};
use crate::frame::Outbox;
use crate::pdu::{CF_MAX_DATA, FF_DATA, FlowStatus, Pdu, SF_MAX_DATA, received_st_min};
use crate::timer::{Clock, Deadline, next_emit_at};

/// Progress indicator returned by every Segmenter step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing to send.
    Idle,
    /// Consecutive Frames are being paced out.
    InFlight,
    /// Waiting for a flow control frame.
    WaitingForFlowControl,
    /// Transfer finished.
    Completed,
    /// Transfer dropped; nothing more will be sent for it.
    Aborted(AbortReason),
}

/// High-level transmit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    /// First Frame (or a full block) sent; waiting for the peer's Flow Control.
    AwaitingFlowControl,
    /// Clear to send; emitting Consecutive Frames.
    Sending,
    Complete,
    Aborted(AbortReason),
}

/// Bookkeeping for an in-flight segmented transfer.
struct TxSession {
    payload: Vec<u8>,
    offset: usize,
    next_sn: u8,
    block_size: u8,
    block_remaining: u8,
    st_min: Duration,
    wait_count: u8,
    negotiated: bool,
}

impl TxSession {
    fn new(payload: Vec<u8>, offset: usize) -> Self {
        Self {
            payload,
            offset,
            next_sn: 1,
            block_size: 0,
            block_remaining: 0,
            st_min: Duration::ZERO,
            wait_count: 0,
            negotiated: false,
        }
    }

    fn is_done(&self) -> bool {
        self.offset >= self.payload.len()
    }
}

enum Phase<I> {
    Idle,
    AwaitingFlowControl {
        session: TxSession,
        deadline: Deadline<I>,
    },
    Sending {
        session: TxSession,
        next_cf_at: I,
    },
    Complete,
    Aborted(AbortReason),
}

/// Transmit state machine for one connection.
pub struct Segmenter<I> {
    phase: Phase<I>,
}

impl<I> Default for Segmenter<I> {
    fn default() -> Self {
        Self { phase: Phase::Idle }
    }
}

impl<I: Copy + Ord> Segmenter<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TxState {
        match &self.phase {
            Phase::Idle => TxState::Idle,
            Phase::AwaitingFlowControl { .. } => TxState::AwaitingFlowControl,
            Phase::Sending { .. } => TxState::Sending,
            Phase::Complete => TxState::Complete,
            Phase::Aborted(reason) => TxState::Aborted(*reason),
        }
    }

    /// A transfer is in progress; `start` would fail with `NotIdle`.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.phase,
            Phase::AwaitingFlowControl { .. } | Phase::Sending { .. }
        )
    }

    /// Once the peer has granted a ContinueToSend, inbound requests are discarded until the
    /// transfer ends.
    pub fn blocks_inbound(&self) -> bool {
        match &self.phase {
            Phase::Sending { .. } => true,
            Phase::AwaitingFlowControl { session, .. } => session.negotiated,
            _ => false,
        }
    }

    /// Next instant at which [`Segmenter::poll`] has something to do.
    pub fn next_deadline(&self) -> Option<I> {
        match &self.phase {
            Phase::AwaitingFlowControl { deadline, .. } => Some(deadline.at),
            Phase::Sending { next_cf_at, .. } => Some(*next_cf_at),
            _ => None,
        }
    }

    /// Begin sending `payload`. Short payloads go out as one Single Frame.
    pub fn start<C: Clock<Instant = I>>(
        &mut self,
        cfg: &IsoTpConfig,
        clock: &C,
        now: I,
        payload: &[u8],
        out: &mut Outbox<'_>,
    ) -> Result<Progress, IsoTpError> {
        if self.is_busy() {
            return Err(IsoTpError::NotIdle);
        }
        if payload.is_empty() {
            return Err(IsoTpError::EmptyPayload);
        }
        if payload.len() > cfg.max_payload_len {
            return Err(IsoTpError::PayloadTooLarge(payload.len()));
        }

        if payload.len() <= SF_MAX_DATA {
            out.push(&Pdu::SingleFrame { data: payload })?;
            self.phase = Phase::Complete;
            return Ok(Progress::Completed);
        }

        out.push(&Pdu::FirstFrame {
            len: payload.len() as u16,
            data: &payload[..FF_DATA],
        })?;
        tracing::debug!(len = payload.len(), "first frame sent, awaiting flow control");
        self.phase = Phase::AwaitingFlowControl {
            session: TxSession::new(payload.to_vec(), FF_DATA),
            deadline: Deadline::arm(clock, now, TimeoutKind::NBs, cfg.n_bs),
        };
        Ok(Progress::WaitingForFlowControl)
    }

    /// Apply a Flow Control received from the peer.
    ///
    /// `Err(UnexpectedFrame)` means the frame was ignored and no timer changed.
    #[allow(clippy::too_many_arguments)]
    pub fn on_flow_control<C: Clock<Instant = I>>(
        &mut self,
        cfg: &IsoTpConfig,
        clock: &C,
        now: I,
        status: FlowStatus,
        block_size: u8,
        st_min: u8,
        target: TargetAddressType,
        out: &mut Outbox<'_>,
    ) -> Result<Progress, IsoTpError> {
        if !self.is_busy() {
            return Err(IsoTpError::UnexpectedFrame);
        }
        if target == TargetAddressType::Functional {
            return Ok(self.abort(AbortReason::PeerAbort));
        }
        if status == FlowStatus::Overflow {
            return Ok(self.abort(AbortReason::PeerOverflow));
        }

        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::AwaitingFlowControl {
                mut session,
                deadline,
            } => match status {
                FlowStatus::ContinueToSend => {
                    session.block_size = block_size;
                    session.block_remaining = block_size;
                    session.st_min = received_st_min(st_min);
                    session.wait_count = 0;
                    session.negotiated = true;
                    tracing::debug!(block_size, st_min, "clear to send");
                    self.phase = Phase::Sending {
                        session,
                        next_cf_at: now,
                    };
                    self.poll(cfg, clock, now, out)
                }
                FlowStatus::Wait => {
                    session.wait_count = session.wait_count.saturating_add(1);
                    if cfg.wft_max.is_some_and(|max| session.wait_count > max) {
                        return Ok(self.abort(AbortReason::WaitLimitExceeded));
                    }
                    let bound = match deadline.kind {
                        TimeoutKind::NBs => cfg.n_bs,
                        TimeoutKind::NCr => cfg.n_cr,
                    };
                    self.phase = Phase::AwaitingFlowControl {
                        session,
                        deadline: Deadline::arm(clock, now, deadline.kind, bound),
                    };
                    Ok(Progress::WaitingForFlowControl)
                }
                FlowStatus::Overflow => Ok(self.abort(AbortReason::PeerOverflow)),
            },
            sending @ Phase::Sending { .. } => {
                tracing::trace!(?status, "flow control ignored mid-block");
                self.phase = sending;
                Err(IsoTpError::UnexpectedFrame)
            }
            other => {
                self.phase = other;
                Err(IsoTpError::UnexpectedFrame)
            }
        }
    }

    /// Emit every Consecutive Frame that is due at `now` and check the flow-control deadline.
    pub fn poll<C: Clock<Instant = I>>(
        &mut self,
        cfg: &IsoTpConfig,
        clock: &C,
        now: I,
        out: &mut Outbox<'_>,
    ) -> Result<Progress, IsoTpError> {
        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::AwaitingFlowControl { session, deadline } => {
                if deadline.expired(now) {
                    return Ok(self.abort(AbortReason::Timeout(deadline.kind)));
                }
                self.phase = Phase::AwaitingFlowControl { session, deadline };
                Ok(Progress::WaitingForFlowControl)
            }
            Phase::Sending {
                mut session,
                mut next_cf_at,
            } => {
                while now >= next_cf_at {
                    let end = (session.offset + CF_MAX_DATA).min(session.payload.len());
                    out.push(&Pdu::ConsecutiveFrame {
                        sn: session.next_sn,
                        data: &session.payload[session.offset..end],
                    })?;
                    session.offset = end;
                    session.next_sn = (session.next_sn + 1) & 0x0F;

                    if session.is_done() {
                        tracing::debug!(len = session.payload.len(), "send complete");
                        self.phase = Phase::Complete;
                        return Ok(Progress::Completed);
                    }

                    if session.block_size > 0 {
                        session.block_remaining -= 1;
                        if session.block_remaining == 0 {
                            tracing::trace!("block sent, awaiting flow control");
                            self.phase = Phase::AwaitingFlowControl {
                                session,
                                deadline: Deadline::arm(clock, now, TimeoutKind::NCr, cfg.n_cr),
                            };
                            return Ok(Progress::WaitingForFlowControl);
                        }
                    }

                    next_cf_at = next_emit_at(clock, now, session.st_min, cfg.st_min_guard);
                }
                self.phase = Phase::Sending {
                    session,
                    next_cf_at,
                };
                Ok(Progress::InFlight)
            }
            Phase::Idle => Ok(Progress::Idle),
            Phase::Complete => {
                self.phase = Phase::Complete;
                Ok(Progress::Completed)
            }
            Phase::Aborted(reason) => {
                self.phase = Phase::Aborted(reason);
                Ok(Progress::Aborted(reason))
            }
        }
    }

    /// Drop an in-progress transfer without emitting anything further.
    pub fn cancel(&mut self) -> bool {
        if self.is_busy() {
            self.abort(AbortReason::Cancelled);
            true
        } else {
            false
        }
    }

    fn abort(&mut self, reason: AbortReason) -> Progress {
        tracing::debug!(?reason, "send aborted");
        self.phase = Phase::Aborted(reason);
        Progress::Aborted(reason)
    }
}
