//! Connection multiplexing: one receive and one transmit state machine per address pair.
//!
//! [`IsoTpEngine`] is sans-IO. Link frames go in through [`IsoTpEngine::handle_frame`], timers
//! advance through [`IsoTpEngine::poll`], and outbound frames and events are drained with
//! [`IsoTpEngine::poll_transmit`] / [`IsoTpEngine::poll_event`]. Every call takes the caller's
//! notion of `now`, so the same engine runs under a manual clock in tests and under tokio in the
//! session driver.
//!
//! Routing rules:
//! - frames on a connection's `rx_id` are physical and reach both state machines;
//! - frames on a connection's functional identifier only ever deliver Single Frames, or abort a
//!   busy sender when they carry a Flow Control;
//! - once the peer has granted ContinueToSend, inbound requests on that connection are discarded
//!   until the send ends.

use std::collections::{BTreeMap, HashMap, VecDeque};

use embedded_can::Id;

use crate::address::{Channel, ConnectionId, TargetAddressType};
use crate::config::IsoTpConfig;
use crate::errors::{AbortReason, FrameError, IsoTpError};
use crate::frame::{CAN_MAX_DLC, LinkFrame, Outbox};
use crate::pdu::{self, Pdu};
use crate::rx::{Reassembler, RxOutcome, RxState};
use crate::timer::{Clock, earliest};
use crate::tx::{Progress, Segmenter, TxState};

/// Something the engine wants its owner to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A complete payload arrived.
    Received {
        conn: ConnectionId,
        payload: Vec<u8>,
        target: TargetAddressType,
    },
    /// The payload passed to [`IsoTpEngine::send`] was fully transmitted.
    SendCompleted { conn: ConnectionId },
    /// The send ended early; nothing more goes out for it.
    SendAborted {
        conn: ConnectionId,
        reason: AbortReason,
    },
    /// A segmented reception was dropped.
    ReceiveAborted {
        conn: ConnectionId,
        reason: AbortReason,
    },
}

/// What happened to one inbound link frame.
#[derive(Debug)]
pub enum Disposition {
    /// Consumed by at least one connection.
    Accepted,
    /// No open connection listens on the identifier.
    Unrouted,
    /// Dropped without any effect; never answered on the link.
    Ignored(IsoTpError),
}

struct Connection<I> {
    channel: Channel,
    rx: Reassembler<I>,
    tx: Segmenter<I>,
}

/// Sans-IO ISO-TP engine serving any number of connections.
pub struct IsoTpEngine<C: Clock> {
    cfg: IsoTpConfig,
    clock: C,
    next_id: u32,
    connections: BTreeMap<ConnectionId, Connection<C::Instant>>,
    physical: HashMap<Id, ConnectionId>,
    functional: HashMap<Id, Vec<ConnectionId>>,
    transmit: VecDeque<LinkFrame>,
    events: VecDeque<EngineEvent>,
}

impl<C: Clock> IsoTpEngine<C> {
    pub fn new(cfg: IsoTpConfig, clock: C) -> Result<Self, IsoTpError> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            clock,
            next_id: 0,
            connections: BTreeMap::new(),
            physical: HashMap::new(),
            functional: HashMap::new(),
            transmit: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &IsoTpConfig {
        &self.cfg
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Register a connection. Each physical receive identifier belongs to one connection;
    /// functional identifiers may be shared.
    pub fn open(&mut self, channel: Channel) -> Result<ConnectionId, IsoTpError> {
        channel.validate()?;
        if self.physical.contains_key(&channel.rx_id)
            || self.functional.contains_key(&channel.rx_id)
        {
            return Err(IsoTpError::AddressInUse);
        }
        if let Some(fid) = channel.functional_id
            && self.physical.contains_key(&fid)
        {
            return Err(IsoTpError::AddressInUse);
        }

        let conn = ConnectionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.physical.insert(channel.rx_id, conn);
        if let Some(fid) = channel.functional_id {
            self.functional.entry(fid).or_default().push(conn);
        }
        self.connections.insert(
            conn,
            Connection {
                channel,
                rx: Reassembler::new(),
                tx: Segmenter::new(),
            },
        );
        tracing::debug!(%conn, ?channel, "connection opened");
        Ok(conn)
    }

    /// Forget a connection and any conversation it had in progress. Nothing is emitted.
    pub fn close(&mut self, conn: ConnectionId) -> bool {
        let Some(c) = self.connections.remove(&conn) else {
            return false;
        };
        self.physical.remove(&c.channel.rx_id);
        if let Some(fid) = c.channel.functional_id
            && let Some(list) = self.functional.get_mut(&fid)
        {
            list.retain(|&other| other != conn);
            if list.is_empty() {
                self.functional.remove(&fid);
            }
        }
        tracing::debug!(%conn, "connection closed");
        true
    }

    pub fn channel(&self, conn: ConnectionId) -> Option<&Channel> {
        self.connections.get(&conn).map(|c| &c.channel)
    }

    pub fn rx_state(&self, conn: ConnectionId) -> Option<RxState> {
        self.connections.get(&conn).map(|c| c.rx.state())
    }

    pub fn tx_state(&self, conn: ConnectionId) -> Option<TxState> {
        self.connections.get(&conn).map(|c| c.tx.state())
    }

    /// Whether `send` would be refused with `NotIdle`.
    pub fn is_sending(&self, conn: ConnectionId) -> bool {
        self.connections
            .get(&conn)
            .is_some_and(|c| c.tx.is_busy())
    }

    /// Start sending `payload` on `conn`.
    ///
    /// A successful start is always followed by exactly one `SendCompleted` or `SendAborted`
    /// event, unless the send is cancelled or the connection closed first.
    pub fn send(
        &mut self,
        conn: ConnectionId,
        payload: &[u8],
        now: C::Instant,
    ) -> Result<Progress, IsoTpError> {
        let c = self
            .connections
            .get_mut(&conn)
            .ok_or(IsoTpError::UnknownConnection)?;
        let mut out = Outbox::new(c.channel.tx_id, self.cfg.padding, &mut self.transmit);
        let progress = c.tx.start(&self.cfg, &self.clock, now, payload, &mut out)?;
        if progress == Progress::Completed {
            self.events.push_back(EngineEvent::SendCompleted { conn });
        }
        Ok(progress)
    }

    /// Abandon the current send of `conn` silently. No event is produced.
    pub fn cancel_send(&mut self, conn: ConnectionId) -> bool {
        self.connections
            .get_mut(&conn)
            .is_some_and(|c| c.tx.cancel())
    }

    /// Abandon the current segmented reception of `conn` silently. No event is produced.
    pub fn cancel_receive(&mut self, conn: ConnectionId) -> bool {
        self.connections
            .get_mut(&conn)
            .is_some_and(|c| c.rx.cancel())
    }

    /// Abandon the send that `frame` belonged to after the link refused it.
    ///
    /// Returns the connection whose send was dropped. Its pending completion event and its
    /// remaining queued data frames are discarded, so the owner reports the link failure instead
    /// of a success. Flow Control frames belong to receptions and leave every sender untouched.
    pub fn fail_send(&mut self, frame: &LinkFrame) -> Option<ConnectionId> {
        if is_flow_control(frame) {
            return None;
        }
        let tx_id = frame.id();
        let conn = self
            .connections
            .iter()
            .filter(|(_, c)| c.channel.tx_id == tx_id)
            .map(|(&conn, _)| conn)
            .find(|&conn| {
                self.is_sending(conn)
                    || self.events.iter().any(|e| e.send_outcome_of() == Some(conn))
            })?;

        if let Some(c) = self.connections.get_mut(&conn) {
            c.tx.cancel();
        }
        self.events.retain(|e| e.send_outcome_of() != Some(conn));
        self.transmit.retain(|f| f.id() != tx_id || is_flow_control(f));
        tracing::debug!(%conn, "send dropped after link failure");
        Some(conn)
    }

    /// Feed one inbound link frame.
    ///
    /// Expired timers are processed first, so a frame arriving after its deadline meets the
    /// aborted conversation rather than the waiting one.
    pub fn handle_frame(&mut self, frame: &LinkFrame, now: C::Instant) -> Disposition {
        self.poll(now);

        let id = frame.id();
        let listeners: Vec<ConnectionId> = if let Some(&conn) = self.physical.get(&id) {
            vec![conn]
        } else if let Some(list) = self.functional.get(&id) {
            list.clone()
        } else {
            return Disposition::Unrouted;
        };
        let targets: Vec<(ConnectionId, TargetAddressType)> = listeners
            .into_iter()
            .filter_map(|conn| {
                let target = self.connections.get(&conn)?.channel.classify(id)?;
                Some((conn, target))
            })
            .collect();

        tracing::trace!(?frame, "rx");
        if self.cfg.strict_dlc && frame.dlc() < CAN_MAX_DLC {
            let err = FrameError::ShortDlc { dlc: frame.dlc() };
            tracing::trace!(%err, "frame dropped");
            return Disposition::Ignored(err.into());
        }
        let pdu = match pdu::decode(frame.data()) {
            Ok(pdu) => pdu,
            Err(err) => {
                tracing::trace!(%err, "frame dropped");
                return Disposition::Ignored(err.into());
            }
        };

        let mut last_err = None;
        let mut accepted = false;
        for (conn, target) in targets {
            match self.dispatch(conn, &pdu, target, now) {
                Ok(()) => accepted = true,
                Err(err) => {
                    tracing::trace!(%conn, kind = pdu.kind(), %err, "frame ignored");
                    last_err = Some(err);
                }
            }
        }
        match (accepted, last_err) {
            (true, _) => Disposition::Accepted,
            (false, Some(err)) => Disposition::Ignored(err),
            (false, None) => Disposition::Unrouted,
        }
    }

    fn dispatch(
        &mut self,
        conn: ConnectionId,
        pdu: &Pdu<'_>,
        target: TargetAddressType,
        now: C::Instant,
    ) -> Result<(), IsoTpError> {
        let c = self
            .connections
            .get_mut(&conn)
            .ok_or(IsoTpError::UnknownConnection)?;
        let mut out = Outbox::new(c.channel.tx_id, self.cfg.padding, &mut self.transmit);

        if let Pdu::FlowControl {
            status,
            block_size,
            st_min,
        } = *pdu
        {
            let progress = c.tx.on_flow_control(
                &self.cfg,
                &self.clock,
                now,
                status,
                block_size,
                st_min,
                target,
                &mut out,
            )?;
            push_send_outcome(&mut self.events, conn, progress);
            return Ok(());
        }

        if target == TargetAddressType::Functional && !matches!(pdu, Pdu::SingleFrame { .. }) {
            return Err(IsoTpError::UnexpectedFrame);
        }
        if c.tx.blocks_inbound() {
            return Err(IsoTpError::UnexpectedFrame);
        }

        match c.rx.on_pdu(&self.cfg, &self.clock, now, pdu)? {
            RxOutcome::None => {}
            RxOutcome::SendFlowControl {
                status,
                block_size,
                st_min,
            } => out.push(&Pdu::FlowControl {
                status,
                block_size,
                st_min,
            })?,
            RxOutcome::Completed(payload) => {
                tracing::debug!(%conn, len = payload.len(), ?target, "payload received");
                self.events.push_back(EngineEvent::Received {
                    conn,
                    payload,
                    target,
                });
            }
            RxOutcome::Aborted(reason) => {
                self.events
                    .push_back(EngineEvent::ReceiveAborted { conn, reason });
            }
        }
        Ok(())
    }

    /// Fire expired timers and emit every Consecutive Frame due at `now`.
    pub fn poll(&mut self, now: C::Instant) {
        for (&conn, c) in self.connections.iter_mut() {
            if let Some(reason) = c.rx.poll_timeout(now) {
                tracing::debug!(%conn, ?reason, "reception aborted");
                self.events
                    .push_back(EngineEvent::ReceiveAborted { conn, reason });
            }
            if !c.tx.is_busy() {
                continue;
            }
            let mut out = Outbox::new(c.channel.tx_id, self.cfg.padding, &mut self.transmit);
            match c.tx.poll(&self.cfg, &self.clock, now, &mut out) {
                Ok(progress) => push_send_outcome(&mut self.events, conn, progress),
                Err(err) => {
                    tracing::warn!(%conn, %err, "send failed");
                    c.tx.cancel();
                    self.events.push_back(EngineEvent::SendAborted {
                        conn,
                        reason: AbortReason::Cancelled,
                    });
                }
            }
        }
    }

    /// Earliest instant at which [`IsoTpEngine::poll`] has work to do.
    pub fn poll_timeout(&self) -> Option<C::Instant> {
        self.connections.values().fold(None, |acc, c| {
            earliest(acc, earliest(c.rx.next_deadline(), c.tx.next_deadline()))
        })
    }

    /// Next frame to put on the link.
    pub fn poll_transmit(&mut self) -> Option<LinkFrame> {
        self.transmit.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }
}

impl EngineEvent {
    fn send_outcome_of(&self) -> Option<ConnectionId> {
        match *self {
            EngineEvent::SendCompleted { conn } | EngineEvent::SendAborted { conn, .. } => Some(conn),
            _ => None,
        }
    }
}

fn is_flow_control(frame: &LinkFrame) -> bool {
    matches!(pdu::decode(frame.data()), Ok(Pdu::FlowControl { .. }))
}

fn push_send_outcome(events: &mut VecDeque<EngineEvent>, conn: ConnectionId, progress: Progress) {
    match progress {
        Progress::Completed => events.push_back(EngineEvent::SendCompleted { conn }),
        Progress::Aborted(reason) => events.push_back(EngineEvent::SendAborted { conn, reason }),
        Progress::Idle | Progress::InFlight | Progress::WaitingForFlowControl => {}
    }
}

#[cfg(test)]
mod tests {
    use embedded_can::StandardId;

    use super::*;
    use crate::timer::TickClock;

    fn sid(raw: u16) -> Id {
        Id::Standard(StandardId::new(raw).unwrap())
    }

    fn frame(raw: u16, data: &[u8]) -> LinkFrame {
        LinkFrame::new(sid(raw), data).unwrap()
    }

    fn engine() -> (IsoTpEngine<TickClock>, ConnectionId) {
        let mut engine = IsoTpEngine::new(IsoTpConfig::default(), TickClock).unwrap();
        let conn = engine
            .open(Channel::new(sid(0x73B), sid(0x72B)).with_functional(sid(0x7DF)))
            .unwrap();
        (engine, conn)
    }

    #[test]
    fn open_rejects_duplicate_receive_identifier() {
        let (mut engine, _) = engine();
        assert!(matches!(
            engine.open(Channel::new(sid(0x700), sid(0x72B))),
            Err(IsoTpError::AddressInUse)
        ));
        assert!(
            engine
                .open(Channel::new(sid(0x701), sid(0x702)).with_functional(sid(0x7DF)))
                .is_ok()
        );
    }

    #[test]
    fn unrouted_frames_are_reported() {
        let (mut engine, _) = engine();
        assert!(matches!(
            engine.handle_frame(&frame(0x123, &[0x02, 0x10, 0x01, 0, 0, 0, 0, 0]), 0),
            Disposition::Unrouted
        ));
    }

    #[test]
    fn functional_single_frame_is_tagged() {
        let (mut engine, conn) = engine();
        let d = engine.handle_frame(&frame(0x7DF, &[0x02, 0x3E, 0x80, 0, 0, 0, 0, 0]), 0);
        assert!(matches!(d, Disposition::Accepted));
        assert_eq!(
            engine.poll_event(),
            Some(EngineEvent::Received {
                conn,
                payload: vec![0x3E, 0x80],
                target: TargetAddressType::Functional
            })
        );
        assert!(engine.poll_transmit().is_none());
    }

    #[test]
    fn close_drops_state_silently() {
        let (mut engine, conn) = engine();
        engine.handle_frame(&frame(0x72B, &[0x10, 0x0F, 0x22, 0, 0, 0, 0, 0]), 0);
        assert!(engine.poll_transmit().is_some());
        assert!(engine.close(conn));
        engine.poll(1_000_000);
        assert!(engine.poll_event().is_none());
        assert!(engine.poll_timeout().is_none());
        assert!(matches!(
            engine.send(conn, &[1], 0),
            Err(IsoTpError::UnknownConnection)
        ));
    }

    #[test]
    fn single_frame_send_reports_completion() {
        let (mut engine, conn) = engine();
        engine.send(conn, &[0x50, 0x01], 0).unwrap();
        let f = engine.poll_transmit().unwrap();
        assert_eq!(f.id(), sid(0x73B));
        assert_eq!(f.data(), &[0x02, 0x50, 0x01, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA]);
        assert_eq!(engine.poll_event(), Some(EngineEvent::SendCompleted { conn }));
    }

    #[test]
    fn refused_single_frame_drops_its_completion() {
        let (mut engine, conn) = engine();
        engine.send(conn, &[0x50, 0x01], 0).unwrap();
        let f = engine.poll_transmit().unwrap();
        assert_eq!(engine.fail_send(&f), Some(conn));
        assert!(engine.poll_event().is_none());
        assert!(!engine.is_sending(conn));
        assert!(engine.send(conn, &[0x50, 0x03], 0).is_ok());
    }

    #[test]
    fn refused_segmented_send_is_cancelled_but_flow_control_is_not() {
        let (mut engine, conn) = engine();
        engine.send(conn, &[0x11; 30], 0).unwrap();
        let ff = engine.poll_transmit().unwrap();
        engine.handle_frame(&frame(0x72B, &[0x10, 0x0F, 0x22, 0, 0, 0, 0, 0]), 0);
        let fc = engine.poll_transmit().unwrap();
        assert_eq!(fc.data()[0], 0x30);

        assert_eq!(engine.fail_send(&fc), None);
        assert!(engine.is_sending(conn));
        assert_eq!(engine.fail_send(&ff), Some(conn));
        assert!(!engine.is_sending(conn));
        assert!(engine.poll_event().is_none());
        assert_eq!(engine.fail_send(&ff), None);
    }

    #[test]
    fn truncated_first_frame_is_dropped_without_strict_dlc() {
        let cfg = IsoTpConfig {
            strict_dlc: false,
            ..IsoTpConfig::default()
        };
        let mut engine = IsoTpEngine::new(cfg, TickClock).unwrap();
        let conn = engine.open(Channel::new(sid(0x73B), sid(0x72B))).unwrap();

        let d = engine.handle_frame(&frame(0x72B, &[0x10, 0x09, 0x22]), 0);
        assert!(matches!(
            d,
            Disposition::Ignored(IsoTpError::MalformedFrame(FrameError::TooShort { len: 3 }))
        ));
        assert!(engine.poll_transmit().is_none());
        assert_eq!(engine.rx_state(conn), Some(RxState::Idle));
    }
}
