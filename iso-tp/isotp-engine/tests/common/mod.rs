#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use embedded_can::{Id, StandardId};
use isotp_engine::{
    Channel, Clock, ConnectionId, Disposition, EngineEvent, IsoTpConfig, IsoTpEngine, LinkFrame,
    TargetAddressType,
};

/// Tester -> ECU physical identifier.
pub const TESTER_ID: u16 = 0x72B;
/// ECU -> tester identifier.
pub const ECU_ID: u16 = 0x73B;
/// Functional (broadcast) request identifier.
pub const FUNCTIONAL_ID: u16 = 0x7DF;

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .with_env_var("ISOTP_LOG")
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn sid(raw: u16) -> Id {
    Id::Standard(StandardId::new(raw).unwrap())
}

pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// Virtual clock: instants are offsets from an arbitrary epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManualClock;

impl Clock for ManualClock {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Duration::ZERO
    }

    fn add(&self, instant: Duration, dur: Duration) -> Duration {
        instant.saturating_add(dur)
    }
}

/// Diagnostic application answering requests the way the target ECU does.
pub fn diagnostic_response(request: &[u8]) -> Vec<u8> {
    match request {
        [0x10, 0x01] => vec![0x50, 0x01, 0x00, 0x32, 0x01, 0xF4],
        [0x19, 0x0A] => {
            let mut rsp = vec![0x59, 0x0A, 0xFF];
            for dtc in 0u8..15 {
                rsp.extend_from_slice(&[0x01, 0x23, dtc, 0x50]);
            }
            rsp
        }
        [0x3E, 0x00] => vec![0x7E, 0x00],
        [sid, ..] => vec![0x7F, *sid, 0x13],
        [] => vec![0x7F, 0x00, 0x13],
    }
}

/// The engine acting as an ECU on one physical + functional channel, driven by virtual time.
pub struct Ecu {
    pub engine: IsoTpEngine<ManualClock>,
    pub conn: ConnectionId,
    pub now: Duration,
    /// Payloads the ECU application received.
    pub received: Vec<(Vec<u8>, TargetAddressType)>,
    /// Send outcomes seen by the application.
    pub send_events: Vec<EngineEvent>,
    /// ECU frames not yet read by the tester, with their emission time.
    wire: VecDeque<(Duration, LinkFrame)>,
    /// Every ECU frame ever emitted.
    pub log: Vec<(Duration, LinkFrame)>,
    pending: VecDeque<Vec<u8>>,
    respond: bool,
}

impl Ecu {
    pub fn new() -> Self {
        Self::with_config(IsoTpConfig::default())
    }

    pub fn with_config(cfg: IsoTpConfig) -> Self {
        init_tracing();
        let mut engine = IsoTpEngine::new(cfg, ManualClock).unwrap();
        let conn = engine
            .open(Channel::new(sid(ECU_ID), sid(TESTER_ID)).with_functional(sid(FUNCTIONAL_ID)))
            .unwrap();
        Self {
            engine,
            conn,
            now: Duration::ZERO,
            received: Vec::new(),
            send_events: Vec::new(),
            wire: VecDeque::new(),
            log: Vec::new(),
            pending: VecDeque::new(),
            respond: true,
        }
    }

    /// Disable the diagnostic application; received payloads are only recorded.
    pub fn silent(mut self) -> Self {
        self.respond = false;
        self
    }

    /// Tester sends a physically addressed frame.
    pub fn tester(&mut self, data: &[u8]) -> Disposition {
        self.inject(TESTER_ID, data)
    }

    /// Tester sends a functionally addressed frame.
    pub fn functional(&mut self, data: &[u8]) -> Disposition {
        self.inject(FUNCTIONAL_ID, data)
    }

    fn inject(&mut self, id: u16, data: &[u8]) -> Disposition {
        let frame = LinkFrame::new(sid(id), data).unwrap();
        let disposition = self.engine.handle_frame(&frame, self.now);
        self.pump();
        disposition
    }

    /// Application-level send, queued while the sender is busy.
    pub fn respond_with(&mut self, payload: Vec<u8>) {
        self.pending.push_back(payload);
        self.start_pending();
    }

    fn start_pending(&mut self) {
        while !self.engine.is_sending(self.conn) {
            let Some(payload) = self.pending.pop_front() else {
                return;
            };
            if self.engine.send(self.conn, &payload, self.now).is_ok() {
                self.drain_transmit();
            }
        }
    }

    fn drain_transmit(&mut self) {
        while let Some(frame) = self.engine.poll_transmit() {
            assert_eq!(frame.id(), sid(ECU_ID));
            self.wire.push_back((self.now, frame));
            self.log.push((self.now, frame));
        }
    }

    fn pump(&mut self) {
        loop {
            self.drain_transmit();
            let Some(event) = self.engine.poll_event() else {
                break;
            };
            match event {
                EngineEvent::Received {
                    payload, target, ..
                } => {
                    let answer = diagnostic_response(&payload);
                    self.received.push((payload, target));
                    if self.respond {
                        self.respond_with(answer);
                    }
                }
                ev @ (EngineEvent::SendCompleted { .. } | EngineEvent::SendAborted { .. }) => {
                    self.send_events.push(ev);
                    self.start_pending();
                }
                EngineEvent::ReceiveAborted { .. } => {}
            }
        }
    }

    /// Let `dur` of virtual time pass, firing every engine deadline on the way.
    pub fn advance(&mut self, dur: Duration) {
        let target = self.now + dur;
        while let Some(at) = self.engine.poll_timeout() {
            if at > target {
                break;
            }
            self.now = self.now.max(at);
            self.engine.poll(self.now);
            self.pump();
        }
        self.now = target;
        self.engine.poll(self.now);
        self.pump();
    }

    /// Tester-side receive: wait 10 ms, then up to 200 ms for the next ECU frame.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        self.recv_frame().map(|(_, f)| f.data().to_vec())
    }

    pub fn recv_frame(&mut self) -> Option<(Duration, LinkFrame)> {
        self.advance(ms(10));
        let limit = self.now + ms(200);
        loop {
            if let Some(entry) = self.wire.pop_front() {
                return Some(entry);
            }
            if self.now >= limit {
                return None;
            }
            let step = match self.engine.poll_timeout() {
                Some(at) if at > self.now && at <= limit => at - self.now,
                _ => limit - self.now,
            };
            self.advance(step);
        }
    }

    /// Read `count` Consecutive Frames, checking their sequence numbers from `first_sn` on.
    pub fn expect_consecutive(&mut self, first_sn: usize, count: usize) {
        for i in 0..count {
            let f = self.recv().expect("consecutive frame");
            assert_eq!(f[0], 0x20 + ((first_sn + i) % 0x10) as u8, "CF #{i}");
        }
    }
}

/// Declared length of a First Frame.
pub fn ff_len(frame: &[u8]) -> usize {
    (((frame[0] & 0x0F) as usize) << 8) | frame[1] as usize
}

/// Number of Consecutive Frames following a First Frame of `total` bytes.
pub fn cf_count(total: usize) -> usize {
    (total - 6).div_ceil(7)
}
