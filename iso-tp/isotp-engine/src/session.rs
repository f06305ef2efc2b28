//! Session facade: payload-level reads and writes over an [`IsoTpEngine`] driven by tokio.
//!
//! [`IsoTpStack::spawn`] starts two tasks: a reader forwarding link frames into a queue, and the
//! driver owning the engine. The driver is the only place engine state is touched; readers and
//! writers talk to it over channels. Reads and writes take an explicit deadline and a
//! [`CancellationToken`]; hitting either tears down the associated conversation silently.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::address::{Channel, ConnectionId, TargetAddressType};
use crate::config::IsoTpConfig;
use crate::demux::{Disposition, EngineEvent, IsoTpEngine};
use crate::errors::IsoTpError;
use crate::frame::LinkFrame;
use crate::link::{CanRx, CanTx};
use crate::timer::{Clock, TokioClock};

const FRAME_QUEUE: usize = 256;

/// One reassembled payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub payload: Vec<u8>,
    pub target: TargetAddressType,
}

type OpenReply = Result<(ConnectionId, mpsc::UnboundedReceiver<Received>), IsoTpError>;

enum Command {
    Open {
        channel: Channel,
        reply: oneshot::Sender<OpenReply>,
    },
    Close {
        conn: ConnectionId,
    },
    Write {
        conn: ConnectionId,
        id: u64,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), IsoTpError>>,
    },
    CancelWrite {
        conn: ConnectionId,
        id: u64,
    },
    AbortReceive {
        conn: ConnectionId,
    },
}

/// A running ISO-TP stack bound to one CAN interface.
pub struct IsoTpStack {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    driver: Option<JoinHandle<()>>,
    request_timeout: Duration,
}

impl IsoTpStack {
    /// Validate `cfg` and start the driver tasks on the current tokio runtime.
    pub fn spawn<T: CanTx, R: CanRx>(tx: T, rx: R, cfg: IsoTpConfig) -> Result<Self, IsoTpError> {
        let request_timeout = cfg.request_timeout;
        let engine = IsoTpEngine::new(cfg, TokioClock)?;
        let shutdown = CancellationToken::new();

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        tokio::spawn(read_link(rx, frame_tx, shutdown.child_token()));

        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            engine,
            link: tx,
            conns: HashMap::new(),
        };
        let handle = tokio::spawn(driver.run(frame_rx, command_rx, shutdown.clone()));

        Ok(Self {
            commands,
            shutdown,
            driver: Some(handle),
            request_timeout,
        })
    }

    /// Open a connection and split it into its readable and writable halves.
    ///
    /// The connection closes when both halves have been dropped.
    pub async fn open_connection(
        &self,
        channel: Channel,
    ) -> Result<(IsoTpReader, IsoTpWriter), IsoTpError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Open { channel, reply })
            .map_err(|_| IsoTpError::LinkClosed)?;
        let (conn, inbox) = response.await.map_err(|_| IsoTpError::LinkClosed)??;

        let handle = Arc::new(ConnectionHandle {
            conn,
            commands: self.commands.clone(),
        });
        Ok((
            IsoTpReader {
                handle: handle.clone(),
                inbox,
                timeout: self.request_timeout,
            },
            IsoTpWriter {
                handle,
                next_write: 0,
                timeout: self.request_timeout,
            },
        ))
    }

    /// Stop the driver and wait for it to exit. Pending reads and writes fail with `LinkClosed`.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(driver) = self.driver.take()
            && let Err(err) = driver.await
        {
            tracing::warn!(%err, "session driver panicked");
        }
    }
}

impl Drop for IsoTpStack {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct ConnectionHandle {
    conn: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    fn send(&self, command: Command) -> Result<(), IsoTpError> {
        self.commands
            .send(command)
            .map_err(|_| IsoTpError::LinkClosed)
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close { conn: self.conn });
    }
}

/// Readable half of a connection: yields one reassembled payload per read.
pub struct IsoTpReader {
    handle: Arc<ConnectionHandle>,
    inbox: mpsc::UnboundedReceiver<Received>,
    timeout: Duration,
}

impl IsoTpReader {
    pub fn connection(&self) -> ConnectionId {
        self.handle.conn
    }

    /// Read with the configured request timeout.
    pub async fn read(&mut self) -> Result<Received, IsoTpError> {
        let deadline = Instant::now() + self.timeout;
        self.read_with(deadline, &CancellationToken::new()).await
    }

    /// Wait for the next payload until `deadline` or until `cancel` fires.
    ///
    /// On timeout or cancellation any segmented reception in progress is dropped.
    pub async fn read_with(
        &mut self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Received, IsoTpError> {
        let outcome = tokio::select! {
            biased;
            item = self.inbox.recv() => return item.ok_or(IsoTpError::LinkClosed),
            () = cancel.cancelled() => IsoTpError::Cancelled,
            () = sleep_until(deadline) => IsoTpError::RequestTimeout,
        };
        self.handle.send(Command::AbortReceive {
            conn: self.handle.conn,
        })?;
        Err(outcome)
    }

    /// Payload already delivered and not yet read, if any.
    pub fn try_read(&mut self) -> Option<Received> {
        self.inbox.try_recv().ok()
    }

    /// Throw away payloads delivered but not yet read. Returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.inbox.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Writable half of a connection.
///
/// Writes issued while an earlier one is still being segmented wait their turn.
pub struct IsoTpWriter {
    handle: Arc<ConnectionHandle>,
    next_write: u64,
    timeout: Duration,
}

impl IsoTpWriter {
    pub fn connection(&self) -> ConnectionId {
        self.handle.conn
    }

    /// Write with the configured request timeout.
    pub async fn write(&mut self, payload: &[u8]) -> Result<(), IsoTpError> {
        let deadline = Instant::now() + self.timeout;
        self.write_with(payload, deadline, &CancellationToken::new())
            .await
    }

    /// Segment and transmit `payload`, resolving once the last frame went out.
    ///
    /// Fails with the abort reason if the peer stops the transfer, or with `RequestTimeout` /
    /// `Cancelled`; in the last two cases nothing more is sent for this payload.
    pub async fn write_with(
        &mut self,
        payload: &[u8],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), IsoTpError> {
        let id = self.next_write;
        self.next_write = self.next_write.wrapping_add(1);
        let conn = self.handle.conn;

        let (reply, mut done) = oneshot::channel();
        self.handle.send(Command::Write {
            conn,
            id,
            payload: payload.to_vec(),
            reply,
        })?;

        let outcome = tokio::select! {
            biased;
            res = &mut done => return res.map_err(|_| IsoTpError::LinkClosed)?,
            () = cancel.cancelled() => IsoTpError::Cancelled,
            () = sleep_until(deadline) => IsoTpError::RequestTimeout,
        };
        self.handle.send(Command::CancelWrite { conn, id })?;
        Err(outcome)
    }
}

struct PendingWrite {
    id: u64,
    payload: Vec<u8>,
    reply: oneshot::Sender<Result<(), IsoTpError>>,
}

struct ConnState {
    inbox: mpsc::UnboundedSender<Received>,
    active: Option<PendingWrite>,
    queue: VecDeque<PendingWrite>,
}

struct Driver<T> {
    engine: IsoTpEngine<TokioClock>,
    link: T,
    conns: HashMap<ConnectionId, ConnState>,
}

impl<T: CanTx> Driver<T> {
    async fn run(
        mut self,
        mut frames: mpsc::Receiver<LinkFrame>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) {
        loop {
            self.flush().await;

            let wake = self.engine.poll_timeout();
            let timer = async move {
                match wake {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        let now = self.engine.clock().now();
                        if let Disposition::Unrouted = self.engine.handle_frame(&frame, now) {
                            tracing::trace!(?frame, "no connection for frame");
                        }
                    }
                    None => {
                        tracing::warn!("link reader stopped");
                        break;
                    }
                },
                () = timer => self.engine.poll(self.engine.clock().now()),
            }
        }
        tracing::debug!("session driver stopped");
    }

    /// Put queued frames on the link and react to engine events until both queues are empty.
    ///
    /// Frames are drained before events, so a write only completes once the link has taken its
    /// last frame. A refused frame fails the write it belongs to with the link's error.
    async fn flush(&mut self) {
        loop {
            while let Some(frame) = self.engine.poll_transmit() {
                if let Err(err) = self.link.send(&frame).await {
                    tracing::warn!(%err, ?frame, "link send failed");
                    if let Some(conn) = self.engine.fail_send(&frame) {
                        self.finish_write(conn, Err(IsoTpError::Link(Box::new(err))));
                    }
                }
            }
            let Some(event) = self.engine.poll_event() else {
                break;
            };
            self.on_event(event);
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Open { channel, reply } => {
                let result = self.engine.open(channel).map(|conn| {
                    let (inbox, inbox_rx) = mpsc::unbounded_channel();
                    self.conns.insert(
                        conn,
                        ConnState {
                            inbox,
                            active: None,
                            queue: VecDeque::new(),
                        },
                    );
                    (conn, inbox_rx)
                });
                let _ = reply.send(result);
            }
            Command::Close { conn } => {
                self.engine.close(conn);
                self.conns.remove(&conn);
            }
            Command::Write {
                conn,
                id,
                payload,
                reply,
            } => {
                let Some(state) = self.conns.get_mut(&conn) else {
                    let _ = reply.send(Err(IsoTpError::UnknownConnection));
                    return;
                };
                state.queue.push_back(PendingWrite { id, payload, reply });
                self.start_next(conn);
            }
            Command::CancelWrite { conn, id } => {
                let Some(state) = self.conns.get_mut(&conn) else {
                    return;
                };
                if state.active.as_ref().is_some_and(|w| w.id == id) {
                    state.active = None;
                    self.engine.cancel_send(conn);
                    tracing::debug!(%conn, id, "write cancelled");
                    self.start_next(conn);
                } else {
                    state.queue.retain(|w| w.id != id);
                }
            }
            Command::AbortReceive { conn } => {
                if self.engine.cancel_receive(conn) {
                    tracing::debug!(%conn, "reception cancelled by reader");
                }
            }
        }
    }

    fn on_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Received {
                conn,
                payload,
                target,
            } => {
                if let Some(state) = self.conns.get(&conn) {
                    let _ = state.inbox.send(Received { payload, target });
                }
            }
            EngineEvent::SendCompleted { conn } => self.finish_write(conn, Ok(())),
            EngineEvent::SendAborted { conn, reason } => {
                self.finish_write(conn, Err(reason.into()))
            }
            EngineEvent::ReceiveAborted { conn, reason } => {
                tracing::debug!(%conn, ?reason, "reception aborted");
            }
        }
    }

    fn finish_write(&mut self, conn: ConnectionId, result: Result<(), IsoTpError>) {
        if let Some(write) = self.conns.get_mut(&conn).and_then(|s| s.active.take()) {
            let _ = write.reply.send(result);
        }
        self.start_next(conn);
    }

    /// Start the oldest queued write if the connection's sender is free.
    fn start_next(&mut self, conn: ConnectionId) {
        let Some(state) = self.conns.get_mut(&conn) else {
            return;
        };
        if state.active.is_some() || self.engine.is_sending(conn) {
            return;
        }
        while let Some(write) = state.queue.pop_front() {
            if write.reply.is_closed() {
                continue;
            }
            let now = self.engine.clock().now();
            match self.engine.send(conn, &write.payload, now) {
                Ok(_) => {
                    state.active = Some(write);
                    return;
                }
                Err(err) => {
                    let _ = write.reply.send(Err(err));
                }
            }
        }
    }
}

async fn read_link<R: CanRx>(
    mut rx: R,
    frames: mpsc::Sender<LinkFrame>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Ok(frame) => {
                    if frames.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "link receive failed");
                    break;
                }
            },
        }
    }
}
