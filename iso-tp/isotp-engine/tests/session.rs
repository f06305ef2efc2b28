//! Session facade over the in-memory bus, under paused tokio time.

mod common;

use std::time::Duration;

use common::init_tracing;
use isotp_engine::{
    CanTx, Channel, IsoTpConfig, IsoTpError, IsoTpReader, IsoTpStack, IsoTpWriter, LinkFrame,
    TargetAddressType, TimeoutKind, VirtualBus,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const REQUEST_ID: u16 = 0x7E0;
const RESPONSE_ID: u16 = 0x7E8;
const FUNCTIONAL_ID: u16 = 0x7DF;

fn tester_channel() -> Channel {
    Channel::normal_11bit(REQUEST_ID, RESPONSE_ID).unwrap()
}

fn ecu_channel() -> Channel {
    Channel::normal_11bit(RESPONSE_ID, REQUEST_ID)
        .unwrap()
        .with_functional(embedded_can::StandardId::new(FUNCTIONAL_ID).unwrap())
}

async fn endpoint(
    bus: &VirtualBus,
    cfg: IsoTpConfig,
    channel: Channel,
) -> (IsoTpStack, IsoTpReader, IsoTpWriter) {
    let (tx, rx) = bus.attach();
    let stack = IsoTpStack::spawn(tx, rx, cfg).unwrap();
    let (reader, writer) = stack.open_connection(channel).await.unwrap();
    (stack, reader, writer)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test(start_paused = true)]
async fn request_and_response_round_trip() {
    init_tracing();
    let bus = VirtualBus::new();
    let (_t, mut t_rx, mut t_tx) = endpoint(&bus, IsoTpConfig::default(), tester_channel()).await;
    let (_e, mut e_rx, mut e_tx) = endpoint(&bus, IsoTpConfig::default(), ecu_channel()).await;

    let request = payload(200);
    let ecu = tokio::spawn(async move {
        let got = e_rx.read().await.unwrap();
        assert_eq!(got.target, TargetAddressType::Physical);
        e_tx.write(&got.payload[..3]).await.unwrap();
        got.payload
    });

    t_tx.write(&request).await.unwrap();
    let response = t_rx.read().await.unwrap();
    assert_eq!(response.payload, request[..3].to_vec());
    assert_eq!(ecu.await.unwrap(), request);
}

#[tokio::test(start_paused = true)]
async fn read_times_out() {
    init_tracing();
    let bus = VirtualBus::new();
    let (_t, mut t_rx, _t_tx) = endpoint(&bus, IsoTpConfig::default(), tester_channel()).await;

    let started = Instant::now();
    let err = t_rx
        .read_with(started + Duration::from_millis(50), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IsoTpError::RequestTimeout));
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn default_read_uses_request_timeout() {
    init_tracing();
    let bus = VirtualBus::new();
    let cfg = IsoTpConfig {
        request_timeout: Duration::from_millis(300),
        ..IsoTpConfig::default()
    };
    let (_t, mut t_rx, _t_tx) = endpoint(&bus, cfg, tester_channel()).await;

    let started = Instant::now();
    assert!(matches!(t_rx.read().await, Err(IsoTpError::RequestTimeout)));
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn cancelled_read_returns_promptly() {
    init_tracing();
    let bus = VirtualBus::new();
    let (_t, mut t_rx, _t_tx) = endpoint(&bus, IsoTpConfig::default(), tester_channel()).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = t_rx
        .read_with(started + Duration::from_secs(10), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, IsoTpError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn write_without_peer_hits_n_bs() {
    init_tracing();
    let bus = VirtualBus::new();
    let (_t, _t_rx, mut t_tx) = endpoint(&bus, IsoTpConfig::default(), tester_channel()).await;

    let err = t_tx.write(&payload(20)).await.unwrap_err();
    assert!(matches!(err, IsoTpError::ProtocolTimeout(TimeoutKind::NBs)));
}

#[tokio::test(start_paused = true)]
async fn single_frame_write_needs_no_peer() {
    init_tracing();
    let bus = VirtualBus::new();
    let (_t, _t_rx, mut t_tx) = endpoint(&bus, IsoTpConfig::default(), tester_channel()).await;

    t_tx.write(&[0x3E, 0x00]).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn peer_overflow_fails_the_write() {
    init_tracing();
    let bus = VirtualBus::new();
    let small = IsoTpConfig {
        max_payload_len: 64,
        ..IsoTpConfig::default()
    };
    let (_t, _t_rx, mut t_tx) = endpoint(&bus, IsoTpConfig::default(), tester_channel()).await;
    let (_e, _e_rx, _e_tx) = endpoint(&bus, small, ecu_channel()).await;

    let err = t_tx.write(&payload(200)).await.unwrap_err();
    assert!(matches!(err, IsoTpError::PeerOverflow));
}

#[tokio::test(start_paused = true)]
async fn consecutive_writes_arrive_in_order() {
    init_tracing();
    let bus = VirtualBus::new();
    let (_t, _t_rx, mut t_tx) = endpoint(&bus, IsoTpConfig::default(), tester_channel()).await;
    let (_e, mut e_rx, _e_tx) = endpoint(&bus, IsoTpConfig::default(), ecu_channel()).await;

    for len in [5, 40, 7, 120] {
        t_tx.write(&payload(len)).await.unwrap();
    }
    for len in [5, 40, 7, 120] {
        assert_eq!(e_rx.read().await.unwrap().payload, payload(len));
    }
    assert!(e_rx.try_read().is_none());
}

#[tokio::test(start_paused = true)]
async fn cancelled_write_frees_the_sender() {
    init_tracing();
    let bus = VirtualBus::new();
    let (_t, _t_rx, mut t_tx) = endpoint(&bus, IsoTpConfig::default(), tester_channel()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = t_tx
        .write_with(&payload(100), Instant::now() + Duration::from_secs(1), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, IsoTpError::Cancelled));

    // The next write starts right away instead of queueing behind the cancelled one.
    t_tx.write(&[0x10, 0x01]).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn functional_request_is_tagged() {
    init_tracing();
    let bus = VirtualBus::new();
    let broadcast = Channel::normal_11bit(FUNCTIONAL_ID, 0x7E9).unwrap();
    let (_f, _f_rx, mut f_tx) = endpoint(&bus, IsoTpConfig::default(), broadcast).await;
    let (_e, mut e_rx, _e_tx) = endpoint(&bus, IsoTpConfig::default(), ecu_channel()).await;

    f_tx.write(&[0x3E, 0x80]).await.unwrap();
    let got = e_rx.read().await.unwrap();
    assert_eq!(got.payload, vec![0x3E, 0x80]);
    assert_eq!(got.target, TargetAddressType::Functional);
}

#[tokio::test(start_paused = true)]
async fn dropping_both_halves_closes_the_connection() {
    init_tracing();
    let bus = VirtualBus::new();
    let (_t, _t_rx, mut t_tx) = endpoint(&bus, IsoTpConfig::default(), tester_channel()).await;
    let (ecu, e_rx, e_tx) = endpoint(&bus, IsoTpConfig::default(), ecu_channel()).await;

    assert!(matches!(
        ecu.open_connection(ecu_channel()).await,
        Err(IsoTpError::AddressInUse)
    ));

    drop(e_rx);
    drop(e_tx);
    let err = t_tx.write(&payload(20)).await.unwrap_err();
    assert!(matches!(err, IsoTpError::ProtocolTimeout(TimeoutKind::NBs)));

    let (mut e_rx, _e_tx) = ecu.open_connection(ecu_channel()).await.unwrap();
    t_tx.write(&payload(20)).await.unwrap();
    assert_eq!(e_rx.read().await.unwrap().payload, payload(20));
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_pending_reads() {
    init_tracing();
    let bus = VirtualBus::new();
    let (stack, mut t_rx, mut t_tx) =
        endpoint(&bus, IsoTpConfig::default(), tester_channel()).await;

    stack.shutdown().await;
    assert!(matches!(t_rx.read().await, Err(IsoTpError::LinkClosed)));
    assert!(matches!(
        t_tx.write(&[0x3E, 0x00]).await,
        Err(IsoTpError::LinkClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn discard_pending_drops_unread_payloads() {
    init_tracing();
    let bus = VirtualBus::new();
    let (_t, _t_rx, mut t_tx) = endpoint(&bus, IsoTpConfig::default(), tester_channel()).await;
    let (_e, mut e_rx, _e_tx) = endpoint(&bus, IsoTpConfig::default(), ecu_channel()).await;

    t_tx.write(&[1, 2]).await.unwrap();
    t_tx.write(&[3, 4]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(e_rx.discard_pending(), 2);
    assert!(e_rx.try_read().is_none());
}

#[derive(Debug, thiserror::Error)]
#[error("bus off")]
struct BusOff;

/// Transmitter whose controller has gone bus-off.
struct BusOffTx;

impl CanTx for BusOffTx {
    type Error = BusOff;

    async fn send(&mut self, _frame: &LinkFrame) -> Result<(), BusOff> {
        Err(BusOff)
    }
}

#[tokio::test(start_paused = true)]
async fn refused_link_send_fails_the_write() {
    init_tracing();
    let bus = VirtualBus::new();
    let (_, rx) = bus.attach();
    let stack = IsoTpStack::spawn(BusOffTx, rx, IsoTpConfig::default()).unwrap();
    let (_r, mut w) = stack.open_connection(tester_channel()).await.unwrap();

    let err = w.write(&[0x10, 0x01]).await.unwrap_err();
    assert!(matches!(err, IsoTpError::Link(_)), "{err:?}");

    let started = Instant::now();
    let err = w.write(&payload(40)).await.unwrap_err();
    assert!(matches!(err, IsoTpError::Link(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_millis(75));
}
