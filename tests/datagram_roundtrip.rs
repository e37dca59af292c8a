//! Datagram send/receive round-trip plus a per-operation endpoint
//! override that bypasses a socket's connected default peer.

mod support;

use std::sync::Arc;
use std::time::Duration;

use ntio_core::endpoint::Endpoint;
use ntio_core::engine::Engine;
use ntio_core::event::Context;
use ntio_core::socket::datagram::{DatagramConfig, DatagramIoOptions, DatagramSocket};

use support::{any_loopback, Flag, Slot, TestEngine};

fn open_socket(as_engine: Arc<dyn Engine>) -> Arc<DatagramSocket> {
    DatagramSocket::open(as_engine, &any_loopback(), DatagramConfig::default()).expect("open datagram socket")
}

fn port_of(socket: &DatagramSocket) -> u16 {
    socket.local_endpoint().expect("local endpoint").as_socket_addr().expect("ip endpoint").port()
}

#[test]
fn connected_send_and_async_receive_round_trip() {
    let engine = TestEngine::start();
    let as_engine = engine.engine.clone() as Arc<dyn Engine>;

    let a = open_socket(as_engine.clone());
    let b = open_socket(as_engine.clone());
    let b_port = port_of(&b);
    a.connect(support::loopback(b_port)).expect("connect a to b");

    let got: Slot<Vec<u8>> = Slot::new();
    let got_cb = got.clone();
    let from: Slot<Endpoint> = Slot::new();
    let from_cb = from.clone();
    let done = Flag::new();
    let done_cb = done.clone();
    b.receive(
        64,
        None,
        None,
        Arc::new(move |ctx: Context| {
            if ctx.is_ok() {
                if let Some(endpoint) = ctx.endpoint.clone() {
                    from_cb.set(endpoint);
                }
                got_cb.set(vec![0u8; ctx.bytes]);
                done_cb.set();
            }
        }),
    );

    let sent = a.send(b"ping", DatagramIoOptions::default()).expect("send");
    assert_eq!(sent, 4);

    assert!(done.wait(Duration::from_secs(2)), "datagram never arrived");
    assert_eq!(got.get().map(|v| v.len()), Some(4));
    assert!(from.get().is_some());
}

#[test]
fn per_operation_endpoint_override_bypasses_connected_peer() {
    let engine = TestEngine::start();
    let as_engine = engine.engine.clone() as Arc<dyn Engine>;

    let a = open_socket(as_engine.clone());
    let decoy = open_socket(as_engine.clone());
    let target = open_socket(as_engine.clone());
    let target_port = port_of(&target);

    // Connect `a` to the decoy, then override the destination for one
    // send so it actually lands on `target` instead.
    a.connect(support::loopback(port_of(&decoy))).expect("connect a to decoy");

    let done = Flag::new();
    let done_cb = done.clone();
    let size: Slot<usize> = Slot::new();
    let size_cb = size.clone();
    target.receive(
        64,
        None,
        None,
        Arc::new(move |ctx: Context| {
            if ctx.is_ok() {
                size_cb.set(ctx.bytes);
                done_cb.set();
            }
        }),
    );

    let sent = a
        .send(
            b"override",
            DatagramIoOptions {
                endpoint: Some(support::loopback(target_port)),
                deadline: None,
            },
        )
        .expect("send with override");
    assert_eq!(sent, 8);

    assert!(done.wait(Duration::from_secs(2)), "target never received the overridden send");
    assert_eq!(size.get(), Some(8));

    let decoy_idle = Flag::new();
    let decoy_idle_cb = decoy_idle.clone();
    decoy.receive(
        64,
        None,
        None,
        Arc::new(move |_ctx: Context| decoy_idle_cb.set()),
    );
    assert!(!decoy_idle.wait(Duration::from_millis(150)), "decoy should never have received the overridden send");
}
