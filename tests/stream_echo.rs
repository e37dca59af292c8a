//! End-to-end echo: a client connects to a listener, sends a short
//! payload, a server-side session uppercases it and echoes it back, and
//! both sides observe a clean ordered shutdown.

mod support;

use std::sync::Arc;
use std::time::Duration;

use ntio_core::buf::IoBuf;
use ntio_core::engine::Engine;
use ntio_core::error::ErrorKind;
use ntio_core::event::Context;
use ntio_core::session::{ListenerSession, SocketSession, StreamSession};
use ntio_core::socket::listener::{ListenerConfig, ListenerSocket};
use ntio_core::socket::stream::{IoOptions, StreamConfig, StreamSocket};
use ntio_core::socket::{Direction, ShutdownMode};

use support::{any_loopback, Flag, Slot, TestEngine};

struct Quiet;
impl SocketSession for Quiet {}
impl StreamSession for Quiet {}
impl ListenerSession for Quiet {}

#[test]
fn echo_round_trip_uppercases_and_shuts_down_cleanly() {
    let engine = TestEngine::start();
    let as_engine = engine.engine.clone() as Arc<dyn Engine>;

    let listener = ListenerSocket::open(as_engine.clone(), ListenerConfig::default());
    listener.bind(&any_loopback()).expect("bind");
    listener.listen().expect("listen");
    listener.set_session(Arc::new(Quiet));
    let port = listener
        .local_endpoint()
        .expect("local endpoint")
        .as_socket_addr()
        .expect("ip endpoint")
        .port();

    let client = StreamSocket::open(as_engine.clone(), StreamConfig::default());
    client.set_session(Arc::new(Quiet));

    let connected = Flag::new();
    let connected_cb = connected.clone();
    client
        .connect(
            support::loopback(port),
            Some(std::time::Instant::now() + Duration::from_secs(2)),
            Default::default(),
            Arc::new(move |ctx: Context| {
                if ctx.is_ok() {
                    connected_cb.set();
                }
            }),
        )
        .expect("connect submitted");

    assert!(connected.wait(Duration::from_secs(2)), "client never connected");

    // Drain the server-side accept once it lands; no asynchronous accept
    // callback is registered here, so poll the synchronous path, stashing
    // whichever attempt actually succeeds rather than accepting twice.
    let accepted_slot: Slot<Arc<StreamSocket>> = Slot::new();
    let accepted_slot_poll = accepted_slot.clone();
    let got_accept = support::wait_until(Duration::from_secs(2), || match listener.accept_sync() {
        Ok(stream) => {
            accepted_slot_poll.set(stream);
            true
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => false,
        Err(_) => true,
    });
    assert!(got_accept, "listener never produced an accepted connection");
    let server_stream = accepted_slot.get().expect("an accepted stream should have been captured");
    server_stream.set_session(Arc::new(Quiet));

    // The server echoes back whatever it receives, uppercased, then
    // shuts its send half down.
    let echoed = server_stream.clone();
    let recv_done = Flag::new();
    let recv_done_cb = recv_done.clone();
    let payload_slot: Slot<Vec<u8>> = Slot::new();
    let payload_slot_cb = payload_slot.clone();
    server_stream.receive(
        1,
        4096,
        IoOptions::default(),
        Arc::new(move |ctx: Context| {
            if ctx.is_ok() {
                let mut buf = vec![0u8; ctx.bytes];
                let len = buf.len();
                if echoed.receive_sync(&mut buf, len).is_ok() {
                    payload_slot_cb.set(buf);
                    recv_done_cb.set();
                }
            }
        }),
    );

    let sent = client.send(
        IoBuf::Const(b"hello, world!"),
        IoOptions::default(),
        None,
    );
    assert!(sent.is_ok());

    assert!(recv_done.wait(Duration::from_secs(2)), "server never received client payload");
    let received = payload_slot.get().expect("payload captured");
    assert_eq!(&received, b"hello, world!");

    let upper: Vec<u8> = received.iter().map(|b| b.to_ascii_uppercase()).collect();
    let client_got = Flag::new();
    let client_got_cb = client_got.clone();
    let echo_slot: Slot<Vec<u8>> = Slot::new();
    let echo_slot_cb = echo_slot.clone();
    let client_for_recv = client.clone();
    client.receive(
        1,
        4096,
        IoOptions::default(),
        Arc::new(move |ctx: Context| {
            if ctx.is_ok() {
                let mut buf = vec![0u8; ctx.bytes];
                let len = buf.len();
                if client_for_recv.receive_sync(&mut buf, len).is_ok() {
                    echo_slot_cb.set(buf);
                    client_got_cb.set();
                }
            }
        }),
    );
    let echo_len = upper.len();
    let leaked: &'static [u8] = Box::leak(upper.into_boxed_slice());
    server_stream
        .send(IoBuf::Const(leaked), IoOptions::default(), None)
        .expect("server send");

    assert!(client_got.wait(Duration::from_secs(2)), "client never received the echo");
    let got = echo_slot.get().expect("echo captured");
    assert_eq!(got.len(), echo_len);
    assert_eq!(got, b"HELLO, WORLD!");

    server_stream
        .shutdown(Direction::Send, ShutdownMode::Graceful)
        .expect("server shutdown send");
    client.close();
    server_stream.close();
    listener.close();
}
