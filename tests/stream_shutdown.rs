//! Ordered-close shutdown: the server shuts its send half down, the
//! client observes EOF, shuts its own send half down in turn, and the
//! server observes EOF back, after which both sides close cleanly.

mod support;

use std::sync::Arc;
use std::time::Duration;

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

fn connected_pair(as_engine: Arc<dyn Engine>) -> (Arc<StreamSocket>, Arc<StreamSocket>, Arc<ListenerSocket>) {
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

    let accepted: Slot<Arc<StreamSocket>> = Slot::new();
    let accepted_poll = accepted.clone();
    let got = support::wait_until(Duration::from_secs(2), || match listener.accept_sync() {
        Ok(stream) => {
            accepted_poll.set(stream);
            true
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => false,
        Err(_) => true,
    });
    assert!(got, "listener never produced an accepted connection");
    let server = accepted.get().expect("accepted stream captured");
    server.set_session(Arc::new(Quiet));
    (client, server, listener)
}

#[test]
fn ordered_close_propagates_eof_both_ways() {
    let engine = TestEngine::start();
    let as_engine = engine.engine.clone() as Arc<dyn Engine>;
    let (client, server, listener) = connected_pair(as_engine);

    server
        .shutdown(Direction::Send, ShutdownMode::Graceful)
        .expect("server shuts send half");

    let client_saw_eof: Slot<ErrorKind> = Slot::new();
    let client_saw_eof_cb = client_saw_eof.clone();
    let client_done = Flag::new();
    let client_done_cb = client_done.clone();
    client.receive(
        1,
        4096,
        IoOptions::default(),
        Arc::new(move |ctx: Context| {
            if let Some(err) = ctx.error {
                client_saw_eof_cb.set(err.kind());
            }
            client_done_cb.set();
        }),
    );
    assert!(client_done.wait(Duration::from_secs(2)), "client never observed the server's half-close");
    assert_eq!(client_saw_eof.get(), Some(ErrorKind::Eof));

    client
        .shutdown(Direction::Send, ShutdownMode::Graceful)
        .expect("client shuts send half");

    let server_saw_eof: Slot<ErrorKind> = Slot::new();
    let server_saw_eof_cb = server_saw_eof.clone();
    let server_done = Flag::new();
    let server_done_cb = server_done.clone();
    server.receive(
        1,
        4096,
        IoOptions::default(),
        Arc::new(move |ctx: Context| {
            if let Some(err) = ctx.error {
                server_saw_eof_cb.set(err.kind());
            }
            server_done_cb.set();
        }),
    );
    assert!(server_done.wait(Duration::from_secs(2)), "server never observed the client's half-close");
    assert_eq!(server_saw_eof.get(), Some(ErrorKind::Eof));

    client.close();
    server.close();
    listener.close();
    assert!(!client.is_open());
    assert!(!server.is_open());
    assert!(!listener.is_open());
}
