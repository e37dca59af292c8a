//! Accept-side behavior with no incoming connections: a deadline expiring
//! with `WOULD_BLOCK`, and an explicit cancellation, neither of which
//! should leave the listener unusable afterward.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ntio_core::engine::Engine;
use ntio_core::error::ErrorKind;
use ntio_core::event::Context;
use ntio_core::session::{ListenerSession, SocketSession};
use ntio_core::socket::listener::{ListenerConfig, ListenerSocket};
use ntio_core::timer::{TimerEvent, TimerOptions, TimerSession};

use support::{any_loopback, Flag, Slot, TestEngine};

struct Quiet;
impl SocketSession for Quiet {}
impl ListenerSession for Quiet {}

fn fresh_listener(as_engine: Arc<dyn Engine>) -> Arc<ListenerSocket> {
    let listener = ListenerSocket::open(as_engine, ListenerConfig::default());
    listener.bind(&any_loopback()).expect("bind");
    listener.listen().expect("listen");
    listener.set_session(Arc::new(Quiet));
    listener
}

#[test]
fn accept_with_no_connection_expires_with_would_block() {
    let engine = TestEngine::start();
    let as_engine = engine.engine.clone() as Arc<dyn Engine>;
    let listener = fresh_listener(as_engine);

    let outcome: Slot<ErrorKind> = Slot::new();
    let outcome_cb = outcome.clone();
    let done = Flag::new();
    let done_cb = done.clone();
    listener.accept(
        Some(Instant::now() + Duration::from_millis(200)),
        None,
        Arc::new(move |ctx: Context| {
            if let Some(err) = ctx.error {
                outcome_cb.set(err.kind());
            }
            done_cb.set();
        }),
    );

    assert!(done.wait(Duration::from_secs(1)), "accept deadline never fired");
    assert_eq!(outcome.get(), Some(ErrorKind::WouldBlock));

    // The listener must still be usable: a second accept with no deadline
    // simply stays pending rather than erroring out immediately.
    let still_pending = Flag::new();
    let still_pending_cb = still_pending.clone();
    listener.accept(
        None,
        None,
        Arc::new(move |_ctx: Context| still_pending_cb.set()),
    );
    assert!(!still_pending.wait(Duration::from_millis(100)));
}

#[test]
fn accept_cancelled_by_token_does_not_leave_listener_dead() {
    let engine = TestEngine::start();
    let as_engine = engine.engine.clone() as Arc<dyn Engine>;
    let listener = fresh_listener(as_engine.clone());

    let outcome: Slot<ErrorKind> = Slot::new();
    let outcome_cb = outcome.clone();
    let done = Flag::new();
    let done_cb = done.clone();
    const ACCEPT_TOKEN: u64 = 42;
    listener.accept(
        None,
        Some(ACCEPT_TOKEN),
        Arc::new(move |ctx: Context| {
            if let Some(err) = ctx.error {
                outcome_cb.set(err.kind());
            }
            done_cb.set();
        }),
    );

    struct CancelAfterDelay {
        listener: Arc<ListenerSocket>,
        token: u64,
    }
    impl TimerSession for CancelAfterDelay {
        fn on_timer(&self, event: TimerEvent) {
            if event == TimerEvent::Deadline {
                self.listener.cancel(self.token);
            }
        }
    }
    let canceller = Arc::new(CancelAfterDelay {
        listener: listener.clone(),
        token: ACCEPT_TOKEN,
    }) as Arc<dyn TimerSession>;
    let _timer = as_engine
        .clone()
        .create_timer(TimerOptions::after(Duration::from_millis(100)), canceller);

    assert!(done.wait(Duration::from_secs(1)), "accept cancellation never fired");
    assert_eq!(outcome.get(), Some(ErrorKind::Cancelled));

    // Listener survives and can still bind a fresh accept afterward.
    let still_pending = Flag::new();
    let still_pending_cb = still_pending.clone();
    listener.accept(
        None,
        None,
        Arc::new(move |_ctx: Context| still_pending_cb.set()),
    );
    assert!(!still_pending.wait(Duration::from_millis(100)));
}
