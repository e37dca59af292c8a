//! Shared scaffolding for the integration tests: a running [`Reactor`]
//! driven on its own thread, plus a couple of small waiting helpers since
//! this crate has no async executor to `.await` completions with.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ntio_core::engine::reactor::Reactor;
use ntio_core::engine::{Engine, EngineConfig, Waiter};
use ntio_core::endpoint::Endpoint;

/// A `Reactor` polling on a background thread until dropped.
pub struct TestEngine {
    pub engine: Arc<Reactor>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestEngine {
    pub fn start() -> TestEngine {
        let engine = Reactor::new(EngineConfig::default()).expect("reactor construction");
        let driven = engine.clone();
        let handle = std::thread::spawn(move || {
            let waiter = Waiter::new();
            let _ = driven.run(&waiter);
        });
        TestEngine {
            engine,
            handle: Some(handle),
        }
    }
}

impl Drop for TestEngine {
    fn drop(&mut self) {
        self.engine.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn loopback(port: u16) -> Endpoint {
    Endpoint::Ip(SocketAddr::from(([127, 0, 0, 1], port)))
}

pub fn any_loopback() -> Endpoint {
    loopback(0)
}

/// Poll `predicate` until it's true or `timeout` elapses, sleeping briefly
/// between checks. Tests are driven by callbacks firing on the reactor's
/// own thread, so this is the only way to observe completion from the
/// test thread without building a second notification channel.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// A one-shot flag a closure-based [`ntio_core::session::Operation`]
/// callback can set, with a blocking `wait` for the test thread.
#[derive(Clone, Default)]
pub struct Flag(Arc<AtomicBool>);

impl Flag {
    pub fn new() -> Flag {
        Flag(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.is_set())
    }
}

/// Captures the most recent value handed to a callback, for tests that
/// need to inspect *what* completed, not just *that* something did.
#[derive(Clone)]
pub struct Slot<T>(Arc<Mutex<Option<T>>>);

impl<T: Clone + Send + 'static> Slot<T> {
    pub fn new() -> Slot<T> {
        Slot(Arc::new(Mutex::new(None)))
    }

    pub fn set(&self, value: T) {
        *self.0.lock().unwrap() = Some(value);
    }

    pub fn get(&self) -> Option<T> {
        self.0.lock().unwrap().clone()
    }
}
