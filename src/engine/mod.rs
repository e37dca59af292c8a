//! The engine abstraction: [`reactor`] (readiness) and [`proactor`]
//! (completion) implementations behind one [`Engine`] trait, so socket
//! state machines in [`crate::socket`] do not need to know which backs
//! them.

pub mod proactor;
pub mod reactor;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::event::Events;
use crate::strand::Strand;
use crate::timer::{Timer, TimerOptions, TimerSession};
use crate::token::Token;

/// A per-thread handle registered with an engine. An engine configured
/// with `max_threads > 1` expects one `Waiter` per worker thread driving
/// [`Engine::poll`]/[`Engine::run`] concurrently.
#[derive(Debug, Default)]
pub struct Waiter {
    name: Option<String>,
}

impl Waiter {
    pub fn new() -> Waiter {
        Waiter { name: None }
    }

    pub fn named(name: impl Into<String>) -> Waiter {
        Waiter {
            name: Some(name.into()),
        }
    }
}

/// Construction-time configuration shared by both engine variants.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub metric_name: Option<String>,
    pub auto_attach: bool,
    pub auto_detach: bool,
    pub one_shot: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let min_threads = 1;
        EngineConfig {
            min_threads,
            max_threads: 1,
            metric_name: None,
            auto_attach: true,
            auto_detach: true,
            one_shot: min_threads > 1,
        }
    }
}

/// A socket-side object an engine dispatches events to. Implementors
/// schedule their real handler onto their own [`Strand`] from inside
/// these callbacks — the engine invokes them directly from the poll loop,
/// never blocking on socket-owned work.
pub trait EventSink: Send + Sync {
    /// A readiness or completion event arrived for this sink's token.
    fn on_event(&self, event: crate::event::Event);

    /// The engine has confirmed this sink's token is no longer in its
    /// polling set. Fires exactly once, after which no other callback for
    /// this sink may fire (spec.md §5, "detachment").
    fn on_detached(&self);
}

/// The common surface of both engine variants (spec.md §4.1).
pub trait Engine: Send + Sync {
    /// Register a sink for future events under `token`.
    fn register(&self, token: Token, sink: Arc<dyn EventSink>) -> Result<()>;

    /// Begin detaching `token`. Synchronously removes it from the polling
    /// set, then asynchronously invokes [`EventSink::on_detached`] once
    /// removal is confirmed.
    fn deregister(&self, token: Token) -> Result<()>;

    /// Block up to `timeout` (or the next timer deadline, or forever)
    /// waiting for events, dispatching each to its registered sink.
    fn poll(&self, waiter: &Waiter, timeout: Option<Duration>) -> Result<usize>;

    /// Poll in a loop until [`Engine::stop`] is called.
    fn run(&self, waiter: &Waiter) -> Result<()> {
        while !self.is_stopped() {
            self.poll(waiter, Some(Duration::from_millis(100)))?;
        }
        Ok(())
    }

    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// Defer `f` to run on any worker thread, outside of any strand.
    fn execute(&self, f: Box<dyn FnOnce() + Send>);

    /// Create a new cooperative serialiser bound to this engine.
    fn create_strand(self: Arc<Self>) -> Arc<Strand>;

    /// Reserve a timer slot on this engine's timer wheel, dispatching
    /// masked events to `session`.
    fn create_timer(self: Arc<Self>, options: TimerOptions, session: Arc<dyn TimerSession>) -> Arc<Timer>;

    /// Allocate a previously-unused token for a new registration.
    fn next_token(&self) -> Token;

    /// The descriptor-interest registry backing this engine. Both engine
    /// variants are built over the same selector, so socket code can arm
    /// interest the same way regardless of which one it is running under
    /// (spec.md §9: "operations expose the same public surface; only the
    /// internal arming changes").
    fn registry(&self) -> reactor::Registry;
}

pub(crate) fn drain_events(events: &Events, mut dispatch: impl FnMut(&crate::event::Event)) {
    for event in events {
        dispatch(event);
    }
}
