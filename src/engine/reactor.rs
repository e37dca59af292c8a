//! The readiness engine (spec.md §4.1 "Reactor semantics").
//!
//! `Reactor` is this crate's `Poll`: register descriptor interest, block in
//! `poll` up to the next timer deadline or caller timeout, and dispatch
//! `{descriptor, readable|writable|error}` events to the owning socket's
//! strand. Adapted from `mio`'s `Poll`/`Registry` split (`src/poll.rs`,
//! `src/sys/unix/selector/epoll.rs` in the teacher).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;

use super::{Engine, EngineConfig, EventSink, Waiter};
use crate::error::Result;
use crate::event::{Event, Events};
use crate::interest::Interest;
use crate::strand::Strand;
use crate::sys;
use crate::timer::{Timer, TimerOptions, TimerSession, TimerWheel};
use crate::token::Token;

/// Registers I/O resources with a [`Reactor`]. Cloneable and
/// thread-safe; hand clones to sockets so they can (re)register
/// themselves without holding a reference to the whole engine.
#[derive(Clone)]
pub struct Registry {
    selector: Arc<sys::Selector>,
}

impl Registry {
    pub fn register(&self, fd: std::os::unix::io::RawFd, token: Token, interests: Interest) -> Result<()> {
        self.selector.register(fd, token, interests)?;
        Ok(())
    }

    pub fn reregister(&self, fd: std::os::unix::io::RawFd, token: Token, interests: Interest) -> Result<()> {
        self.selector.reregister(fd, token, interests)?;
        Ok(())
    }

    pub fn deregister(&self, fd: std::os::unix::io::RawFd) -> Result<()> {
        self.selector.deregister(fd)?;
        Ok(())
    }

    pub(crate) fn selector(&self) -> &sys::Selector {
        &self.selector
    }
}

struct DispatchTable {
    sinks: RwLock<HashMap<Token, Weak<dyn EventSink>>>,
}

impl DispatchTable {
    fn new() -> Self {
        DispatchTable {
            sinks: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, token: Token, sink: Arc<dyn EventSink>) {
        self.sinks.write().insert(token, Arc::downgrade(&sink));
    }

    fn remove(&self, token: Token) -> Option<Weak<dyn EventSink>> {
        self.sinks.write().remove(&token)
    }

    fn get(&self, token: Token) -> Option<Arc<dyn EventSink>> {
        self.sinks.read().get(&token).and_then(Weak::upgrade)
    }
}

/// The readiness-notification engine.
pub struct Reactor {
    registry: Registry,
    dispatch: DispatchTable,
    timers: parking_lot::Mutex<TimerWheel>,
    next_token: AtomicUsize,
    stopped: AtomicBool,
    config: EngineConfig,
}

impl Reactor {
    pub fn new(config: EngineConfig) -> Result<Arc<Reactor>> {
        let selector = Arc::new(sys::Selector::new()?);
        Ok(Arc::new(Reactor {
            registry: Registry { selector },
            dispatch: DispatchTable::new(),
            timers: parking_lot::Mutex::new(TimerWheel::new()),
            next_token: AtomicUsize::new(1),
            stopped: AtomicBool::new(false),
            config,
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register descriptor interest for `token` (spec.md §4.1 `register`).
    pub fn arm(&self, fd: std::os::unix::io::RawFd, token: Token, interests: Interest) -> Result<()> {
        self.registry.register(fd, token, interests)
    }

    pub fn rearm(&self, fd: std::os::unix::io::RawFd, token: Token, interests: Interest) -> Result<()> {
        self.registry.reregister(fd, token, interests)
    }

    fn next_deadline_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        let timer_timeout = self.timers.lock().next_timeout();
        match (requested, timer_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Block for one `select` round and return the translated events,
    /// without dispatching them. Shared by [`Engine::poll`] and by
    /// [`super::proactor::Proactor`], which needs to drive an actual I/O
    /// operation for each event before handing a synthesized completion
    /// event to the sink.
    pub(crate) fn collect_events(&self, timeout: Option<Duration>) -> Result<Events> {
        let mut events = Events::with_capacity(1024);
        let mut sys_events = Vec::with_capacity(1024);
        let effective_timeout = self.next_deadline_timeout(timeout);

        self.registry.selector.select(&mut sys_events, effective_timeout)?;

        self.timers.lock().fire_expired();

        translate_events(&self.registry.selector, &sys_events, &mut events);
        Ok(events)
    }

    /// Look up and invoke the sink registered for `event.token()`, if it is
    /// still live.
    pub(crate) fn dispatch_event(&self, event: &Event) {
        if let Some(sink) = self.dispatch.get(event.token()) {
            sink.on_event(*event);
        }
    }
}

impl Engine for Reactor {
    fn register(&self, token: Token, sink: Arc<dyn EventSink>) -> Result<()> {
        self.dispatch.insert(token, sink);
        Ok(())
    }

    fn deregister(&self, token: Token) -> Result<()> {
        let weak = self.dispatch.remove(token);
        // Fire the detach confirmation off the poll loop, matching
        // spec.md §5: "only after the engine confirms the descriptor is
        // no longer in its polling set does processSocketDetached fire".
        self.execute(Box::new(move || {
            if let Some(sink) = weak.and_then(|w| w.upgrade()) {
                sink.on_detached();
            }
        }));
        Ok(())
    }

    fn poll(&self, _waiter: &Waiter, timeout: Option<Duration>) -> Result<usize> {
        let events = self.collect_events(timeout)?;
        let n = events.len();
        for event in &events {
            self.dispatch_event(event);
        }
        Ok(n)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn execute(&self, f: Box<dyn FnOnce() + Send>) {
        // "Defer on any worker": spawn a detached worker thread. A fixed
        // thread pool would amortize this better under heavy load; see
        // `DESIGN.md` for why a spawn-per-call was judged adequate here.
        std::thread::spawn(f);
    }

    fn create_strand(self: Arc<Self>) -> Arc<Strand> {
        Strand::new(self as Arc<dyn Engine>)
    }

    fn create_timer(self: Arc<Self>, options: TimerOptions, session: Arc<dyn TimerSession>) -> Arc<Timer> {
        let engine: Arc<dyn Engine> = self.clone();
        self.timers.lock().create(options, session, engine)
    }

    fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn registry(&self) -> Registry {
        self.registry.clone()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn translate_events(_selector: &sys::Selector, sys_events: &[sys::SockEvent], out: &mut Events) {
    use crate::sys::unix_event as raw;
    for ev in sys_events {
        let mut e = Event::new(raw::token(ev));
        if raw::is_readable(ev) {
            e.set_readable();
        }
        if raw::is_writable(ev) {
            e.set_writable();
        }
        if raw::is_error(ev) {
            e.set_error();
        }
        if raw::is_read_closed(ev) {
            e.set_read_closed();
        }
        if raw::is_write_closed(ev) {
            e.set_write_closed();
        }
        out.push(e);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn translate_events(selector: &sys::Selector, sys_events: &[sys::SockEvent], out: &mut Events) {
    use crate::sys::unix_event as raw;
    for ev in sys_events {
        let Some(token) = selector.resolve(ev) else {
            continue;
        };
        let mut e = Event::new(token);
        if raw::is_readable(ev) {
            e.set_readable();
        }
        if raw::is_writable(ev) {
            e.set_writable();
        }
        if raw::is_error(ev) {
            e.set_error();
        }
        if raw::is_read_closed(ev) {
            e.set_read_closed();
        }
        if raw::is_write_closed(ev) {
            e.set_write_closed();
        }
        out.push(e);
    }
}
