//! The completion engine (spec.md §4.2 "Proactor semantics").
//!
//! Unlike `Reactor`, which only tells a socket "you may now read/write
//! without blocking", `Proactor` performs the syscall itself the instant
//! the underlying descriptor becomes ready and hands the socket a
//! completion describing what actually happened. There is no native Linux
//! completion facility wired up here (that would be `io_uring`); instead
//! this emulates completion semantics on top of the same readiness
//! selector `Reactor` uses, the same technique `ntcd_proactor.t.cpp`'s
//! reference proactor uses on platforms without a native one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;

use super::reactor::Reactor;
use super::{Engine, EngineConfig, EventSink, Waiter};
use crate::error::Result;
use crate::event::Event;
use crate::strand::Strand;
use crate::timer::{Timer, TimerOptions, TimerSession};
use crate::token::Token;

/// Performs the actual I/O for one descriptor once the reactor underneath
/// reports it ready, and reports what happened back as a completion
/// [`Event`]. A stream socket's read side, for instance, implements this
/// by calling `recv` into its pending buffer and reporting `readable` only
/// if bytes were actually delivered (EOF/would-block/error collapse to the
/// appropriate flags instead).
pub trait CompletionSource: Send + Sync {
    /// React to a raw readiness `event` for this source's token by
    /// performing whatever I/O it unblocks, returning the completion event
    /// to dispatch to the matching [`EventSink`] in its place.
    fn drive(&self, event: &Event) -> Event;
}

struct CompletionTable {
    sources: RwLock<HashMap<Token, Weak<dyn CompletionSource>>>,
}

impl CompletionTable {
    fn new() -> Self {
        CompletionTable {
            sources: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, token: Token, source: Arc<dyn CompletionSource>) {
        self.sources.write().insert(token, Arc::downgrade(&source));
    }

    fn remove(&self, token: Token) {
        self.sources.write().remove(&token);
    }

    fn get(&self, token: Token) -> Option<Arc<dyn CompletionSource>> {
        self.sources.read().get(&token).and_then(Weak::upgrade)
    }
}

/// The completion-notification engine. Wraps a [`Reactor`] for descriptor
/// multiplexing and timers, adding a drive step between readiness and
/// dispatch.
pub struct Proactor {
    inner: Arc<Reactor>,
    completions: CompletionTable,
}

impl Proactor {
    pub fn new(config: EngineConfig) -> Result<Arc<Proactor>> {
        Ok(Arc::new(Proactor {
            inner: Reactor::new(config)?,
            completions: CompletionTable::new(),
        }))
    }

    pub fn registry(&self) -> &super::reactor::Registry {
        self.inner.registry()
    }

    /// Associate `source` with `token` so future readiness on it is driven
    /// through [`CompletionSource::drive`] before reaching its sink. Call
    /// this in addition to [`Engine::register`], not instead of it — the
    /// sink registration is what the strand-dispatch side uses.
    pub fn register_completion(&self, token: Token, source: Arc<dyn CompletionSource>) {
        self.completions.insert(token, source);
    }
}

impl Engine for Proactor {
    fn register(&self, token: Token, sink: Arc<dyn EventSink>) -> Result<()> {
        self.inner.register(token, sink)
    }

    fn deregister(&self, token: Token) -> Result<()> {
        self.completions.remove(token);
        self.inner.deregister(token)
    }

    fn poll(&self, _waiter: &Waiter, timeout: Option<Duration>) -> Result<usize> {
        let events = self.inner.collect_events(timeout)?;
        let n = events.len();
        for raw in &events {
            let completion = match self.completions.get(raw.token()) {
                Some(source) => source.drive(raw),
                // No completion source registered (e.g. a listener still
                // mid-setup): fall back to passing the raw readiness
                // event through untouched.
                None => *raw,
            };
            self.inner.dispatch_event(&completion);
        }
        Ok(n)
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    fn execute(&self, f: Box<dyn FnOnce() + Send>) {
        self.inner.execute(f);
    }

    fn create_strand(self: Arc<Self>) -> Arc<Strand> {
        Strand::new(self as Arc<dyn Engine>)
    }

    fn create_timer(self: Arc<Self>, options: TimerOptions, session: Arc<dyn TimerSession>) -> Arc<Timer> {
        self.inner.clone().create_timer(options, session)
    }

    fn next_token(&self) -> Token {
        self.inner.next_token()
    }

    fn registry(&self) -> super::reactor::Registry {
        self.inner.registry().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest::Interest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSink;
    impl EventSink for NullSink {
        fn on_event(&self, _event: Event) {}
        fn on_detached(&self) {}
    }

    struct CountingSource {
        drives: AtomicUsize,
    }
    impl CompletionSource for CountingSource {
        fn drive(&self, event: &Event) -> Event {
            self.drives.fetch_add(1, Ordering::SeqCst);
            *event
        }
    }

    #[test]
    fn falls_back_to_raw_event_without_a_completion_source() {
        let proactor = Proactor::new(EngineConfig::default()).unwrap();
        let token = proactor.next_token();
        proactor
            .register(token, Arc::new(NullSink) as Arc<dyn EventSink>)
            .unwrap();
        // No corresponding descriptor registered with the selector, so a
        // zero-timeout poll should simply return no events rather than
        // panicking on the missing completion source.
        let n = proactor.poll(&Waiter::new(), Some(Duration::from_millis(1))).unwrap();
        assert_eq!(n, 0);
        let _ = Interest::READABLE;
    }
}
