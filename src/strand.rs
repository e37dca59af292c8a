//! The cooperative serialiser: a FIFO functor queue guaranteeing
//! non-concurrent execution of everything submitted to one socket.
//!
//! Grounded on `ntcs_strand.cpp`'s `Strand::invoke`, which offers a greedy
//! and a fair algorithm behind a compile-time switch and defaults to
//! greedy because benchmarking showed roughly 8x the throughput (2M vs
//! 250K functors/sec), concentrated on fewer threads. This crate keeps
//! that tradeoff but expresses it as a runtime [`StrandPolicy`] rather
//! than a compile-time constant.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::engine::Engine;

type Functor = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT_STRAND: Cell<usize> = const { Cell::new(0) };
}

/// Which draining discipline a [`Strand`] uses once submitted to its
/// executor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StrandPolicy {
    /// Drain the whole queue before yielding the thread. Maximises
    /// throughput at the cost of fairness; the default, matching the
    /// original's own benchmarked choice.
    Greedy,
    /// Run exactly one functor, then resubmit if more remain. Spreads
    /// work across more threads at a throughput cost.
    Fair,
}

/// A FIFO functor queue guaranteeing at most one thread executes a given
/// strand's functors at any instant.
pub struct Strand {
    id: usize,
    queue: Mutex<VecDeque<Functor>>,
    pending: AtomicBool,
    engine: Weak<dyn Engine>,
    policy: StrandPolicy,
}

impl Strand {
    pub fn new(engine: Arc<dyn Engine>) -> Arc<Strand> {
        Strand::with_policy(engine, StrandPolicy::Greedy)
    }

    pub fn with_policy(engine: Arc<dyn Engine>, policy: StrandPolicy) -> Arc<Strand> {
        Arc::new(Strand {
            id: next_id(),
            queue: Mutex::new(VecDeque::new()),
            pending: AtomicBool::new(false),
            engine: Arc::downgrade(&engine),
            policy,
        })
    }

    /// True if the calling thread is currently draining this exact strand
    /// (i.e. a functor running on this strand may safely re-enter
    /// `execute` without risking re-entering the drain loop itself).
    pub fn is_current(self: &Arc<Self>) -> bool {
        CURRENT_STRAND.with(|c| c.get() == self.id)
    }

    /// Append `f` to the FIFO. If the strand is not already pending on its
    /// executor, submits itself.
    pub fn execute(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) {
        self.queue.lock().push_back(Box::new(f));
        self.activate();
    }

    /// Drop every queued functor without invoking them.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn activate(self: &Arc<Self>) {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let Some(engine) = self.engine.upgrade() else {
                // Engine is gone; drain inline rather than leak the queue.
                self.clone().invoke();
                return;
            };
            let this = self.clone();
            engine.execute(Box::new(move || this.invoke()));
        }
    }

    fn invoke(self: Arc<Self>) {
        match self.policy {
            StrandPolicy::Greedy => loop {
                let batch: VecDeque<Functor> = {
                    let mut queue = self.queue.lock();
                    if queue.is_empty() {
                        self.pending.store(false, Ordering::Release);
                        return;
                    }
                    std::mem::take(&mut *queue)
                };
                self.run_batch(batch);
            },
            StrandPolicy::Fair => {
                let functor = {
                    let mut queue = self.queue.lock();
                    let functor = queue.pop_front();
                    let more = !queue.is_empty();
                    if !more {
                        self.pending.store(false, Ordering::Release);
                    }
                    (functor, more)
                };
                let (functor, more) = functor;
                if let Some(functor) = functor {
                    self.run_batch(VecDeque::from([functor]));
                }
                if more {
                    self.activate();
                }
            }
        }
    }

    fn run_batch(self: &Arc<Self>, batch: VecDeque<Functor>) {
        CURRENT_STRAND.with(|c| c.set(self.id));
        for functor in batch {
            functor();
        }
        CURRENT_STRAND.with(|c| c.set(0));
    }
}

fn next_id() -> usize {
    use std::sync::atomic::AtomicUsize;
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reactor::Reactor;
    use crate::engine::EngineConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn serialises_functors_in_order() {
        let reactor = Reactor::new(EngineConfig::default()).unwrap();
        let strand = reactor.clone().create_strand();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let order = order.clone();
            strand.execute(move || order.lock().push(i));
        }
        // Give the spawned worker thread a moment to drain.
        std::thread::sleep(Duration::from_millis(50));
        let order = order.lock();
        assert_eq!(order.len(), 100);
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn clear_drops_without_invoking() {
        let reactor = Reactor::new(EngineConfig::default()).unwrap();
        let strand = reactor.clone().create_strand();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            strand.queue.lock().push_back(Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }
        strand.clear();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
