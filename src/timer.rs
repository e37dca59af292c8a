//! Deadline scheduling (spec.md §4.3 "Timers").
//!
//! A [`TimerWheel`] is a min-heap of armed [`Timer`]s ordered by deadline.
//! `Reactor::poll` asks it for the next deadline to bound its `select`
//! timeout, then calls [`TimerWheel::fire_expired`] right after waking,
//! so a timer firing and an I/O readiness event for the same poll tick are
//! both delivered before the loop iterates again.
//!
//! Grounded on `ntcd_proactor.t.cpp`'s timer cascade test, which requires
//! deadlines to fire in non-decreasing order and, when a single timer is
//! both canceled and closed, for the CANCELED event to precede CLOSED.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::engine::Engine;

/// What fired.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimerEvent {
    Deadline,
    Canceled,
    Closed,
}

/// Callback surface a timer dispatches onto, typically forwarded straight
/// onto a socket's [`crate::strand::Strand`] by the implementor.
pub trait TimerSession: Send + Sync {
    fn on_timer(&self, event: TimerEvent);
}

/// Construction-time parameters for a single timer (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct TimerOptions {
    pub deadline: Instant,
    pub period: Option<Duration>,
    pub drift_allowed: bool,
    pub one_shot: bool,
}

impl TimerOptions {
    pub fn at(deadline: Instant) -> TimerOptions {
        TimerOptions {
            deadline,
            period: None,
            drift_allowed: false,
            one_shot: true,
        }
    }

    pub fn after(delay: Duration) -> TimerOptions {
        TimerOptions::at(Instant::now() + delay)
    }

    pub fn periodic(mut self, period: Duration) -> TimerOptions {
        self.period = Some(period);
        self.one_shot = false;
        self
    }
}

/// A single scheduled timer handle. Cloning the `Arc` is how callers keep
/// the right to [`Timer::cancel`]/[`Timer::close`] it later.
pub struct Timer {
    id: u64,
    session: Arc<dyn TimerSession>,
    deadline: Mutex<Instant>,
    period: Mutex<Option<Duration>>,
    canceled: AtomicBool,
    closed: AtomicBool,
    engine: Weak<dyn Engine>,
}

impl Timer {
    /// Cancel the pending arming. A periodic timer stops rescheduling; a
    /// closed timer ignores this (closing already implies canceled, fired
    /// in that order, exactly once).
    pub fn cancel(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .canceled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.session.on_timer(TimerEvent::Canceled);
        }
    }

    /// Cancel (if not already) then permanently retire this timer.
    pub fn close(self: &Arc<Self>) {
        self.cancel();
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.session.on_timer(TimerEvent::Closed);
            if let Some(engine) = self.engine.upgrade() {
                let _ = engine;
            }
        }
    }

    /// Disarm and rearm at a new deadline, as though the prior arming had
    /// been canceled (spec.md §4.3: "re-scheduling an armed timer cancels
    /// the prior arming without firing a user-visible CANCELED").
    pub fn reschedule(&self, deadline: Instant) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        *self.deadline.lock() = deadline;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    fn fire(self: &Arc<Self>) -> bool {
        if self.canceled.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.session.on_timer(TimerEvent::Deadline);
        match *self.period.lock() {
            Some(period) => {
                *self.deadline.lock() += period;
                true
            }
            None => false,
        }
    }
}

struct Entry {
    deadline: Instant,
    generation: u64,
    timer: Arc<Timer>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse so `BinaryHeap` (a max-heap) pops the earliest deadline
        // first; ties break by insertion order for determinism.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// The min-heap of armed timers owned by one engine.
pub struct TimerWheel {
    heap: BinaryHeap<Entry>,
    next_id: u64,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            heap: BinaryHeap::new(),
            next_id: 1,
        }
    }

    pub fn create(
        &mut self,
        options: TimerOptions,
        session: Arc<dyn TimerSession>,
        engine: Arc<dyn Engine>,
    ) -> Arc<Timer> {
        let id = self.next_id;
        self.next_id += 1;
        let timer = Arc::new(Timer {
            id,
            session,
            deadline: Mutex::new(options.deadline),
            period: Mutex::new(options.period),
            canceled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            engine: Arc::downgrade(&engine),
        });
        self.heap.push(Entry {
            deadline: options.deadline,
            generation: id,
            timer: timer.clone(),
        });
        timer
    }

    /// How long until the earliest live deadline, if any.
    pub fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.heap
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(now))
    }

    /// Pop and fire every timer whose deadline has passed, requeuing
    /// periodic ones at their next deadline.
    pub fn fire_expired(&mut self) {
        let now = Instant::now();
        let mut requeue = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            if entry.timer.deadline() != entry.deadline {
                // Rescheduled since being queued; requeue at the live
                // deadline instead of firing the stale one.
                requeue.push(Entry {
                    deadline: entry.timer.deadline(),
                    generation: entry.generation,
                    timer: entry.timer,
                });
                continue;
            }
            if entry.timer.fire() {
                let next_deadline = entry.timer.deadline();
                requeue.push(Entry {
                    deadline: next_deadline,
                    generation: entry.generation,
                    timer: entry.timer,
                });
            }
        }
        self.heap.extend(requeue);
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        TimerWheel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSession {
        events: StdMutex<Vec<TimerEvent>>,
    }

    impl RecordingSession {
        fn new() -> Arc<RecordingSession> {
            Arc::new(RecordingSession {
                events: StdMutex::new(Vec::new()),
            })
        }
    }

    impl TimerSession for RecordingSession {
        fn on_timer(&self, event: TimerEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn test_engine() -> Arc<dyn Engine> {
        crate::engine::reactor::Reactor::new(crate::engine::EngineConfig::default()).unwrap()
    }

    #[test]
    fn fires_in_nondecreasing_deadline_order() {
        let engine = test_engine();
        let mut wheel = TimerWheel::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        struct OrderSession {
            id: u32,
            order: Arc<StdMutex<Vec<u32>>>,
        }
        impl TimerSession for OrderSession {
            fn on_timer(&self, event: TimerEvent) {
                if event == TimerEvent::Deadline {
                    self.order.lock().unwrap().push(self.id);
                }
            }
        }

        let now = Instant::now();
        let a = Arc::new(OrderSession { id: 1, order: order.clone() });
        let b = Arc::new(OrderSession { id: 2, order: order.clone() });
        wheel.create(
            TimerOptions::at(now + Duration::from_millis(20)),
            a,
            engine.clone(),
        );
        wheel.create(
            TimerOptions::at(now + Duration::from_millis(5)),
            b,
            engine.clone(),
        );

        std::thread::sleep(Duration::from_millis(30));
        wheel.fire_expired();
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn close_emits_canceled_then_closed() {
        let engine = test_engine();
        let mut wheel = TimerWheel::new();
        let session = RecordingSession::new();
        let timer = wheel.create(
            TimerOptions::after(Duration::from_secs(60)),
            session.clone(),
            engine,
        );
        timer.close();
        assert_eq!(
            *session.events.lock().unwrap(),
            vec![TimerEvent::Canceled, TimerEvent::Closed]
        );
    }

    #[test]
    fn canceled_timer_does_not_fire() {
        let engine = test_engine();
        let mut wheel = TimerWheel::new();
        let session = RecordingSession::new();
        let timer = wheel.create(
            TimerOptions::after(Duration::from_millis(1)),
            session.clone(),
            engine,
        );
        timer.cancel();
        std::thread::sleep(Duration::from_millis(10));
        wheel.fire_expired();
        assert_eq!(*session.events.lock().unwrap(), vec![TimerEvent::Canceled]);
    }
}
