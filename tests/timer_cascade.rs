//! Three one-shot timers driven by a live engine, where the first
//! firing cancels the second: t1 fires, t2 is cancelled before its
//! deadline, t3 fires on its own schedule.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ntio_core::engine::Engine;
use ntio_core::timer::{Timer, TimerEvent, TimerOptions, TimerSession};

use support::TestEngine;

struct Recorder {
    label: &'static str,
    events: Arc<Mutex<Vec<(&'static str, TimerEvent)>>>,
    cancel_target: Mutex<Option<Arc<Timer>>>,
}

impl TimerSession for Recorder {
    fn on_timer(&self, event: TimerEvent) {
        self.events.lock().unwrap().push((self.label, event));
        if event == TimerEvent::Deadline {
            if let Some(target) = self.cancel_target.lock().unwrap().take() {
                target.cancel();
            }
        }
    }
}

#[test]
fn first_deadline_cancels_the_second_timer() {
    let engine = TestEngine::start();
    let as_engine = engine.engine.clone() as Arc<dyn Engine>;

    let events = Arc::new(Mutex::new(Vec::new()));

    let t2_session = Arc::new(Recorder {
        label: "t2",
        events: events.clone(),
        cancel_target: Mutex::new(None),
    });
    let t2 = as_engine
        .clone()
        .create_timer(TimerOptions::after(Duration::from_millis(400)), t2_session.clone());

    let t1_session = Arc::new(Recorder {
        label: "t1",
        events: events.clone(),
        cancel_target: Mutex::new(Some(t2.clone())),
    });
    let _t1 = as_engine
        .clone()
        .create_timer(TimerOptions::after(Duration::from_millis(100)), t1_session);

    let t3_session = Arc::new(Recorder {
        label: "t3",
        events: events.clone(),
        cancel_target: Mutex::new(None),
    });
    let _t3 = as_engine
        .clone()
        .create_timer(TimerOptions::after(Duration::from_millis(250)), t3_session);

    let settled = support::wait_until(Duration::from_secs(2), || {
        let log = events.lock().unwrap();
        log.iter().any(|(label, ev)| *label == "t1" && *ev == TimerEvent::Deadline)
            && log.iter().any(|(label, ev)| *label == "t2" && *ev == TimerEvent::Canceled)
            && log.iter().any(|(label, ev)| *label == "t3" && *ev == TimerEvent::Deadline)
    });
    assert!(settled, "timer cascade did not settle: {:?}", events.lock().unwrap());

    let log = events.lock().unwrap();
    assert!(!log.iter().any(|(label, ev)| *label == "t2" && *ev == TimerEvent::Deadline));
    let t1_pos = log.iter().position(|(label, ev)| *label == "t1" && *ev == TimerEvent::Deadline);
    let t2_cancel_pos = log.iter().position(|(label, ev)| *label == "t2" && *ev == TimerEvent::Canceled);
    assert!(t1_pos.unwrap() < t2_cancel_pos.unwrap(), "t1 must fire before t2 is observed cancelled");
}
