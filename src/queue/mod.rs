//! Ordered, watermark-backed queues: the shared plumbing under read,
//! write, connect and accept queues (spec.md §3's Read/Write/Connect
//! queues, §4.5's accept queue).
//!
//! All four are variations on one shape — a FIFO plus a byte or item
//! count tracked against a low/high watermark pair that must alternate
//! HIGH → LOW → HIGH (spec.md §5 "Ordering"). [`Watermarks`] is that
//! shared alternation tracker; the per-kind queues below each own one.

pub mod accept_queue;
pub mod connect_queue;
pub mod read_queue;
pub mod write_queue;

pub use accept_queue::AcceptQueue;
pub use connect_queue::ConnectState;
pub use read_queue::ReadQueue;
pub use write_queue::WriteQueue;

/// Tracks which of HIGH/LOW was last announced for one queue, so a caller
/// can enforce strict alternation regardless of how many times the level
/// crosses a watermark between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkState {
    /// No watermark event has been announced yet (or the last one was
    /// LOW); the next crossing that fires must be HIGH.
    Idle,
    /// HIGH was the last announced event; the next crossing that fires
    /// must be LOW.
    Breached,
}

impl Default for WatermarkState {
    fn default() -> Self {
        WatermarkState::Idle
    }
}

/// Low/high thresholds plus the alternation tracker.
#[derive(Debug, Clone)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
    state: WatermarkState,
}

/// What, if anything, a level update should announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkEvent {
    None,
    High,
    Low,
}

impl Watermarks {
    pub fn new(low: usize, high: usize) -> Watermarks {
        Watermarks {
            low,
            high,
            state: WatermarkState::Idle,
        }
    }

    /// Feed a new queue level, returning the event to announce (if any).
    /// Called after every enqueue/dequeue that can move the level.
    pub fn update(&mut self, level: usize) -> WatermarkEvent {
        match self.state {
            WatermarkState::Idle if level >= self.high => {
                self.state = WatermarkState::Breached;
                WatermarkEvent::High
            }
            WatermarkState::Breached if level <= self.low => {
                self.state = WatermarkState::Idle;
                WatermarkEvent::Low
            }
            _ => WatermarkEvent::None,
        }
    }

    pub fn is_breached(&self) -> bool {
        self.state == WatermarkState::Breached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternates_high_then_low() {
        let mut w = Watermarks::new(2, 8);
        assert_eq!(w.update(0), WatermarkEvent::None);
        assert_eq!(w.update(8), WatermarkEvent::High);
        assert_eq!(w.update(9), WatermarkEvent::None);
        assert_eq!(w.update(5), WatermarkEvent::None);
        assert_eq!(w.update(2), WatermarkEvent::Low);
        assert_eq!(w.update(8), WatermarkEvent::High);
    }

    #[test]
    fn never_emits_low_without_a_prior_high() {
        let mut w = Watermarks::new(2, 8);
        assert_eq!(w.update(0), WatermarkEvent::None);
        assert_eq!(w.update(1), WatermarkEvent::None);
    }
}
