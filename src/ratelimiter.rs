//! Token-bucket rate limiting (spec.md §4.4).
//!
//! Stream sockets consult a [`RateLimiter`] before copying bytes between a
//! queue and the socket's send/receive buffer; on shortfall they arm a
//! timer for the estimated wait and throttle the affected direction,
//! mirroring `mio`'s own `Interest` gating except the gate is a byte
//! budget rather than readiness.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Whether `consume` succeeded immediately or how long the caller should
/// wait before retrying.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allowed,
    Wait(Duration),
}

struct State {
    tokens: f64,
    last_update: Instant,
}

/// A token bucket: capacity, refill rate, current tokens, last update.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<State>,
}

impl RateLimiter {
    /// `capacity` and `rate_per_sec` are both in bytes.
    pub fn new(capacity: usize, rate_per_sec: usize) -> RateLimiter {
        RateLimiter {
            capacity: capacity as f64,
            refill_per_sec: rate_per_sec as f64,
            state: Mutex::new(State {
                tokens: capacity as f64,
                last_update: Instant::now(),
            }),
        }
    }

    /// An unlimited bucket: every `consume` is immediately allowed.
    pub fn unlimited() -> RateLimiter {
        RateLimiter::new(usize::MAX, 0)
    }

    fn refill(&self, state: &mut State) {
        if self.refill_per_sec == 0.0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_update = now;
    }

    /// Attempt to withdraw `n` bytes. Returns [`Admission::Allowed`] (and
    /// subtracts) if there are enough tokens, otherwise
    /// [`Admission::Wait`] with the estimated time until there would be.
    pub fn consume(&self, n: usize) -> Admission {
        let n = n as f64;
        let mut state = self.state.lock();
        self.refill(&mut state);
        if n <= state.tokens {
            state.tokens -= n;
            Admission::Allowed
        } else if self.refill_per_sec <= 0.0 {
            // No refill configured and not enough tokens: never admits.
            Admission::Wait(Duration::from_secs(u64::MAX / 2))
        } else {
            let shortfall = n - state.tokens;
            Admission::Wait(Duration::from_secs_f64(shortfall / self.refill_per_sec))
        }
    }

    /// How many bytes could be withdrawn right now without blocking.
    pub fn available(&self) -> usize {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens.floor().max(0.0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity() {
        let limiter = RateLimiter::new(100, 0);
        assert_eq!(limiter.consume(100), Admission::Allowed);
        assert!(matches!(limiter.consume(1), Admission::Wait(_)));
    }

    #[test]
    fn unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();
        assert_eq!(limiter.consume(1_000_000), Admission::Allowed);
    }

    #[test]
    fn refills_over_time() {
        let limiter = RateLimiter::new(10, 1000);
        assert_eq!(limiter.consume(10), Admission::Allowed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(limiter.consume(5), Admission::Allowed);
    }
}
