//! Connect state (spec.md §3 "Connect state", §4.6 `connect`): target,
//! attempt bookkeeping, deadline and retry timers, and the callback to
//! fire once resolved one way or the other.

use std::time::Instant;

use crate::endpoint::Endpoint;
use crate::session::Operation;
use std::sync::Arc;

/// Retry policy applied while a connect attempt has not yet succeeded.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub retry_interval: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retry_count: 0,
            retry_interval: std::time::Duration::from_millis(500),
        }
    }
}

/// Bookkeeping for one in-flight (or retrying) connect operation.
pub struct ConnectState {
    pub target: Endpoint,
    pub attempt: u32,
    pub start: Instant,
    pub deadline: Option<Instant>,
    pub retry: RetryPolicy,
    pub in_progress: bool,
    pub callback: Option<Arc<dyn Operation>>,
}

impl ConnectState {
    pub fn new(target: Endpoint, deadline: Option<Instant>, retry: RetryPolicy) -> ConnectState {
        ConnectState {
            target,
            attempt: 0,
            start: Instant::now(),
            deadline,
            retry,
            in_progress: true,
            callback: None,
        }
    }

    pub fn deadline_elapsed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Whether another attempt should be made after a transient failure.
    pub fn should_retry(&self) -> bool {
        self.in_progress && !self.deadline_elapsed() && self.attempt < self.retry.retry_count
    }

    pub fn record_attempt(&mut self) {
        self.attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[test]
    fn retry_bounded_by_retry_count() {
        let target = Endpoint::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
        let mut state = ConnectState::new(
            target,
            None,
            RetryPolicy {
                retry_count: 2,
                retry_interval: std::time::Duration::from_millis(1),
            },
        );
        assert!(state.should_retry());
        state.record_attempt();
        assert!(state.should_retry());
        state.record_attempt();
        assert!(!state.should_retry());
    }
}
