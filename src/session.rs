//! The capability traits a caller implements to observe a socket's
//! asynchronous lifecycle (spec.md §6 "To session handlers").
//!
//! Grounded on `mio`'s `event::Source`/`Interest` split in spirit — one
//! small trait per capability rather than one monolithic callback
//! interface — and, per spec.md §9's design note, implemented as traits
//! rather than an event-type tag so a listener or stream can accept any
//! combination of sessions at compile time.

use std::sync::Arc;

use crate::descriptor::Descriptor;
use crate::endpoint::Endpoint;
use crate::error::RuntimeError;
use crate::event::Context;

/// A watermark crossing on one queue, named by which queue and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    ReadQueueLow,
    ReadQueueHigh,
    WriteQueueLow,
    WriteQueueHigh,
    AcceptQueueLow,
    AcceptQueueHigh,
}

/// Which half (or both) of a connection a shutdown notification concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Initiated,
    Send,
    Receive,
    Complete,
}

/// Session callbacks common to any socket kind: watermark and shutdown
/// notifications, plus the catch-all `process_error` for a failure that
/// is not scoped to any one pending operation (spec.md §7 propagation:
/// "errors reaching a socket outside the context of any one pending
/// operation transition the socket to a terminal failure").
pub trait SocketSession: Send + Sync {
    fn process_watermark(&self, _watermark: Watermark) {}

    fn process_shutdown(&self, _phase: ShutdownPhase) {}

    fn process_error(&self, _error: &RuntimeError) {}

    /// Fires exactly once, after detachment completes. No other callback
    /// for this socket may fire afterward.
    fn process_close(&self) {}
}

/// Per-operation completion callback shared by connect/send/receive/
/// accept/upgrade — spec.md §6's "(sender|receiver|connector|acceptor|
/// upgrader, event)".
pub trait Operation: Send + Sync {
    fn complete(&self, context: Context);
}

impl<F: Fn(Context) + Send + Sync> Operation for F {
    fn complete(&self, context: Context) {
        self(context)
    }
}

/// Session surface for a connecting/connected stream socket.
pub trait StreamSession: SocketSession {
    fn process_connect_initiated(&self) {}
    fn process_connect_complete(&self, _context: &Context) {}
    fn process_upgrade_initiated(&self) {}
    fn process_upgrade_complete(&self, _context: &Context) {}
    fn process_downgrade_initiated(&self) {}
    fn process_downgrade_complete(&self, _context: &Context) {}
}

/// Session surface for a listener, notified as each accepted descriptor
/// becomes available without a matching pending `accept` call.
pub trait ListenerSession: SocketSession {
    fn process_accepted(&self, _descriptor: Descriptor, _peer: &Endpoint) {}
}

/// A collection of sockets an application can wait on collectively — the
/// one genuinely blocking user-facing primitive named in spec.md §5
/// ("linger() on a manager awaiting closure of all sockets").
pub trait Manager: Send + Sync {
    fn register(&self, descriptor: Descriptor);
    fn unregister(&self, descriptor: Descriptor);
    fn outstanding(&self) -> usize;

    /// Block the calling thread until `outstanding()` reaches zero.
    fn linger(&self) {
        while self.outstanding() > 0 {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }
}

/// The default [`Manager`]: an atomic counter plus a condvar, adequate for
/// the core's own tests and for callers without a richer bookkeeping need.
pub struct SimpleManager {
    count: std::sync::atomic::AtomicUsize,
}

impl SimpleManager {
    pub fn new() -> Arc<SimpleManager> {
        Arc::new(SimpleManager {
            count: std::sync::atomic::AtomicUsize::new(0),
        })
    }
}

impl Default for SimpleManager {
    fn default() -> Self {
        SimpleManager {
            count: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

impl Manager for SimpleManager {
    fn register(&self, _descriptor: Descriptor) {
        self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn unregister(&self, _descriptor: Descriptor) {
        self.count.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn outstanding(&self) -> usize {
        self.count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_tracks_registration() {
        let manager = SimpleManager::new();
        assert_eq!(manager.outstanding(), 0);
        manager.register(Descriptor::INVALID);
        assert_eq!(manager.outstanding(), 1);
        manager.unregister(Descriptor::INVALID);
        assert_eq!(manager.outstanding(), 0);
    }
}
