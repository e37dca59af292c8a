//! The accept queue (spec.md §4.5): accepted-but-not-yet-taken stream
//! sockets, paired with a FIFO of pending asynchronous `accept` requests.

use std::collections::VecDeque;
use std::time::Instant;

use crate::endpoint::Endpoint;
use crate::error::RuntimeError;
use crate::event::{Context, Transport};
use crate::primitive::RawSocket;
use crate::session::Operation;
use std::sync::Arc;

use super::{WatermarkEvent, Watermarks};

/// One kernel-accepted, not-yet-handed-out connection.
pub struct Accepted {
    pub socket: RawSocket,
    pub peer: Endpoint,
}

/// A pending asynchronous `accept(options, callback)` request.
pub struct PendingAccept {
    /// Identifies this request to its armed deadline timer, independent
    /// of the caller-supplied cancellation `token` (which is optional).
    pub id: u64,
    pub deadline: Option<Instant>,
    pub token: Option<u64>,
    pub callback: Arc<dyn Operation>,
}

/// The accepted-socket FIFO plus pending-accept-request FIFO and watermark
/// tracker.
pub struct AcceptQueue {
    ready: VecDeque<Accepted>,
    pending: VecDeque<PendingAccept>,
    watermarks: Watermarks,
}

impl AcceptQueue {
    pub fn new(low: usize, high: usize) -> AcceptQueue {
        AcceptQueue {
            ready: VecDeque::new(),
            pending: VecDeque::new(),
            watermarks: Watermarks::new(low, high),
        }
    }

    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn is_breached(&self) -> bool {
        self.watermarks.is_breached()
    }

    /// Hand a freshly kernel-accepted connection either straight to the
    /// oldest pending request, or into the ready FIFO.
    pub fn offer(&mut self, accepted: Accepted) -> WatermarkEvent {
        if let Some(request) = self.pending.pop_front() {
            request
                .callback
                .complete(Context::ok(0, Transport::Stream).with_endpoint(accepted.peer));
            return WatermarkEvent::None;
        }
        self.ready.push_back(accepted);
        self.watermarks.update(self.ready.len())
    }

    /// Synchronous variant: take a ready connection immediately, if any.
    pub fn take_sync(&mut self) -> Result<(Accepted, WatermarkEvent), RuntimeError> {
        match self.ready.pop_front() {
            Some(accepted) => Ok((accepted, self.watermarks.update(self.ready.len()))),
            None => Err(RuntimeError::WouldBlock),
        }
    }

    /// Queue an asynchronous accept request, trying to satisfy it
    /// immediately from the ready FIFO first.
    pub fn submit(&mut self, request: PendingAccept) -> WatermarkEvent {
        if let Some(accepted) = self.ready.pop_front() {
            request
                .callback
                .complete(Context::ok(0, Transport::Stream).with_endpoint(accepted.peer));
            return self.watermarks.update(self.ready.len());
        }
        self.pending.push_back(request);
        WatermarkEvent::None
    }

    /// Expire the pending request identified by `id`, if it is still
    /// queued (a no-op if it was already satisfied or cancelled first).
    /// Driven by the deadline timer armed alongside each `accept` call
    /// rather than checked opportunistically on the next arrival.
    pub fn expire(&mut self, id: u64) {
        if let Some(pos) = self.pending.iter().position(|r| r.id == id) {
            let request = self.pending.remove(pos).unwrap();
            request
                .callback
                .complete(Context::err(RuntimeError::WouldBlock, Transport::Stream));
        }
    }

    /// Cancel the pending accept request matching `token`.
    pub fn cancel(&mut self, token: u64) -> bool {
        if let Some(pos) = self.pending.iter().position(|r| r.token == Some(token)) {
            let request = self.pending.remove(pos).unwrap();
            request
                .callback
                .complete(Context::err(RuntimeError::Cancelled, Transport::Stream));
            true
        } else {
            false
        }
    }

    pub fn fail_all(&mut self, make_error: impl Fn() -> RuntimeError) {
        for request in self.pending.drain(..) {
            request.callback.complete(Context::err(make_error(), Transport::Stream));
        }
        self.ready.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fake_socket() -> RawSocket {
        // A placeholder fd for these tests, which only exercise queue
        // bookkeeping and never touch the socket itself. `-1` isn't a
        // valid fd for `RawSocket`/`OwnedFd`, so open a real, harmless one.
        let fd = unsafe { libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDONLY) };
        assert!(fd != -1);
        unsafe { RawSocket::from_raw_fd(fd) }
    }

    #[test]
    fn offer_satisfies_pending_request_directly() {
        let mut queue = AcceptQueue::new(1, 4);
        let got = Arc::new(AtomicBool::new(false));
        let g = got.clone();
        queue.submit(PendingAccept {
            id: 1,
            deadline: None,
            token: None,
            callback: Arc::new(move |ctx: Context| {
                if ctx.is_ok() {
                    g.store(true, Ordering::SeqCst);
                }
            }),
        });
        let peer = Endpoint::local("/tmp/nonexistent.sock");
        queue.offer(Accepted {
            socket: fake_socket(),
            peer,
        });
        assert!(got.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn offer_without_pending_request_queues_and_breaches() {
        let mut queue = AcceptQueue::new(0, 1);
        let peer = Endpoint::local("/tmp/nonexistent.sock");
        let event = queue.offer(Accepted {
            socket: fake_socket(),
            peer,
        });
        assert_eq!(event, WatermarkEvent::High);
        assert_eq!(queue.len(), 1);
    }
}
