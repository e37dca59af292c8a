//! The read queue (spec.md §3, §4.6 "Receive discipline"): an ordered
//! byte accumulator plus a FIFO of pending receive requests, each
//! satisfied as soon as the accumulator holds enough bytes.

use std::collections::VecDeque;
use std::time::Instant;

use crate::buf::{Blob, BlobFactory};
use crate::error::RuntimeError;
use crate::event::{Context, Transport};
use crate::session::Operation;
use std::sync::Arc;

use super::{WatermarkEvent, Watermarks};

/// A pending asynchronous `receive` not yet satisfiable from the buffered
/// bytes on hand.
pub struct PendingReceive {
    /// Identifies this request to its armed deadline timer, independent
    /// of the caller-supplied cancellation `token` (which is optional).
    pub id: u64,
    pub min_size: usize,
    pub max_size: usize,
    pub deadline: Option<Instant>,
    pub token: Option<u64>,
    pub callback: Arc<dyn Operation>,
}

/// The accumulated inbound byte buffer plus its pending-request FIFO.
pub struct ReadQueue {
    buffer: Blob,
    pending: VecDeque<PendingReceive>,
    watermarks: Watermarks,
    eof: bool,
}

impl ReadQueue {
    pub fn new(factory: &BlobFactory, low: usize, high: usize) -> ReadQueue {
        ReadQueue {
            buffer: factory.new_blob(),
            pending: VecDeque::new(),
            watermarks: Watermarks::new(low, high),
            eof: false,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_breached(&self) -> bool {
        self.watermarks.is_breached()
    }

    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Append freshly-received bytes and re-check the high watermark.
    pub fn fill(&mut self, bytes: &[u8]) -> WatermarkEvent {
        self.buffer.push(bytes);
        self.watermarks.update(self.buffer.len())
    }

    /// Queue an asynchronous receive request; caller should call
    /// [`ReadQueue::drain_pending`] immediately afterward in case it is
    /// already satisfiable.
    pub fn submit(&mut self, request: PendingReceive) {
        self.pending.push_back(request);
    }

    /// Copy up to `max_size` buffered bytes into `out`, consuming them.
    /// Synchronous counterpart of spec.md §4.6's `receive(context*, data,
    /// options)`.
    pub fn take_sync(&mut self, out: &mut [u8], min_size: usize) -> Result<usize, RuntimeError> {
        if self.buffer.len() < min_size {
            if self.eof && self.buffer.is_empty() {
                return Err(RuntimeError::Eof);
            }
            return Err(RuntimeError::WouldBlock);
        }
        let n = out.len().min(self.buffer.len());
        let mut copied = 0;
        for chunk in self.buffer.chunks() {
            if copied >= n {
                break;
            }
            let take = chunk.len().min(n - copied);
            out[copied..copied + take].copy_from_slice(&chunk[..take]);
            copied += take;
        }
        self.buffer.consume(copied);
        Ok(copied)
    }

    /// Satisfy as many pending requests as the buffered bytes (or EOF)
    /// allow, returning the watermark event produced by the resulting
    /// drain (if any).
    pub fn drain_pending(&mut self) -> WatermarkEvent {
        loop {
            let Some(front) = self.pending.front() else {
                break;
            };
            let timed_out = front
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline);
            if timed_out {
                let request = self.pending.pop_front().unwrap();
                request.callback.complete(Context::err(RuntimeError::WouldBlock, Transport::Stream));
                continue;
            }
            if self.buffer.len() >= front.min_size {
                let request = self.pending.pop_front().unwrap();
                // `Context` carries a byte count, not the bytes themselves
                // (spec.md §6's context shape has no data field): this only
                // notifies that the bytes are available, leaving them in
                // the buffer for the caller's own `take_sync` to collect.
                let available = self.buffer.len().min(request.max_size);
                request
                    .callback
                    .complete(Context::ok(available, Transport::Stream));
                continue;
            }
            if self.eof {
                let request = self.pending.pop_front().unwrap();
                request.callback.complete(Context::err(RuntimeError::Eof, Transport::Stream));
                continue;
            }
            break;
        }
        self.watermarks.update(self.buffer.len())
    }

    /// Fail every pending request with an error produced by `make_error`,
    /// as on fatal failure or close (spec.md §4.6 "Failure semantics").
    /// Takes a factory rather than one `RuntimeError` since the latter is
    /// not `Clone` (it wraps `std::io::Error`).
    pub fn fail_all(&mut self, make_error: impl Fn() -> RuntimeError) {
        for request in self.pending.drain(..) {
            request
                .callback
                .complete(Context::err(make_error(), Transport::Stream));
        }
    }

    /// Expire the pending request identified by `id`, if it is still
    /// queued. Driven by the deadline timer armed alongside each async
    /// `receive` call, rather than checked opportunistically the next
    /// time bytes arrive — an idle stream with no further bytes would
    /// otherwise never see its deadline evaluated.
    pub fn expire(&mut self, id: u64) {
        if let Some(pos) = self.pending.iter().position(|r| r.id == id) {
            let request = self.pending.remove(pos).unwrap();
            request.callback.complete(Context::err(RuntimeError::WouldBlock, Transport::Stream));
        }
    }

    /// Cancel the pending request matching `token`, if any.
    pub fn cancel(&mut self, token: u64) -> bool {
        if let Some(pos) = self.pending.iter().position(|r| r.token == Some(token)) {
            let request = self.pending.remove(pos).unwrap();
            request.callback.complete(Context::err(RuntimeError::Cancelled, Transport::Stream));
            true
        } else {
            false
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fill_then_sync_take_round_trips() {
        let factory = BlobFactory::default();
        let mut queue = ReadQueue::new(&factory, 1, 1024);
        queue.fill(b"hello");
        let mut out = [0u8; 5];
        let n = queue.take_sync(&mut out, 1).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn pending_receive_satisfied_on_fill() {
        let factory = BlobFactory::default();
        let mut queue = ReadQueue::new(&factory, 1, 1024);
        let received = Arc::new(AtomicUsize::new(0));
        let r = received.clone();
        queue.submit(PendingReceive {
            id: 1,
            min_size: 3,
            max_size: 16,
            deadline: None,
            token: None,
            callback: Arc::new(move |ctx: Context| {
                r.store(ctx.bytes, Ordering::SeqCst);
            }),
        });
        assert_eq!(received.load(Ordering::SeqCst), 0);
        queue.fill(b"hi");
        queue.drain_pending();
        assert_eq!(received.load(Ordering::SeqCst), 0);
        queue.fill(b"!");
        queue.drain_pending();
        assert_eq!(received.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn eof_fails_pending_with_eof() {
        let factory = BlobFactory::default();
        let mut queue = ReadQueue::new(&factory, 1, 1024);
        let got_eof = Arc::new(AtomicUsize::new(0));
        let g = got_eof.clone();
        queue.submit(PendingReceive {
            id: 1,
            min_size: 1,
            max_size: 16,
            deadline: None,
            token: None,
            callback: Arc::new(move |ctx: Context| {
                if matches!(ctx.error, Some(RuntimeError::Eof)) {
                    g.store(1, Ordering::SeqCst);
                }
            }),
        });
        queue.mark_eof();
        queue.drain_pending();
        assert_eq!(got_eof.load(Ordering::SeqCst), 1);
    }
}
