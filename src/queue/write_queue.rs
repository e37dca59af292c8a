//! The write queue (spec.md §3, §4.6 "Send discipline"): a FIFO of send
//! entries, each tagged with an identifier, payload, optional deadline
//! and callback, plus the total-bytes watermark pair.

use std::collections::VecDeque;
use std::time::Instant;

use crate::buf::IoBuf;
use crate::error::RuntimeError;
use crate::event::{Context, Transport};
use crate::session::Operation;
use std::sync::Arc;

use super::{WatermarkEvent, Watermarks};

/// One outbound payload plus its own deadline/callback/identifier.
pub struct WriteEntry {
    pub id: u64,
    pub payload: IoBuf<'static>,
    pub remaining: usize,
    pub offset: usize,
    pub deadline: Option<Instant>,
    pub token: Option<u64>,
    pub callback: Option<Arc<dyn Operation>>,
    /// When the payload is ciphertext produced by wrapping a smaller
    /// plaintext (the TLS send path), the plaintext length to report on
    /// completion instead of the wire byte count in `offset`.
    pub plain_len: Option<usize>,
    started: bool,
}

impl WriteEntry {
    pub fn new(id: u64, payload: IoBuf<'static>) -> WriteEntry {
        let remaining = payload.len();
        WriteEntry {
            id,
            payload,
            remaining,
            offset: 0,
            deadline: None,
            token: None,
            callback: None,
            plain_len: None,
            started: false,
        }
    }

    /// The byte count to surface to a completion callback: the plaintext
    /// length if this entry wraps encrypted output, else the raw offset.
    pub fn report_len(&self) -> usize {
        self.plain_len.unwrap_or(self.offset)
    }

    fn bytes_as_slice(&self) -> &[u8] {
        match &self.payload {
            IoBuf::Const(b) => b,
            IoBuf::Mut(b) => b,
            // Blob/File entries are drained chunk-by-chunk by the owning
            // stream socket rather than through this convenience slice.
            _ => &[],
        }
    }

    /// The unsent remainder of a contiguous-byte entry.
    pub fn remaining_slice(&self) -> &[u8] {
        &self.bytes_as_slice()[self.offset..]
    }

    pub fn advance(&mut self, n: usize) {
        self.offset += n;
        self.remaining = self.remaining.saturating_sub(n);
        self.started = true;
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    /// The entry's payload as vectored chunks, when it is backed by a
    /// [`crate::buf::Blob`] rather than a contiguous slice.
    pub fn blob_io_slices(&self) -> Option<Vec<std::io::IoSlice<'_>>> {
        match &self.payload {
            IoBuf::Blob(blob) => Some(blob.io_slices()),
            _ => None,
        }
    }

    /// Record `n` bytes sent directly from a `Blob` payload, which tracks
    /// its own consumed prefix rather than using `offset`.
    pub fn advance_blob(&mut self, n: usize) {
        if let IoBuf::Blob(blob) = &mut self.payload {
            blob.consume(n);
        }
        self.remaining = self.remaining.saturating_sub(n);
        self.started = true;
    }
}

/// The outbound-entry FIFO plus pending-bytes watermark tracker.
pub struct WriteQueue {
    entries: VecDeque<WriteEntry>,
    total_bytes: usize,
    watermarks: Watermarks,
}

impl WriteQueue {
    pub fn new(low: usize, high: usize) -> WriteQueue {
        WriteQueue {
            entries: VecDeque::new(),
            total_bytes: 0,
            watermarks: Watermarks::new(low, high),
        }
    }

    pub fn len(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_breached(&self) -> bool {
        self.watermarks.is_breached()
    }

    /// Append an entry and re-check the high watermark.
    pub fn push(&mut self, entry: WriteEntry) -> WatermarkEvent {
        self.total_bytes += entry.remaining;
        self.entries.push_back(entry);
        self.watermarks.update(self.total_bytes)
    }

    pub fn front_mut(&mut self) -> Option<&mut WriteEntry> {
        self.entries.front_mut()
    }

    /// Account for `n` bytes having been copied off the front entry,
    /// popping and completing it if it is now fully sent. Returns the
    /// watermark event (if any) produced by the resulting drain.
    pub fn account_sent(&mut self, n: usize) -> WatermarkEvent {
        self.total_bytes = self.total_bytes.saturating_sub(n);
        if let Some(front) = self.entries.front() {
            if front.is_complete() {
                let entry = self.entries.pop_front().unwrap();
                if let Some(ref callback) = entry.callback {
                    callback.complete(Context::ok(entry.report_len(), Transport::Stream));
                }
            }
        }
        self.watermarks.update(self.total_bytes)
    }

    /// Expire the entry identified by `id`, wherever it sits in the FIFO:
    /// whole-entry failure before any byte has been copied (spec.md
    /// §4.6's decided Open Question — see DESIGN.md), or a no-op if it
    /// already started, was already sent, or isn't queued any more.
    /// Driven by the deadline timer armed at enqueue time rather than
    /// checked opportunistically on the next writable event — an entry
    /// behind a socket that never becomes writable again would otherwise
    /// never see its deadline evaluated.
    pub fn expire(&mut self, id: u64) -> WatermarkEvent {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return WatermarkEvent::None;
        };
        if self.entries[pos].has_started() {
            return WatermarkEvent::None;
        }
        let entry = self.entries.remove(pos).unwrap();
        self.total_bytes = self.total_bytes.saturating_sub(entry.remaining);
        if let Some(callback) = entry.callback {
            callback.complete(Context::err(RuntimeError::WouldBlock, Transport::Stream));
        }
        self.watermarks.update(self.total_bytes)
    }

    /// Cancel the entry matching `token`, wherever it is in the FIFO.
    pub fn cancel(&mut self, token: u64) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.token == Some(token)) {
            let entry = self.entries.remove(pos).unwrap();
            self.total_bytes = self.total_bytes.saturating_sub(entry.remaining);
            if let Some(callback) = entry.callback {
                callback.complete(Context::err(RuntimeError::Cancelled, Transport::Stream));
            }
            self.watermarks.update(self.total_bytes);
            true
        } else {
            false
        }
    }

    /// Fail and drop every queued entry, as on immediate shutdown or
    /// close.
    pub fn fail_all(&mut self, make_error: impl Fn() -> RuntimeError) {
        for entry in self.entries.drain(..) {
            if let Some(callback) = entry.callback {
                callback.complete(Context::err(make_error(), Transport::Stream));
            }
        }
        self.total_bytes = 0;
        self.watermarks.update(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn push_then_account_sent_completes_entry() {
        let mut queue = WriteQueue::new(0, 8);
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        let mut entry = WriteEntry::new(1, IoBuf::Const(b"hello"));
        entry.callback = Some(Arc::new(move |_ctx: Context| d.store(true, Ordering::SeqCst)));
        queue.push(entry);
        assert_eq!(queue.len(), 5);
        queue.front_mut().unwrap().advance(5);
        queue.account_sent(5);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn high_watermark_breaches_then_clears() {
        let mut queue = WriteQueue::new(2, 4);
        let e1 = WriteEntry::new(1, IoBuf::Const(b"abcd"));
        assert_eq!(queue.push(e1), WatermarkEvent::High);
        queue.front_mut().unwrap().advance(4);
        assert_eq!(queue.account_sent(4), WatermarkEvent::Low);
    }
}
