//! The asynchronous socket state machines: [`listener`], [`stream`] and
//! [`datagram`]. Shared here is the open/shutdown/detach state vocabulary
//! common to all three (spec.md §3 "Open / flow / shutdown state" and
//! "Detach state").

pub mod datagram;
pub mod listener;
pub mod stream;

pub use datagram::DatagramSocket;
pub use listener::ListenerSocket;
pub use stream::StreamSocket;

use std::sync::atomic::{AtomicU8, Ordering};

/// The tri-state open lifecycle shared by every socket kind. A listener's
/// `bound`/`listening` and a stream's `connecting`/`connected` refine
/// `Opened` further in their own state enums; this is the coarse state
/// the detach/close machinery cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenState {
    New,
    Opened,
    Closed,
}

/// One direction of a full-duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Per-direction shutdown progress. Monotonic: no transition flows
/// backward, and closing never un-shuts a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Active,
    InitiatedLocally,
    InitiatedRemotely,
    Complete,
}

impl ShutdownState {
    pub fn is_shut(self) -> bool {
        matches!(self, ShutdownState::Complete)
    }
}

/// `shutdown(direction, mode)`'s mode argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Graceful,
    Immediate,
}

/// Engine detachment progress (spec.md §3 "Detach state"). A socket's
/// close callback fires only once this reaches `Detached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachState {
    None,
    PendingFromEngine,
    Detached,
}

/// An atomic cell for [`OpenState`], shared between the strand-confined
/// handler logic (which reads/writes it under the strand's serialisation
/// guarantee) and any cross-thread state probes (`is_open()` etc.) a
/// caller might perform without going through the strand.
#[derive(Debug)]
pub(crate) struct OpenCell(AtomicU8);

impl OpenCell {
    pub fn new(state: OpenState) -> OpenCell {
        OpenCell(AtomicU8::new(encode_open(state)))
    }

    pub fn load(&self) -> OpenState {
        decode_open(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: OpenState) {
        self.0.store(encode_open(state), Ordering::Release);
    }
}

fn encode_open(state: OpenState) -> u8 {
    match state {
        OpenState::New => 0,
        OpenState::Opened => 1,
        OpenState::Closed => 2,
    }
}

fn decode_open(v: u8) -> OpenState {
    match v {
        0 => OpenState::New,
        1 => OpenState::Opened,
        _ => OpenState::Closed,
    }
}

/// A monotonically increasing source for operation tokens / write-entry
/// identifiers, shared by every socket kind.
pub(crate) fn next_id() -> u64 {
    use std::sync::atomic::AtomicU64;
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
