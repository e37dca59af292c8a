//! The low-level event types produced by an [`crate::engine::Engine`]:
//! readiness for the reactor, operation completion for the proactor. Both
//! engines report through the same [`Event`]/[`Events`] pair so socket code
//! does not need to know which backs it.

use std::fmt;
use std::time::Instant;

use crate::endpoint::Endpoint;
use crate::error::RuntimeError;
use crate::token::Token;

/// The transport an operation's [`Context`] pertains to, distinguishing a
/// stream byte transfer from a datagram with a per-operation peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Datagram,
}

/// The result payload of one completed asynchronous operation (spec.md §6:
/// "event = {type, context{error, bytes, endpoint, transport}}"), carried
/// to a session's per-operation callback alongside the operation kind.
#[derive(Debug)]
pub struct Context {
    pub error: Option<RuntimeError>,
    pub bytes: usize,
    pub endpoint: Option<Endpoint>,
    pub transport: Transport,
    /// When the datagram socket was opened with timestamping enabled, the
    /// instant this receive was delivered (spec.md §4.7's "optional
    /// timestamp metadata on receive"). `None` for every other operation.
    pub received_at: Option<Instant>,
}

impl Context {
    pub fn ok(bytes: usize, transport: Transport) -> Context {
        Context {
            error: None,
            bytes,
            endpoint: None,
            transport,
            received_at: None,
        }
    }

    pub fn err(error: RuntimeError, transport: Transport) -> Context {
        Context {
            error: Some(error),
            bytes: 0,
            endpoint: None,
            transport,
            received_at: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Context {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_timestamp(mut self, instant: Instant) -> Context {
        self.received_at = Some(instant);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// One readiness or completion notification.
#[derive(Copy, Clone)]
pub struct Event {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
    read_closed: bool,
    write_closed: bool,
}

impl Event {
    pub fn new(token: Token) -> Event {
        Event {
            token,
            readable: false,
            writable: false,
            error: false,
            read_closed: false,
            write_closed: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    pub fn set_readable(&mut self) -> &mut Self {
        self.readable = true;
        self
    }

    pub fn set_writable(&mut self) -> &mut Self {
        self.writable = true;
        self
    }

    pub fn set_error(&mut self) -> &mut Self {
        self.error = true;
        self
    }

    pub fn set_read_closed(&mut self) -> &mut Self {
        self.read_closed = true;
        self
    }

    pub fn set_write_closed(&mut self) -> &mut Self {
        self.write_closed = true;
        self
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("error", &self.error)
            .field("read_closed", &self.read_closed)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}

/// A batch of events returned from a single [`crate::engine::Engine::poll`]
/// call. Cleared and refilled on every poll; at most `capacity()` events
/// are returned per call.
#[derive(Debug)]
pub struct Events {
    inner: Vec<Event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub(crate) fn push(&mut self, event: Event) {
        self.inner.push(event);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_flags_round_trip() {
        let mut e = Event::new(Token(1));
        e.set_readable().set_error();
        assert!(e.is_readable());
        assert!(e.is_error());
        assert!(!e.is_writable());
    }
}
