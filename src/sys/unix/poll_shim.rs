//! Portable `poll(2)`-backed selector used on Unix targets without an
//! `epoll(7)` backend (e.g. the BSDs). Level-triggered: the engine's
//! dispatch loop re-checks drained sockets on every call rather than
//! relying on edge notification, which costs throughput but keeps this
//! leg of the selector small. A kqueue backend would recover that
//! throughput on those platforms; it is not implemented here (see
//! `DESIGN.md`).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use parking_lot::Mutex;

use super::cvt;
use crate::{Interest, Token};

pub type SockEvent = libc::pollfd;
pub type SysEvents = Vec<SockEvent>;

#[derive(Debug)]
pub struct Selector {
    registered: Mutex<HashMap<RawFd, Token>>,
}

impl Selector {
    pub fn new() -> std::io::Result<Selector> {
        Ok(Selector {
            registered: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> usize {
        0
    }

    pub fn select(&self, events: &mut SysEvents, timeout: Option<Duration>) -> std::io::Result<()> {
        events.clear();
        let registered = self.registered.lock();
        let mut fds: Vec<libc::pollfd> = registered
            .keys()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN | libc::POLLOUT,
                revents: 0,
            })
            .collect();
        drop(registered);

        let timeout_ms = timeout
            .map(|to| to.as_millis() as libc::c_int)
            .unwrap_or(-1);
        if fds.is_empty() {
            if timeout_ms >= 0 {
                std::thread::sleep(Duration::from_millis(timeout_ms as u64));
            }
            return Ok(());
        }
        cvt(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) })?;
        events.extend(fds.into_iter().filter(|p| p.revents != 0));
        Ok(())
    }

    pub fn register(&self, fd: RawFd, token: Token, _interests: Interest) -> std::io::Result<()> {
        self.registered.lock().insert(fd, token);
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, _interests: Interest) -> std::io::Result<()> {
        self.registered.lock().insert(fd, token);
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> std::io::Result<()> {
        self.registered.lock().remove(&fd);
        Ok(())
    }

    fn token_of(&self, fd: RawFd) -> Option<Token> {
        self.registered.lock().get(&fd).copied()
    }
}

pub mod event {
    use super::SockEvent;
    use crate::Token;

    pub fn token(_event: &SockEvent) -> Token {
        // poll(2) events carry the fd, not the token; the engine resolves
        // the token from its own fd table when using this backend.
        Token(0)
    }

    pub fn is_readable(event: &SockEvent) -> bool {
        event.revents & libc::POLLIN != 0
    }

    pub fn is_writable(event: &SockEvent) -> bool {
        event.revents & libc::POLLOUT != 0
    }

    pub fn is_error(event: &SockEvent) -> bool {
        event.revents & libc::POLLERR != 0
    }

    pub fn is_read_closed(event: &SockEvent) -> bool {
        event.revents & libc::POLLHUP != 0
    }

    pub fn is_write_closed(event: &SockEvent) -> bool {
        event.revents & libc::POLLHUP != 0
    }

    pub fn fd(event: &SockEvent) -> i32 {
        event.fd
    }
}

impl Selector {
    /// Resolve a raw `pollfd`'s descriptor back to its `Token`. Used by the
    /// reactor's dispatch loop on this backend instead of
    /// [`event::token`], which cannot recover the token from a bare
    /// `pollfd`.
    pub fn resolve(&self, ev: &SockEvent) -> Option<Token> {
        self.token_of(ev.fd)
    }
}
