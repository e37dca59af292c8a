//! `epoll(7)`-backed selector, the Linux/Android leg of the reactor engine.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use super::cvt;
use crate::{Interest, Token};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// Thin wrapper over a raw `epoll_event`; kept opaque so callers only ever
/// see it through the [`SockEvent`] accessors below.
pub type SockEvent = libc::epoll_event;
pub type SysEvents = Vec<SockEvent>;

#[derive(Debug)]
pub struct Selector {
    id: usize,
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> std::io::Result<Selector> {
        // SAFETY: epoll_create1 either returns a valid fd or -1.
        let ep = unsafe { OwnedFd::from_raw_fd(cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            ep,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn select(&self, events: &mut SysEvents, timeout: Option<Duration>) -> std::io::Result<()> {
        let timeout_ms = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        let n = cvt(unsafe {
            libc::epoll_wait(
                self.ep.as_raw_fd(),
                events.as_mut_ptr(),
                events.capacity() as i32,
                timeout_ms,
            )
        })?;
        // SAFETY: epoll_wait populated exactly `n` slots.
        unsafe { events.set_len(n as usize) };
        Ok(())
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> std::io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) })
            .map(|_| ())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> std::io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event) })
            .map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> std::io::Result<()> {
        cvt(unsafe {
            libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        })
        .map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    // Edge-triggered per spec §4.1: the caller must drain until WOULD_BLOCK.
    let mut kind = EPOLLET;
    if interests.is_readable() {
        kind |= EPOLLIN | EPOLLRDHUP;
    }
    if interests.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

pub mod event {
    use super::SockEvent;
    use crate::Token;
    use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

    pub fn token(event: &SockEvent) -> Token {
        Token(event.u64 as usize)
    }

    pub fn is_readable(event: &SockEvent) -> bool {
        (event.events as libc::c_int & EPOLLIN) != 0
    }

    pub fn is_writable(event: &SockEvent) -> bool {
        (event.events as libc::c_int & EPOLLOUT) != 0
    }

    pub fn is_error(event: &SockEvent) -> bool {
        (event.events as libc::c_int & EPOLLERR) != 0
    }

    pub fn is_read_closed(event: &SockEvent) -> bool {
        event.events as libc::c_int & EPOLLHUP != 0
            || (event.events as libc::c_int & EPOLLIN != 0
                && event.events as libc::c_int & EPOLLRDHUP != 0)
    }

    pub fn is_write_closed(event: &SockEvent) -> bool {
        event.events as libc::c_int & EPOLLHUP != 0
            || (event.events as libc::c_int & EPOLLOUT != 0
                && event.events as libc::c_int & EPOLLERR != 0)
    }
}
