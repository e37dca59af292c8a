//! Platform selector glue behind the portable [`crate::engine`] API.
//!
//! Only the Linux/Android `epoll(7)` backend is implemented; other Unix
//! targets fall back to `poll(2)`. See `DESIGN.md` for the scope cut
//! (kqueue/IOCP backends are not implemented here — the [`crate::engine`]
//! trait is the substitution point a platform port would extend).

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::{unix_event, Selector, SockEvent, SysEvents, Waker};
