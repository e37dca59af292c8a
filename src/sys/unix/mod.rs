#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::{event as unix_event, Selector, SockEvent, SysEvents};

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod poll_shim;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub use poll_shim::{event as unix_event, Selector, SockEvent, SysEvents};

mod waker;
pub use waker::Waker;

/// Converts a `-1`-on-error libc return value into an `io::Result`,
/// mirroring errno.
pub(crate) fn cvt(result: libc::c_int) -> std::io::Result<libc::c_int> {
    if result == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(result)
    }
}
