//! Cross-thread wakeup for an engine blocked in `poll`.

use crate::engine::reactor::Registry;
use crate::error::Result;
use crate::token::Token;

/// Wakes a blocked [`crate::engine::reactor::Reactor::poll`] from another
/// thread. Only one `Waker` should be active per engine; share it via
/// `Arc` if several threads need to wake the same one.
#[derive(Debug)]
pub struct Waker {
    inner: crate::sys::Waker,
}

impl Waker {
    pub fn new(registry: &Registry, token: Token) -> Result<Waker> {
        let inner = crate::sys::Waker::new(registry.selector(), token)?;
        Ok(Waker { inner })
    }

    pub fn wake(&self) -> Result<()> {
        self.inner.wake()?;
        Ok(())
    }
}
