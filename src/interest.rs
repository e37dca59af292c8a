//! Readiness interests used when registering with the [reactor] engine.
//!
//! [reactor]: crate::engine::reactor

use std::fmt;
use std::num::NonZeroU8;
use std::ops;

const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const READ_CLOSED: u8 = 0b0100;
const WRITE_CLOSED: u8 = 0b1000;

/// A set of readiness interests.
///
/// `Poll` only returns events for operations explicitly requested here — if
/// a socket is registered with `READABLE` interest and becomes writable, no
/// event is produced for the writable transition.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

impl Interest {
    pub const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });
    pub const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });
    /// The read half of the connection closed (Linux/Android only report
    /// this as a hint; other platforms fold it into `READABLE`).
    pub const READ_CLOSED: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READ_CLOSED) });
    pub const WRITE_CLOSED: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITE_CLOSED) });

    /// Combine two interest sets. A `const` equivalent of `BitOr`.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    pub const fn is_readable(self) -> bool {
        self.0.get() & READABLE != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0.get() & WRITABLE != 0
    }

    pub const fn is_read_closed(self) -> bool {
        self.0.get() & READ_CLOSED != 0
    }

    pub const fn is_write_closed(self) -> bool {
        self.0.get() & WRITE_CLOSED != 0
    }

    pub(crate) const fn as_u8(self) -> u8 {
        self.0.get()
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, other: Self) {
        *self = *self | other;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        macro_rules! flag {
            ($cond:expr, $name:literal) => {
                if $cond {
                    if !first {
                        write!(f, " | ")?;
                    }
                    write!(f, $name)?;
                    first = false;
                }
            };
        }
        flag!(self.is_readable(), "READABLE");
        flag!(self.is_writable(), "WRITABLE");
        flag!(self.is_read_closed(), "READ_CLOSED");
        flag!(self.is_write_closed(), "WRITE_CLOSED");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combines_with_bitor() {
        let i = Interest::READABLE | Interest::WRITABLE;
        assert!(i.is_readable());
        assert!(i.is_writable());
        assert!(!i.is_read_closed());
    }
}
