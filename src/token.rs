//! An opaque identifier a caller associates with a registration so that a
//! readiness or completion event can be mapped back to its owner.

use std::fmt;

/// Associates an I/O registration with the engine. Picked by the caller and
/// echoed back on every [`crate::Event`] produced for that registration.
///
/// `Token` is also used as the key under which a socket is indexed in an
/// engine's internal descriptor table (see [`crate::engine::Engine`]).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(token: Token) -> usize {
        token.0
    }
}

impl From<usize> for Token {
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_usize() {
        let t = Token(42);
        let raw: usize = t.into();
        assert_eq!(raw, 42);
        assert_eq!(Token::from(raw), t);
    }
}
