//! The error taxonomy shared by every synchronous return and every
//! asynchronous completion event in this crate.

use std::io;

/// The coarse-grained kind of a [`RuntimeError`], exposed separately so
/// callers can match on it without string comparison.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No error.
    Ok,
    /// A non-blocking operation could not complete immediately; also used
    /// for deadline expiry on send/receive, where only that operation (not
    /// the whole socket) is affected.
    WouldBlock,
    /// A deadline elapsed on connect or upgrade.
    TimedOut,
    /// The operation was cancelled, either explicitly via a token or
    /// because the owning socket detached from its engine.
    Cancelled,
    /// The peer closed its sending half.
    Eof,
    /// The stream is irrecoverable.
    ConnectionDead,
    /// The stream was reset by the peer.
    ConnectionReset,
    /// Malformed arguments or an illegal state transition.
    Invalid,
    /// The requested option or operation is unsupported on this platform.
    NotImplemented,
    /// A descriptor or buffer limit was exhausted.
    ResourceLimit,
}

/// The error type returned by every fallible operation in this crate.
///
/// Synchronous APIs return this directly; asynchronous APIs deliver it
/// through the completing callback's [`crate::event::Context::error`]
/// field.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("would block")]
    WouldBlock,
    #[error("operation timed out")]
    TimedOut,
    #[error("operation cancelled")]
    Cancelled,
    #[error("end of file")]
    Eof,
    #[error("connection is no longer usable")]
    ConnectionDead,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("invalid argument or illegal state: {0}")]
    Invalid(String),
    #[error("not implemented on this platform: {0}")]
    NotImplemented(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RuntimeError {
    /// Classify this error into its [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::WouldBlock => ErrorKind::WouldBlock,
            RuntimeError::TimedOut => ErrorKind::TimedOut,
            RuntimeError::Cancelled => ErrorKind::Cancelled,
            RuntimeError::Eof => ErrorKind::Eof,
            RuntimeError::ConnectionDead => ErrorKind::ConnectionDead,
            RuntimeError::ConnectionReset => ErrorKind::ConnectionReset,
            RuntimeError::Invalid(_) => ErrorKind::Invalid,
            RuntimeError::NotImplemented(_) => ErrorKind::NotImplemented,
            RuntimeError::ResourceLimit(_) => ErrorKind::ResourceLimit,
            RuntimeError::Io(e) => io_error_kind(e),
        }
    }

    /// True if this error represents successful non-progress that the
    /// caller should treat as "try again later", not a failure.
    pub fn is_would_block(&self) -> bool {
        matches!(self.kind(), ErrorKind::WouldBlock)
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        RuntimeError::Invalid(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        RuntimeError::NotImplemented(msg.into())
    }

    pub fn resource_limit(msg: impl Into<String>) -> Self {
        RuntimeError::ResourceLimit(msg.into())
    }
}

fn io_error_kind(e: &io::Error) -> ErrorKind {
    match e.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
        io::ErrorKind::TimedOut => ErrorKind::TimedOut,
        io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
        io::ErrorKind::ConnectionAborted | io::ErrorKind::NotConnected => {
            ErrorKind::ConnectionDead
        }
        io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorKind::Invalid,
        _ => ErrorKind::ConnectionDead,
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_classifies() {
        let e = RuntimeError::WouldBlock;
        assert!(e.is_would_block());
        assert_eq!(e.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn io_error_maps_would_block() {
        let e: RuntimeError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(e.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn io_error_maps_eof() {
        let e: RuntimeError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert_eq!(e.kind(), ErrorKind::Eof);
    }
}
