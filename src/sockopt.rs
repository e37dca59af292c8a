//! Socket options, get/set individually or via the tagged-union
//! [`SockOpt`] form, backed by `socket2`.

use std::time::Duration;

use socket2::Socket;

use crate::error::{Result, RuntimeError};

/// A single socket option, named and valued.
///
/// Mirrors spec.md §3's enumerated option set. Options outside this set
/// (e.g. `IPV6_V6ONLY`, raw `SO_ERROR` queries) are a deliberate scope cut
/// — see `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SockOpt {
    ReuseAddress(bool),
    KeepAlive(bool),
    NoDelay(bool),
    Linger(Option<Duration>),
    SendBufferSize(usize),
    ReceiveBufferSize(usize),
    SendLowWatermark(usize),
    ReceiveLowWatermark(usize),
    Broadcast(bool),
    BypassRouting(bool),
    InlineOutOfBand(bool),
    TimestampIncoming(bool),
    TimestampOutgoing(bool),
    ZeroCopy(bool),
}

impl SockOpt {
    /// Apply this option to `socket`.
    pub fn apply(self, socket: &Socket) -> Result<()> {
        use SockOpt::*;
        match self {
            ReuseAddress(v) => socket.set_reuse_address(v)?,
            KeepAlive(v) => socket.set_keepalive(v)?,
            NoDelay(v) => socket.set_tcp_nodelay(v)?,
            Linger(d) => socket.set_linger(d)?,
            SendBufferSize(n) => socket.set_send_buffer_size(n)?,
            ReceiveBufferSize(n) => socket.set_recv_buffer_size(n)?,
            SendLowWatermark(_) | ReceiveLowWatermark(_) => {
                // Enforced in software by the read/write queue watermarks,
                // not by a kernel socket option on every platform.
                return Ok(());
            }
            Broadcast(v) => socket.set_broadcast(v)?,
            BypassRouting(_) => {
                return Err(RuntimeError::not_implemented("SO_DONTROUTE"));
            }
            InlineOutOfBand(v) => socket.set_out_of_band_inline(v)?,
            TimestampIncoming(_) | TimestampOutgoing(_) => {
                return Err(RuntimeError::not_implemented("SO_TIMESTAMP"));
            }
            ZeroCopy(_) => {
                return Err(RuntimeError::not_implemented("SO_ZEROCOPY"));
            }
        }
        Ok(())
    }
}

/// Options applied when a socket is opened, bundled for convenience.
#[derive(Debug, Clone, Default)]
pub struct SockOptBundle {
    pub reuse_address: bool,
    pub keep_alive: bool,
    pub no_delay: bool,
    pub linger: Option<Duration>,
    pub send_buffer_size: Option<usize>,
    pub receive_buffer_size: Option<usize>,
}

impl SockOptBundle {
    pub fn apply(&self, socket: &Socket) -> Result<()> {
        if self.reuse_address {
            SockOpt::ReuseAddress(true).apply(socket)?;
        }
        if self.keep_alive {
            SockOpt::KeepAlive(true).apply(socket)?;
        }
        if self.no_delay {
            SockOpt::NoDelay(true).apply(socket)?;
        }
        if self.linger.is_some() {
            SockOpt::Linger(self.linger).apply(socket)?;
        }
        if let Some(n) = self.send_buffer_size {
            SockOpt::SendBufferSize(n).apply(socket)?;
        }
        if let Some(n) = self.receive_buffer_size {
            SockOpt::ReceiveBufferSize(n).apply(socket)?;
        }
        Ok(())
    }
}
