//! The TLS upgrade/downgrade adapter (spec.md §4.6 "TLS interleaving").
//!
//! While a stream socket is upgraded, outbound bytes pass through the
//! record layer here before reaching the socket send buffer, and inbound
//! bytes from the receive buffer are fed in before cleartext reaches the
//! read queue. Built on `rustls`'s `Connection` state machine the same
//! way a synchronous adapter would, since this crate has no async runtime
//! underneath to hand to `tokio-rustls`.

use std::io::{Read, Write};
use std::sync::Arc;

use rustls::{ClientConnection, ServerConnection};
use rustls_pki_types::ServerName;

use crate::error::{Result, RuntimeError};

/// Which side of the handshake this socket plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Acceptor,
}

enum Inner {
    Client(Box<ClientConnection>),
    Server(Box<ServerConnection>),
}

/// Construction-time TLS parameters (spec.md §3 "Upgrade state").
pub struct UpgradeOptions {
    pub role: TlsRole,
    pub client_config: Option<Arc<rustls::ClientConfig>>,
    pub server_config: Option<Arc<rustls::ServerConfig>>,
    pub server_name: Option<String>,
}

/// The record-layer adapter injected between the raw byte stream and the
/// read/write queues for the lifetime of one upgrade.
pub struct TlsAdapter {
    inner: Inner,
    closing: bool,
}

impl TlsAdapter {
    pub fn new(options: UpgradeOptions) -> Result<TlsAdapter> {
        let inner = match options.role {
            TlsRole::Client => {
                let config = options
                    .client_config
                    .ok_or_else(|| RuntimeError::invalid("missing client_config for TLS upgrade"))?;
                let name = options
                    .server_name
                    .ok_or_else(|| RuntimeError::invalid("missing server_name for TLS client upgrade"))?;
                let server_name = ServerName::try_from(name.as_str())
                    .map_err(|_| RuntimeError::invalid("invalid server name"))?
                    .to_owned();
                let conn = ClientConnection::new(config, server_name)
                    .map_err(|e| RuntimeError::invalid(e.to_string()))?;
                Inner::Client(Box::new(conn))
            }
            TlsRole::Acceptor => {
                let config = options
                    .server_config
                    .ok_or_else(|| RuntimeError::invalid("missing server_config for TLS upgrade"))?;
                let conn =
                    ServerConnection::new(config).map_err(|e| RuntimeError::invalid(e.to_string()))?;
                Inner::Server(Box::new(conn))
            }
        };
        Ok(TlsAdapter {
            inner,
            closing: false,
        })
    }

    // `ClientConnection`/`ServerConnection` both `Deref`/`DerefMut` to a
    // `ConnectionCommon<_>` carrying `read_tls`/`write_tls`/
    // `process_new_packets`/`reader`/`writer`/`is_handshaking`/
    // `wants_read`/`wants_write`/`send_close_notify` as inherent methods,
    // but with different `Data` type parameters — so unlike a plain
    // getter, every operation here matches on `self.inner` once rather
    // than deref-coercing to one shared type.

    pub fn is_handshaking(&mut self) -> bool {
        match &mut self.inner {
            Inner::Client(c) => c.is_handshaking(),
            Inner::Server(c) => c.is_handshaking(),
        }
    }

    pub fn wants_write(&mut self) -> bool {
        match &mut self.inner {
            Inner::Client(c) => c.wants_write(),
            Inner::Server(c) => c.wants_write(),
        }
    }

    pub fn wants_read(&mut self) -> bool {
        match &mut self.inner {
            Inner::Client(c) => c.wants_read(),
            Inner::Server(c) => c.wants_read(),
        }
    }

    /// Feed ciphertext that just arrived from the socket's raw receive
    /// buffer; returns any cleartext that is now available.
    pub fn feed_ciphertext(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut cursor = std::io::Cursor::new(data);
        let mut cleartext = Vec::new();
        let mut buf = [0u8; 4096];
        macro_rules! pump {
            ($c:expr) => {{
                $c.read_tls(&mut cursor)
                    .map_err(|e| RuntimeError::invalid(e.to_string()))?;
                $c.process_new_packets()
                    .map_err(|e| RuntimeError::invalid(e.to_string()))?;
                let mut reader = $c.reader();
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => cleartext.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(RuntimeError::invalid(e.to_string())),
                    }
                }
            }};
        }
        match &mut self.inner {
            Inner::Client(c) => pump!(c),
            Inner::Server(c) => pump!(c),
        }
        Ok(cleartext)
    }

    /// Encrypt `plaintext` and return the wire bytes to send to the peer.
    pub fn wrap_plaintext(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match &mut self.inner {
            Inner::Client(c) => c
                .writer()
                .write_all(plaintext)
                .map_err(|e| RuntimeError::invalid(e.to_string()))?,
            Inner::Server(c) => c
                .writer()
                .write_all(plaintext)
                .map_err(|e| RuntimeError::invalid(e.to_string()))?,
        }
        self.drain_outgoing()
    }

    /// Pull any ciphertext the connection wants to send, independent of
    /// plaintext writes (handshake flights, alerts, close-notify).
    pub fn drain_outgoing(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        macro_rules! pump {
            ($c:expr) => {
                while $c.wants_write() {
                    let n = $c
                        .write_tls(&mut out)
                        .map_err(|e| RuntimeError::invalid(e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                }
            };
        }
        match &mut self.inner {
            Inner::Client(c) => pump!(c),
            Inner::Server(c) => pump!(c),
        }
        Ok(out)
    }

    /// Begin a close-notify exchange (spec.md's `downgrade()`).
    pub fn begin_close(&mut self) -> Result<Vec<u8>> {
        self.closing = true;
        match &mut self.inner {
            Inner::Client(c) => c.send_close_notify(),
            Inner::Server(c) => c.send_close_notify(),
        }
        self.drain_outgoing()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_client_upgrade_without_config() {
        let result = TlsAdapter::new(UpgradeOptions {
            role: TlsRole::Client,
            client_config: None,
            server_config: None,
            server_name: Some("example.com".into()),
        });
        assert!(result.is_err());
    }
}
