//! Addressing: a tagged variant over IPv4/IPv6 socket addresses and local
//! (Unix-domain) paths.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// A peer or local address.
///
/// `Local` covers both named filesystem paths and, on Linux, abstract
/// namespace paths (conventionally represented with a leading NUL byte,
/// which `socket2`/libc accept directly).
#[derive(Clone, Eq, PartialEq, Hash)]
pub enum Endpoint {
    Ip(SocketAddr),
    Local(PathBuf),
}

impl Endpoint {
    pub fn ip(addr: SocketAddr) -> Endpoint {
        Endpoint::Ip(addr)
    }

    pub fn local(path: impl AsRef<Path>) -> Endpoint {
        Endpoint::Local(path.as_ref().to_path_buf())
    }

    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Ip(addr) => Some(*addr),
            Endpoint::Local(_) => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Endpoint::Local(p) => Some(p),
            Endpoint::Ip(_) => None,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{addr}"),
            Endpoint::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        Endpoint::Ip(addr)
    }
}
