//! Thin non-blocking wrapper over OS socket syscalls: the "raw socket
//! primitive" leaf of spec.md §2's component table. Everything here is a
//! direct pass-through to [`socket2::Socket`]; the engines and socket
//! state machines are where this crate's own logic lives.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::endpoint::Endpoint;
use crate::error::{Result, RuntimeError};
use crate::sockopt::SockOptBundle;

/// A non-blocking socket primitive: bind/listen/accept/connect/send/
/// receive/shutdown/close plus option get/set.
pub struct RawSocket {
    inner: Socket,
}

fn endpoint_to_sockaddr(endpoint: &Endpoint) -> Result<SockAddr> {
    match endpoint {
        Endpoint::Ip(addr) => Ok(SockAddr::from(*addr)),
        Endpoint::Local(path) => SockAddr::unix(path).map_err(RuntimeError::from),
    }
}

fn sockaddr_to_endpoint(addr: &SockAddr) -> Endpoint {
    if let Some(addr) = addr.as_socket() {
        Endpoint::Ip(addr)
    } else {
        Endpoint::Local(std::path::PathBuf::new())
    }
}

impl RawSocket {
    fn new_nonblocking(domain: Domain, ty: Type, protocol: Option<Protocol>) -> Result<RawSocket> {
        let ty = ty.nonblocking();
        let inner = Socket::new(domain, ty, protocol)?;
        Ok(RawSocket { inner })
    }

    pub fn new_stream(endpoint: &Endpoint) -> Result<RawSocket> {
        let domain = match endpoint {
            Endpoint::Ip(addr) => Domain::for_address(*addr),
            Endpoint::Local(_) => Domain::UNIX,
        };
        let protocol = matches!(endpoint, Endpoint::Ip(_)).then_some(Protocol::TCP);
        Self::new_nonblocking(domain, Type::STREAM, protocol)
    }

    pub fn new_datagram(endpoint: &Endpoint) -> Result<RawSocket> {
        let domain = match endpoint {
            Endpoint::Ip(addr) => Domain::for_address(*addr),
            Endpoint::Local(_) => Domain::UNIX,
        };
        let protocol = matches!(endpoint, Endpoint::Ip(_)).then_some(Protocol::UDP);
        Self::new_nonblocking(domain, Type::DGRAM, protocol)
    }

    /// Wrap an already-open, already-non-blocking descriptor (e.g. one
    /// handed over from `accept`).
    ///
    /// # Safety
    /// `fd` must be a valid, open socket descriptor not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> RawSocket {
        RawSocket {
            inner: Socket::from_raw_fd(fd),
        }
    }

    pub fn bind(&self, endpoint: &Endpoint, reuse: bool) -> Result<()> {
        if reuse {
            self.inner.set_reuse_address(true)?;
        }
        let addr = endpoint_to_sockaddr(endpoint)?;
        self.inner.bind(&addr)?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.inner.listen(backlog)?;
        Ok(())
    }

    pub fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        let addr = endpoint_to_sockaddr(endpoint)?;
        match self.inner.connect(&addr) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.raw_os_error(), Some(libc::EINPROGRESS)) => {
                Err(RuntimeError::WouldBlock)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(RuntimeError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    /// Non-blocking accept; returns `RuntimeError::WouldBlock` if no
    /// connection is pending.
    pub fn accept(&self) -> Result<(RawSocket, Endpoint)> {
        match self.inner.accept() {
            Ok((socket, addr)) => {
                socket.set_nonblocking(true)?;
                Ok((RawSocket { inner: socket }, sockaddr_to_endpoint(&addr)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(RuntimeError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    pub fn send(&self, data: &[u8]) -> Result<usize> {
        match (&self.inner).write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(RuntimeError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    pub fn send_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        match (&self.inner).write_vectored(bufs) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(RuntimeError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    pub fn send_to(&self, data: &[u8], endpoint: &Endpoint) -> Result<usize> {
        let addr = endpoint_to_sockaddr(endpoint)?;
        match self.inner.send_to(data, &addr) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(RuntimeError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    pub fn receive(&self, data: &mut [u8]) -> Result<usize> {
        match (&self.inner).read(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(RuntimeError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    pub fn receive_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        match (&self.inner).read_vectored(bufs) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(RuntimeError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    pub fn receive_from(&self, data: &mut [u8]) -> Result<(usize, Endpoint)> {
        // `socket2::Socket::recv_from` takes `&mut [MaybeUninit<u8>]`; we
        // only ever read into already-initialized caller buffers here.
        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                data.as_mut_ptr() as *mut std::mem::MaybeUninit<u8>,
                data.len(),
            )
        };
        match self.inner.recv_from(buf) {
            Ok((n, addr)) => Ok((n, sockaddr_to_endpoint(&addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(RuntimeError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        match self.inner.shutdown(how) {
            Ok(()) => Ok(()),
            // Already shut down / not connected: treat as success, per
            // spec.md's "shutdown is monotonic per direction" invariant.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn apply_options(&self, opts: &SockOptBundle) -> Result<()> {
        opts.apply(&self.inner)
    }

    pub fn local_endpoint(&self) -> Result<Endpoint> {
        Ok(sockaddr_to_endpoint(&self.inner.local_addr()?))
    }

    pub fn peer_endpoint(&self) -> Result<Endpoint> {
        Ok(sockaddr_to_endpoint(&self.inner.peer_addr()?))
    }

    pub fn join_multicast(&self, group: std::net::Ipv4Addr, iface: std::net::Ipv4Addr) -> Result<()> {
        self.inner.join_multicast_v4(&group, &iface)?;
        Ok(())
    }

    pub fn leave_multicast(&self, group: std::net::Ipv4Addr, iface: std::net::Ipv4Addr) -> Result<()> {
        self.inner.leave_multicast_v4(&group, &iface)?;
        Ok(())
    }

    pub fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
        self.inner.set_multicast_ttl_v4(ttl)?;
        Ok(())
    }

    pub fn set_multicast_loopback(&self, loopback: bool) -> Result<()> {
        self.inner.set_multicast_loop_v4(loopback)?;
        Ok(())
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl IntoRawFd for RawSocket {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}
