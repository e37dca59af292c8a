//! The datagram socket state machine (spec.md §4.7): `new → opened →
//! (bound) → (connected) → closed`, with per-operation endpoint overrides
//! and multicast group management.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::engine::{Engine, EventSink};
use crate::error::{Result, RuntimeError};
use crate::event::{Context, Event, Transport};
use crate::interest::Interest;
use crate::primitive::RawSocket;
use crate::ratelimiter::{Admission, RateLimiter};
use crate::session::{Operation, SocketSession};
use crate::sockopt::SockOptBundle;
use crate::strand::Strand;
use crate::token::Token;

use super::{OpenCell, OpenState};

/// Construction-time options for a datagram socket.
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    pub send_rate_limit: Option<(usize, usize)>,
    pub receive_rate_limit: Option<(usize, usize)>,
    pub timestamp_receives: bool,
    pub options: SockOptBundle,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        DatagramConfig {
            send_rate_limit: None,
            receive_rate_limit: None,
            timestamp_receives: false,
            options: SockOptBundle::default(),
        }
    }
}

/// `send`/`receive` per-call options. `endpoint` overrides the socket's
/// connected peer (if any) for one operation, per spec.md §4.7's
/// "per-operation endpoint override".
#[derive(Debug, Clone, Default)]
pub struct DatagramIoOptions {
    pub endpoint: Option<Endpoint>,
    pub deadline: Option<Instant>,
}

struct PendingReceive {
    buffer_len: usize,
    deadline: Option<Instant>,
    token: Option<u64>,
    callback: Arc<dyn Operation>,
}

struct Phase {
    open: OpenCell,
    bound: bool,
    connected_peer: Option<Endpoint>,
}

/// A connectionless socket. Unlike [`super::stream::StreamSocket`] there is
/// no ordered byte stream or watermark-backed queue here: each datagram is
/// either delivered whole or not at all, so the only asynchronous state is
/// a FIFO of callers waiting for the next arrival.
pub struct DatagramSocket {
    token: Token,
    engine: Arc<dyn Engine>,
    strand: Arc<Strand>,
    raw: Mutex<Option<RawSocket>>,
    phase: Mutex<Phase>,
    pending_receives: Mutex<Vec<PendingReceive>>,
    send_limiter: RateLimiter,
    receive_limiter: RateLimiter,
    config: DatagramConfig,
    session: Mutex<Option<Arc<dyn SocketSession>>>,
    armed: Mutex<Interest>,
}

impl DatagramSocket {
    pub fn open(engine: Arc<dyn Engine>, endpoint: &Endpoint, config: DatagramConfig) -> Result<Arc<DatagramSocket>> {
        let socket = RawSocket::new_datagram(endpoint)?;
        socket.apply_options(&config.options)?;
        socket.bind(endpoint, false)?;
        let token = engine.next_token();
        let strand = engine.clone().create_strand();
        let send_limiter = match config.send_rate_limit {
            Some((cap, rate)) => RateLimiter::new(cap, rate),
            None => RateLimiter::unlimited(),
        };
        let receive_limiter = match config.receive_rate_limit {
            Some((cap, rate)) => RateLimiter::new(cap, rate),
            None => RateLimiter::unlimited(),
        };
        let datagram = Arc::new(DatagramSocket {
            token,
            engine,
            strand,
            raw: Mutex::new(Some(socket)),
            phase: Mutex::new(Phase {
                open: OpenCell::new(OpenState::Opened),
                bound: true,
                connected_peer: None,
            }),
            pending_receives: Mutex::new(Vec::new()),
            send_limiter,
            receive_limiter,
            config,
            session: Mutex::new(None),
            armed: Mutex::new(Interest::READABLE),
        });
        datagram.activate()?;
        Ok(datagram)
    }

    pub fn set_session(&self, session: Arc<dyn SocketSession>) {
        *self.session.lock() = Some(session);
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_open(&self) -> bool {
        self.phase.lock().open.load() != OpenState::Closed
    }

    pub fn is_bound(&self) -> bool {
        self.phase.lock().bound
    }

    fn session(&self) -> Option<Arc<dyn SocketSession>> {
        self.session.lock().clone()
    }

    fn fd(&self) -> Option<i32> {
        self.raw.lock().as_ref().map(|s| s.as_raw_fd())
    }

    /// `bind(endpoint, reuse)`: rebind to a specific local address.
    /// `open` already binds to the endpoint it was given (an ephemeral
    /// port if unspecified), so this is only needed to move to a
    /// different, caller-chosen address afterward.
    pub fn bind(&self, endpoint: &Endpoint, reuse: bool) -> Result<()> {
        let raw = self.raw.lock();
        let socket = raw.as_ref().ok_or(RuntimeError::ConnectionDead)?;
        socket.bind(endpoint, reuse)?;
        drop(raw);
        self.phase.lock().bound = true;
        Ok(())
    }

    fn activate(self: &Arc<Self>) -> Result<()> {
        let sink = Arc::new(DatagramSink(self.clone())) as Arc<dyn EventSink>;
        self.engine.register(self.token, sink)?;
        let fd = self.fd().ok_or(RuntimeError::ConnectionDead)?;
        self.engine.registry().register(fd, self.token, Interest::READABLE)?;
        *self.armed.lock() = Interest::READABLE;
        Ok(())
    }

    /// `connect(endpoint)`: fixes the default peer for subsequent
    /// `send`/`receive` calls that don't override it, without performing a
    /// handshake (spec.md §4.7: connectionless connect is purely local
    /// peer-address filtering).
    pub fn connect(&self, endpoint: Endpoint) -> Result<()> {
        if let Some(socket) = self.raw.lock().as_ref() {
            socket.connect(&endpoint).or_else(|e| match e {
                RuntimeError::WouldBlock => Ok(()),
                other => Err(other),
            })?;
        }
        self.phase.lock().connected_peer = Some(endpoint);
        Ok(())
    }

    fn resolve_peer(&self, options: &DatagramIoOptions) -> Result<Endpoint> {
        options
            .endpoint
            .clone()
            .or_else(|| self.phase.lock().connected_peer.clone())
            .ok_or_else(|| RuntimeError::invalid("no endpoint given and socket is not connected"))
    }

    /// `send(data, options[, callback])`. Datagram sends are never queued:
    /// either the kernel accepts the whole datagram immediately or the
    /// operation fails (spec.md §4.7: "no partial datagram writes").
    pub fn send(self: &Arc<Self>, data: &[u8], options: DatagramIoOptions) -> Result<usize> {
        if !self.is_open() {
            return Err(RuntimeError::ConnectionDead);
        }
        match self.send_limiter.consume(data.len()) {
            Admission::Allowed => {}
            Admission::Wait(_) => return Err(RuntimeError::WouldBlock),
        }
        let peer = self.resolve_peer(&options)?;
        let raw = self.raw.lock();
        let socket = raw.as_ref().ok_or(RuntimeError::ConnectionDead)?;
        socket.send_to(data, &peer)
    }

    /// `receive(context*, data, options)` synchronous variant.
    pub fn receive_sync(&self, data: &mut [u8]) -> Result<(usize, Endpoint)> {
        if self.receive_limiter.consume(data.len()) == Admission::Allowed {
            let raw = self.raw.lock();
            let socket = raw.as_ref().ok_or(RuntimeError::ConnectionDead)?;
            socket.receive_from(data)
        } else {
            Err(RuntimeError::WouldBlock)
        }
    }

    /// `receive(options, callback)` asynchronous variant. There is no
    /// queue to drain into up front (datagrams are delivered straight off
    /// the socket when readable); this just registers interest in the next
    /// arrival.
    pub fn receive(&self, buffer_len: usize, deadline: Option<Instant>, token: Option<u64>, callback: Arc<dyn Operation>) {
        self.pending_receives.lock().push(PendingReceive {
            buffer_len,
            deadline,
            token,
            callback,
        });
    }

    /// Cancel the pending receive matching `token`, if any.
    pub fn cancel(&self, token: u64) -> bool {
        let mut pending = self.pending_receives.lock();
        if let Some(pos) = pending.iter().position(|p| p.token == Some(token)) {
            let entry = pending.remove(pos);
            entry.callback.complete(Context::err(RuntimeError::Cancelled, Transport::Datagram));
            true
        } else {
            false
        }
    }

    pub fn join_multicast(&self, group: std::net::Ipv4Addr, iface: std::net::Ipv4Addr) -> Result<()> {
        self.raw
            .lock()
            .as_ref()
            .ok_or(RuntimeError::ConnectionDead)?
            .join_multicast(group, iface)
    }

    pub fn leave_multicast(&self, group: std::net::Ipv4Addr, iface: std::net::Ipv4Addr) -> Result<()> {
        self.raw
            .lock()
            .as_ref()
            .ok_or(RuntimeError::ConnectionDead)?
            .leave_multicast(group, iface)
    }

    pub fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
        self.raw
            .lock()
            .as_ref()
            .ok_or(RuntimeError::ConnectionDead)?
            .set_multicast_ttl(ttl)
    }

    pub fn set_multicast_loopback(&self, loopback: bool) -> Result<()> {
        self.raw
            .lock()
            .as_ref()
            .ok_or(RuntimeError::ConnectionDead)?
            .set_multicast_loopback(loopback)
    }

    pub fn local_endpoint(&self) -> Result<Endpoint> {
        self.raw.lock().as_ref().ok_or(RuntimeError::ConnectionDead)?.local_endpoint()
    }

    /// `shutdown`/`close()`: there is no half-duplex concept for a
    /// datagram socket, so this is a single terminal transition (spec.md
    /// §4.7's Non-goal list excludes a `Direction`-scoped datagram
    /// shutdown).
    pub fn close(self: &Arc<Self>) {
        let already_closed = {
            let mut phase = self.phase.lock();
            if phase.open.load() == OpenState::Closed {
                true
            } else {
                phase.open.store(OpenState::Closed);
                false
            }
        };
        if already_closed {
            return;
        }
        for entry in self.pending_receives.lock().drain(..) {
            entry.callback.complete(Context::err(RuntimeError::Cancelled, Transport::Datagram));
        }
        *self.raw.lock() = None;
        let _ = self.engine.deregister(self.token);
    }

    fn drive_readable(self: &Arc<Self>) {
        loop {
            let pending = {
                let mut pending = self.pending_receives.lock();
                if pending.is_empty() {
                    return;
                }
                let now_expired: Vec<_> = pending
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.deadline.is_some_and(|d| Instant::now() >= d))
                    .map(|(i, _)| i)
                    .collect();
                for i in now_expired.into_iter().rev() {
                    let expired = pending.remove(i);
                    expired
                        .callback
                        .complete(Context::err(RuntimeError::TimedOut, Transport::Datagram));
                }
                if pending.is_empty() {
                    return;
                }
                pending.remove(0)
            };

            let admitted = match self.receive_limiter.consume(pending.buffer_len) {
                Admission::Allowed => true,
                Admission::Wait(_) => false,
            };
            if !admitted {
                self.pending_receives.lock().insert(0, pending);
                return;
            }

            let mut buf = vec![0u8; pending.buffer_len];
            let raw = self.raw.lock();
            let Some(socket) = raw.as_ref() else { return };
            match socket.receive_from(&mut buf) {
                Ok((n, peer)) => {
                    drop(raw);
                    let mut context = Context::ok(n, Transport::Datagram).with_endpoint(peer);
                    if self.config.timestamp_receives {
                        context = context.with_timestamp(Instant::now());
                    }
                    pending.callback.complete(context);
                }
                Err(RuntimeError::WouldBlock) => {
                    drop(raw);
                    self.pending_receives.lock().insert(0, pending);
                    return;
                }
                Err(e) => {
                    drop(raw);
                    if let Some(session) = self.session() {
                        session.process_error(&e);
                    }
                    pending.callback.complete(Context::err(RuntimeError::ConnectionDead, Transport::Datagram));
                }
            }
        }
    }

    fn drive_writable(&self) {
        // Datagram sends never queue (see `send`'s doc comment), so there
        // is nothing to drain here; writability is still requested while a
        // connecting-equivalent send previously failed with `WouldBlock`.
        let mut armed = self.armed.lock();
        *armed = Interest::READABLE;
        if let Some(fd) = self.fd() {
            let _ = self.engine.registry().reregister(fd, self.token, Interest::READABLE);
        }
    }

    fn handle_event(self: &Arc<Self>, event: Event) {
        if event.is_error() {
            if let Some(session) = self.session() {
                session.process_error(&RuntimeError::ConnectionDead);
            }
            return;
        }
        if event.is_readable() {
            self.drive_readable();
        }
        if event.is_writable() {
            self.drive_writable();
        }
    }

    fn handle_detached(&self) {
        if let Some(session) = self.session() {
            session.process_close();
        }
    }
}

struct DatagramSink(Arc<DatagramSocket>);

impl EventSink for DatagramSink {
    fn on_event(&self, event: Event) {
        let datagram = self.0.clone();
        let strand = datagram.strand.clone();
        strand.execute(move || datagram.handle_event(event));
    }

    fn on_detached(&self) {
        let datagram = self.0.clone();
        let strand = datagram.strand.clone();
        strand.execute(move || datagram.handle_detached());
    }
}
