//! The listener socket state machine (spec.md §4.5): `new → opened →
//! bound → listening → closed`, draining kernel-accepted connections into
//! stream sockets as the accept queue and any pending `accept` callers
//! demand them.

use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::engine::{Engine, EventSink};
use crate::error::{Result, RuntimeError};
use crate::event::Event;
use crate::interest::Interest;
use crate::primitive::RawSocket;
use crate::queue::accept_queue::{Accepted, AcceptQueue, PendingAccept};
use crate::queue::WatermarkEvent;
use crate::session::{ListenerSession, Operation, Watermark};
use crate::sockopt::SockOptBundle;
use crate::strand::Strand;
use crate::timer::{TimerEvent, TimerOptions, TimerSession};
use crate::token::Token;

use super::stream::{StreamConfig, StreamSocket};
use super::{next_id, OpenCell, OpenState};

/// The listener's own refinement of [`OpenState::Opened`]: a descriptor
/// can exist before it is bound, and be bound before it is listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenPhase {
    Unbound,
    Bound,
    Listening,
}

/// Construction-time options for a listener socket.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub backlog: i32,
    pub reuse_address: bool,
    pub accept_low_watermark: usize,
    pub accept_high_watermark: usize,
    pub accepted_options: SockOptBundle,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            backlog: 128,
            reuse_address: true,
            accept_low_watermark: 0,
            accept_high_watermark: usize::MAX,
            accepted_options: SockOptBundle::default(),
        }
    }
}

struct Phase {
    open: OpenCell,
    listen: ListenPhase,
}

/// A bound, listening descriptor that drains accepted connections into
/// the accept queue (spec.md §3's "Accept queue") and hands each one over
/// to a fresh [`StreamSocket`] via [`StreamSocket::import`].
pub struct ListenerSocket {
    token: Token,
    engine: Arc<dyn Engine>,
    strand: Arc<Strand>,
    raw: Mutex<Option<RawSocket>>,
    phase: Mutex<Phase>,
    accept_queue: Mutex<AcceptQueue>,
    config: ListenerConfig,
    session: Mutex<Option<Arc<dyn ListenerSession>>>,
    stream_config: Mutex<StreamConfig>,
    self_ref: Mutex<Weak<ListenerSocket>>,
}

impl ListenerSocket {
    pub fn open(engine: Arc<dyn Engine>, config: ListenerConfig) -> Arc<ListenerSocket> {
        let token = engine.next_token();
        let strand = engine.clone().create_strand();
        let accept_queue = AcceptQueue::new(config.accept_low_watermark, config.accept_high_watermark);
        let listener = Arc::new(ListenerSocket {
            token,
            engine,
            strand,
            raw: Mutex::new(None),
            phase: Mutex::new(Phase {
                open: OpenCell::new(OpenState::New),
                listen: ListenPhase::Unbound,
            }),
            accept_queue: Mutex::new(accept_queue),
            config,
            session: Mutex::new(None),
            stream_config: Mutex::new(StreamConfig::default()),
            self_ref: Mutex::new(Weak::new()),
        });
        *listener.self_ref.lock() = Arc::downgrade(&listener);
        listener
    }

    pub fn set_session(&self, session: Arc<dyn ListenerSession>) {
        *self.session.lock() = Some(session);
    }

    /// Options applied to every stream socket this listener imports from
    /// `accept`. Defaults to [`StreamConfig::default`] if never set.
    pub fn set_stream_config(&self, config: StreamConfig) {
        *self.stream_config.lock() = config;
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_open(&self) -> bool {
        self.phase.lock().open.load() != OpenState::Closed
    }

    fn session(&self) -> Option<Arc<dyn ListenerSession>> {
        self.session.lock().clone()
    }

    /// `bind(endpoint, reuse)`.
    pub fn bind(self: &Arc<Self>, endpoint: &Endpoint) -> Result<()> {
        let mut phase = self.phase.lock();
        if phase.open.load() != OpenState::New {
            return Err(RuntimeError::invalid("listener already opened"));
        }
        let socket = RawSocket::new_stream(endpoint)?;
        socket.bind(endpoint, self.config.reuse_address)?;
        *self.raw.lock() = Some(socket);
        phase.open.store(OpenState::Opened);
        phase.listen = ListenPhase::Bound;
        Ok(())
    }

    /// `listen(backlog)`.
    pub fn listen(self: &Arc<Self>) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            if phase.listen != ListenPhase::Bound {
                return Err(RuntimeError::invalid("listener not bound"));
            }
            let raw = self.raw.lock();
            let socket = raw.as_ref().ok_or(RuntimeError::invalid("listener not bound"))?;
            socket.listen(self.config.backlog)?;
            phase.listen = ListenPhase::Listening;
        }
        let fd = self.raw.lock().as_ref().map(|s| s.as_raw_fd()).unwrap();
        let sink = Arc::new(ListenerSink(self.clone())) as Arc<dyn EventSink>;
        self.engine.register(self.token, sink)?;
        self.engine.registry().register(fd, self.token, Interest::READABLE)?;
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.phase.lock().listen == ListenPhase::Listening
    }

    fn import(self: &Arc<Self>, accepted: Accepted) -> Arc<StreamSocket> {
        let config = self.stream_config.lock().clone();
        StreamSocket::import(self.engine.clone(), config, accepted.socket, self.self_ref.lock().clone())
    }

    /// `accept(context*, stream_socket*, options)` synchronous variant.
    /// Draining a ready connection still goes through
    /// [`StreamSocket::activate`] so the returned socket is already
    /// registered with the engine.
    pub fn accept_sync(self: &Arc<Self>) -> Result<Arc<StreamSocket>> {
        let (accepted, event) = self.accept_queue.lock().take_sync()?;
        self.announce_watermark(event);
        let stream = self.import(accepted);
        stream.activate()?;
        Ok(stream)
    }

    /// `accept(options, callback)` asynchronous variant. The callback
    /// receives a `Context` whose endpoint is the accepted peer; the
    /// caller is expected to pull the freshly imported [`StreamSocket`]
    /// from wherever `process_accepted` (or an out-of-band channel) wired
    /// it, matching spec.md §6's "(acceptor, event)" shape where the
    /// payload itself carries no socket handle.
    pub fn accept(self: &Arc<Self>, deadline: Option<Instant>, token: Option<u64>, callback: Arc<dyn Operation>) {
        let id = next_id();
        let event = self.accept_queue.lock().submit(PendingAccept {
            id,
            deadline,
            token,
            callback,
        });
        self.announce_watermark(event);
        if let Some(deadline) = deadline {
            let session = Arc::new(AcceptDeadline(self.clone(), id)) as Arc<dyn TimerSession>;
            let _timer = self.engine.clone().create_timer(TimerOptions::at(deadline), session);
        }
    }

    pub fn cancel(&self, token: u64) -> bool {
        self.accept_queue.lock().cancel(token)
    }

    fn expire_accept(&self, id: u64) {
        self.accept_queue.lock().expire(id);
    }

    pub fn local_endpoint(&self) -> Result<Endpoint> {
        self.raw
            .lock()
            .as_ref()
            .ok_or(RuntimeError::invalid("listener not bound"))?
            .local_endpoint()
    }

    fn announce_watermark(&self, event: WatermarkEvent) {
        let Some(session) = self.session() else {
            return;
        };
        match event {
            WatermarkEvent::None => {}
            WatermarkEvent::High => session.process_watermark(Watermark::AcceptQueueHigh),
            WatermarkEvent::Low => session.process_watermark(Watermark::AcceptQueueLow),
        }
    }

    /// `close()`: stop accepting, drop any ready-but-untaken connections,
    /// fail every pending `accept` request, detach.
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
        self.accept_queue.lock().fail_all(|| RuntimeError::Cancelled);
        *self.raw.lock() = None;
        let _ = self.engine.deregister(self.token);
    }

    /// Drain as many pending connections off the kernel backlog as are
    /// immediately available, offering each to the accept queue.
    fn drive_readable(self: &Arc<Self>) {
        if !self.is_listening() {
            return;
        }
        loop {
            let outcome = {
                let raw = self.raw.lock();
                raw.as_ref().map(|s| s.accept())
            };
            match outcome {
                Some(Ok((socket, peer))) => {
                    let event = self.accept_queue.lock().offer(Accepted { socket, peer: peer.clone() });
                    self.announce_watermark(event);
                    if let Some(session) = self.session() {
                        session.process_accepted(crate::descriptor::Descriptor::INVALID, &peer);
                    }
                }
                Some(Err(RuntimeError::WouldBlock)) | None => break,
                Some(Err(e)) => {
                    if let Some(session) = self.session() {
                        session.process_error(&e);
                    }
                    break;
                }
            }
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
    }

    fn handle_detached(&self) {
        if let Some(session) = self.session() {
            session.process_close();
        }
    }
}

/// See `stream.rs`'s `StreamSink` for why this shim exists: `on_event`
/// only has `&self`, but handling must be posted onto the listener's own
/// strand as an owned `Arc`.
struct ListenerSink(Arc<ListenerSocket>);

impl EventSink for ListenerSink {
    fn on_event(&self, event: Event) {
        let listener = self.0.clone();
        let strand = listener.strand.clone();
        strand.execute(move || listener.handle_event(event));
    }

    fn on_detached(&self) {
        let listener = self.0.clone();
        let strand = listener.strand.clone();
        strand.execute(move || listener.handle_detached());
    }
}

/// Fires a pending `accept`'s deadline with WOULD_BLOCK, posted onto the
/// listener's strand like any other event. A no-op if the request already
/// resolved (a connection arrived, it was cancelled, or the listener
/// closed) by the time this fires.
struct AcceptDeadline(Arc<ListenerSocket>, u64);

impl TimerSession for AcceptDeadline {
    fn on_timer(&self, event: TimerEvent) {
        if event != TimerEvent::Deadline {
            return;
        }
        let listener = self.0.clone();
        let id = self.1;
        let strand = listener.strand.clone();
        strand.execute(move || listener.expire_accept(id));
    }
}
