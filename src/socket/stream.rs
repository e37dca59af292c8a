//! The stream socket state machine (spec.md §4.6): connect, TLS upgrade/
//! downgrade, the send/receive disciplines, and ordered shutdown/close.

use std::net::Shutdown as StdShutdown;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buf::{BlobFactory, IoBuf};
use crate::endpoint::Endpoint;
use crate::engine::{Engine, EventSink};
use crate::error::{Result, RuntimeError};
use crate::event::{Context, Event, Transport};
use crate::interest::Interest;
use crate::primitive::RawSocket;
use crate::queue::connect_queue::{ConnectState, RetryPolicy};
use crate::queue::read_queue::{PendingReceive, ReadQueue};
use crate::queue::write_queue::{WriteEntry, WriteQueue};
use crate::queue::WatermarkEvent;
use crate::ratelimiter::{Admission, RateLimiter};
use crate::session::{Operation, ShutdownPhase, StreamSession, Watermark};
use crate::sockopt::SockOptBundle;
use crate::strand::Strand;
use crate::timer::{TimerEvent, TimerOptions, TimerSession};
use crate::token::Token;

use super::listener::ListenerSocket;
use super::{next_id, Direction, OpenCell, OpenState, ShutdownMode, ShutdownState};

#[cfg(feature = "tls")]
use crate::tls::{TlsAdapter, UpgradeOptions};

/// Construction-time options for a stream socket (spec.md §6).
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub read_low_watermark: usize,
    pub read_high_watermark: usize,
    pub write_low_watermark: usize,
    pub write_high_watermark: usize,
    pub send_greedily: bool,
    pub receive_greedily: bool,
    pub keep_half_open: bool,
    pub send_rate_limit: Option<(usize, usize)>,
    pub receive_rate_limit: Option<(usize, usize)>,
    pub options: SockOptBundle,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            read_low_watermark: 1,
            read_high_watermark: usize::MAX,
            write_low_watermark: 0,
            write_high_watermark: usize::MAX,
            send_greedily: true,
            receive_greedily: true,
            keep_half_open: false,
            send_rate_limit: None,
            receive_rate_limit: None,
            options: SockOptBundle::default(),
        }
    }
}

/// `send`/`receive` per-call options.
#[derive(Debug, Clone, Default)]
pub struct IoOptions {
    pub deadline: Option<Instant>,
    pub token: Option<u64>,
}

struct Phase {
    open: OpenCell,
    connecting: bool,
    shutdown_send: ShutdownState,
    shutdown_receive: ShutdownState,
}

/// A connected (or connecting) byte stream over a reactor or proactor
/// engine, composing the read/write queues, rate limiters and optional
/// TLS adapter spec.md §2 lists as the stream socket's dependencies.
pub struct StreamSocket {
    token: Token,
    engine: Arc<dyn Engine>,
    strand: Arc<Strand>,
    raw: Mutex<Option<RawSocket>>,
    phase: Mutex<Phase>,
    read_queue: Mutex<ReadQueue>,
    write_queue: Mutex<WriteQueue>,
    connect_state: Mutex<Option<ConnectState>>,
    send_limiter: RateLimiter,
    receive_limiter: RateLimiter,
    config: StreamConfig,
    session: Mutex<Option<Arc<dyn StreamSession>>>,
    acceptor: Option<Weak<ListenerSocket>>,
    armed: Mutex<Interest>,
    #[cfg(feature = "tls")]
    tls: Mutex<Option<TlsAdapter>>,
    #[cfg(feature = "tls")]
    tls_upgrade_callback: Mutex<Option<Arc<dyn Operation>>>,
}

impl StreamSocket {
    /// `open(transport[, handle[, acceptor]])` for the ordinary (non-
    /// imported) case.
    pub fn open(engine: Arc<dyn Engine>, config: StreamConfig) -> Arc<StreamSocket> {
        Self::new(engine, config, None, None)
    }

    /// Wrap a descriptor handed over by an accepting listener, recording
    /// the back-reference (`ntcp_streamsocket.h`'s "imported open").
    pub fn import(
        engine: Arc<dyn Engine>,
        config: StreamConfig,
        socket: RawSocket,
        acceptor: Weak<ListenerSocket>,
    ) -> Arc<StreamSocket> {
        Self::new(engine, config, Some(socket), Some(acceptor))
    }

    fn new(
        engine: Arc<dyn Engine>,
        config: StreamConfig,
        socket: Option<RawSocket>,
        acceptor: Option<Weak<ListenerSocket>>,
    ) -> Arc<StreamSocket> {
        let token = engine.next_token();
        let strand = engine.clone().create_strand();
        let blob_factory = BlobFactory::default();
        let read_queue = ReadQueue::new(
            &blob_factory,
            config.read_low_watermark,
            config.read_high_watermark,
        );
        let write_queue = WriteQueue::new(config.write_low_watermark, config.write_high_watermark);
        let opened = socket.is_some();
        let send_limiter = match config.send_rate_limit {
            Some((cap, rate)) => RateLimiter::new(cap, rate),
            None => RateLimiter::unlimited(),
        };
        let receive_limiter = match config.receive_rate_limit {
            Some((cap, rate)) => RateLimiter::new(cap, rate),
            None => RateLimiter::unlimited(),
        };
        Arc::new(StreamSocket {
            token,
            engine,
            strand,
            raw: Mutex::new(socket),
            phase: Mutex::new(Phase {
                open: OpenCell::new(if opened { OpenState::Opened } else { OpenState::New }),
                connecting: false,
                shutdown_send: ShutdownState::Active,
                shutdown_receive: ShutdownState::Active,
            }),
            read_queue: Mutex::new(read_queue),
            write_queue: Mutex::new(write_queue),
            connect_state: Mutex::new(None),
            send_limiter,
            receive_limiter,
            config,
            session: Mutex::new(None),
            acceptor,
            armed: Mutex::new(Interest::READABLE),
            #[cfg(feature = "tls")]
            tls: Mutex::new(None),
            #[cfg(feature = "tls")]
            tls_upgrade_callback: Mutex::new(None),
        })
    }

    pub fn set_session(&self, session: Arc<dyn StreamSession>) {
        *self.session.lock() = Some(session);
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Who accepted this socket, if it was imported rather than opened
    /// directly.
    pub fn acceptor(&self) -> Option<Weak<ListenerSocket>> {
        self.acceptor.clone()
    }

    pub fn is_open(&self) -> bool {
        self.phase.lock().open.load() != OpenState::Closed
    }

    fn session(&self) -> Option<Arc<dyn StreamSession>> {
        self.session.lock().clone()
    }

    fn fd(&self) -> Option<i32> {
        self.raw.lock().as_ref().map(|s| s.as_raw_fd())
    }

    fn rearm(&self, interest: Interest) -> Result<()> {
        let mut armed = self.armed.lock();
        if let Some(fd) = self.fd() {
            if *armed == interest {
                return Ok(());
            }
            self.engine.registry().reregister(fd, self.token, interest)?;
            *armed = interest;
        }
        Ok(())
    }

    /// Register this socket's dispatch sink with its engine. Called once
    /// an underlying descriptor exists, whether from
    /// [`connect`][Self::connect] or after a listener hands over an
    /// accepted one.
    fn register_sink(self: &Arc<Self>) -> Result<()> {
        let sink = Arc::new(StreamSink(self.clone())) as Arc<dyn EventSink>;
        self.engine.register(self.token, sink)
    }

    /// Begin servicing an already-open, already-connected descriptor (the
    /// path a [`ListenerSocket`] drives after accepting one).
    pub fn activate(self: &Arc<Self>) -> Result<()> {
        self.register_sink()?;
        let fd = self.fd().ok_or(RuntimeError::ConnectionDead)?;
        self.engine.registry().register(fd, self.token, Interest::READABLE)?;
        *self.armed.lock() = Interest::READABLE;
        Ok(())
    }

    /// `connect(endpoint|name, options, callback)`.
    pub fn connect(
        self: &Arc<Self>,
        endpoint: Endpoint,
        deadline: Option<Instant>,
        retry: RetryPolicy,
        callback: Arc<dyn Operation>,
    ) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            if phase.open.load() == OpenState::New {
                let socket = RawSocket::new_stream(&endpoint)?;
                socket.apply_options(&self.config.options)?;
                *self.raw.lock() = Some(socket);
                phase.open.store(OpenState::Opened);
            }
            phase.connecting = true;
        }
        let mut state = ConnectState::new(endpoint.clone(), deadline, retry);
        state.callback = Some(callback);
        *self.connect_state.lock() = Some(state);
        self.register_sink()?;
        if let Some(deadline) = deadline {
            let session = Arc::new(ConnectDeadline(self.clone())) as Arc<dyn TimerSession>;
            let _timer = self.engine.clone().create_timer(TimerOptions::at(deadline), session);
        }
        self.attempt_connect(endpoint)
    }

    fn attempt_connect(self: &Arc<Self>, endpoint: Endpoint) -> Result<()> {
        let retrying = self
            .connect_state
            .lock()
            .as_ref()
            .is_some_and(|state| state.attempt > 0);
        if let Some(state) = self.connect_state.lock().as_mut() {
            state.record_attempt();
        }
        if retrying {
            // A non-blocking connect that already failed once cannot
            // portably be retried on the same descriptor; start over on a
            // fresh one bound to the same target.
            if let Some(old) = self.raw.lock().take() {
                let _ = self.engine.registry().deregister(old.as_raw_fd());
            }
            let socket = RawSocket::new_stream(&endpoint)?;
            socket.apply_options(&self.config.options)?;
            *self.raw.lock() = Some(socket);
        }
        let fd = {
            let raw = self.raw.lock();
            let socket = raw.as_ref().ok_or(RuntimeError::ConnectionDead)?;
            match socket.connect(&endpoint) {
                Ok(()) | Err(RuntimeError::WouldBlock) => {}
                Err(e) => return Err(e),
            }
            socket.as_raw_fd()
        };
        self.engine.registry().register(fd, self.token, Interest::WRITABLE)?;
        *self.armed.lock() = Interest::WRITABLE;
        if let Some(session) = self.session() {
            session.process_connect_initiated();
        }
        Ok(())
    }

    fn finish_connect_ok(self: &Arc<Self>) {
        let state = self.connect_state.lock().take();
        self.phase.lock().connecting = false;
        if let Some(session) = self.session() {
            session.process_connect_complete(&Context::ok(0, Transport::Stream));
        }
        if let Some(state) = state {
            if let Some(callback) = state.callback {
                callback.complete(Context::ok(0, Transport::Stream));
            }
        }
        let _ = self.rearm(Interest::READABLE);
    }

    /// Fail the in-progress connect, taking its state so a stale retry or
    /// deadline timer that fires afterward sees `connecting` already
    /// cleared and no-ops. `make_error` is a factory rather than one
    /// `RuntimeError` since the session callback and the user callback
    /// each need their own instance (`RuntimeError` is not `Clone`).
    fn finish_connect_err(self: &Arc<Self>, make_error: impl Fn() -> RuntimeError) {
        let state = self.connect_state.lock().take();
        self.phase.lock().connecting = false;
        if let Some(session) = self.session() {
            session.process_connect_complete(&Context::err(make_error(), Transport::Stream));
        }
        if let Some(state) = state {
            if let Some(callback) = state.callback {
                callback.complete(Context::err(make_error(), Transport::Stream));
            }
        }
    }

    /// A connect attempt just failed (refused, reset, or otherwise). Arm
    /// a retry per the connect's `RetryPolicy` if budget and deadline
    /// allow; otherwise fail it with TIMED_OUT (deadline elapsed) or
    /// CONNECTION_DEAD (retries exhausted with no deadline in play).
    fn handle_connect_failure(self: &Arc<Self>) {
        let retry = {
            let guard = self.connect_state.lock();
            guard
                .as_ref()
                .filter(|state| state.should_retry())
                .map(|state| (state.target.clone(), state.retry.retry_interval))
        };
        match retry {
            Some((target, interval)) => {
                let session = Arc::new(ConnectRetry(self.clone(), target)) as Arc<dyn TimerSession>;
                let _timer = self.engine.clone().create_timer(TimerOptions::after(interval), session);
            }
            None => {
                let timed_out = self
                    .connect_state
                    .lock()
                    .as_ref()
                    .is_some_and(|state| state.deadline_elapsed());
                if timed_out {
                    self.finish_connect_err(|| RuntimeError::TimedOut);
                } else {
                    self.finish_connect_err(|| RuntimeError::ConnectionDead);
                }
            }
        }
    }

    /// `send(data, options[, callback])`.
    pub fn send(
        self: &Arc<Self>,
        data: IoBuf<'static>,
        options: IoOptions,
        callback: Option<Arc<dyn Operation>>,
    ) -> Result<usize> {
        if !self.is_servicable() {
            return Err(RuntimeError::ConnectionDead);
        }

        // Under an active upgrade, the write queue carries ciphertext: wrap
        // the caller's plaintext once up front and record its length so
        // completions still report plaintext bytes (see `WriteEntry::plain_len`).
        #[cfg(feature = "tls")]
        let (data, plain_len) = {
            let mut tls_guard = self.tls.lock();
            if let Some(adapter) = tls_guard.as_mut() {
                let plaintext = Self::plaintext_bytes(&data)?;
                let ciphertext = adapter.wrap_plaintext(&plaintext)?;
                drop(tls_guard);
                let mut blob = crate::buf::BlobFactory::default().new_blob();
                blob.push(&ciphertext);
                (IoBuf::Blob(blob), Some(plaintext.len()))
            } else {
                (data, None)
            }
        };
        #[cfg(not(feature = "tls"))]
        let plain_len: Option<usize> = None;
        let tls_active = plain_len.is_some();

        let mut entry = WriteEntry::new(next_id(), data);
        entry.plain_len = plain_len;
        entry.deadline = options.deadline;
        entry.token = options.token;
        entry.callback = callback;

        let was_empty = self.write_queue.lock().is_empty();

        let mut sent_now = 0;
        if was_empty {
            sent_now += self.pump_entry(&mut entry, usize::MAX).unwrap_or(0);
            if self.config.send_greedily && !entry.is_complete() {
                sent_now += self.pump_entry(&mut entry, usize::MAX).unwrap_or(0);
            }
        }
        if entry.is_complete() {
            let report = entry.report_len();
            if let Some(callback) = entry.callback {
                callback.complete(Context::ok(report, Transport::Stream));
            }
            return Ok(if tls_active { report } else { sent_now });
        }

        let id = entry.id;
        let deadline = entry.deadline;
        let event = self.write_queue.lock().push(entry);
        self.announce_watermark(event, Direction::Send);
        let _ = self.rearm(Interest::READABLE.add(Interest::WRITABLE));
        if let Some(deadline) = deadline {
            let session = Arc::new(SendDeadline(self.clone(), id)) as Arc<dyn TimerSession>;
            let _timer = self.engine.clone().create_timer(TimerOptions::at(deadline), session);
        }
        // A partially-flushed ciphertext entry has no well-defined
        // plaintext-bytes-accepted count until it completes; report 0
        // rather than the wire byte count.
        Ok(if tls_active { 0 } else { sent_now })
    }

    #[cfg(feature = "tls")]
    fn plaintext_bytes(data: &IoBuf<'static>) -> Result<Vec<u8>> {
        match data {
            IoBuf::Const(b) => Ok(b.to_vec()),
            IoBuf::Mut(b) => Ok(b.to_vec()),
            IoBuf::Blob(blob) => Ok(blob.chunks().flatten().copied().collect()),
            IoBuf::File(_) => Err(RuntimeError::not_implemented("file-backed send under TLS")),
        }
    }

    /// Attempt to move up to `cap` bytes of `entry`'s unsent payload into
    /// the socket send buffer directly, consulting the rate limiter first.
    /// A `Blob` payload is sent vectored instead of copied; a `File`
    /// payload is rejected outright (no `sendfile` path in this crate —
    /// see `DESIGN.md`).
    fn pump_entry(&self, entry: &mut WriteEntry, cap: usize) -> Result<usize> {
        if matches!(entry.payload, IoBuf::File(_)) {
            return Err(RuntimeError::not_implemented("file-backed send"));
        }
        if let Some(slices) = entry.blob_io_slices() {
            if slices.is_empty() {
                return Ok(0);
            }
            let admitted = self.admit_send(entry.remaining.min(cap));
            if admitted == 0 {
                return Ok(0);
            }
            let raw = self.raw.lock();
            let socket = raw.as_ref().ok_or(RuntimeError::ConnectionDead)?;
            match socket.send_vectored(&slices) {
                Ok(n) => {
                    drop(raw);
                    entry.advance_blob(n);
                    Ok(n)
                }
                Err(RuntimeError::WouldBlock) => Ok(0),
                Err(e) => Err(e),
            }
        } else {
            let remaining = entry.remaining_slice();
            if remaining.is_empty() {
                return Ok(0);
            }
            let admitted = self.admit_send(remaining.len().min(cap));
            if admitted == 0 {
                return Ok(0);
            }
            let raw = self.raw.lock();
            let socket = raw.as_ref().ok_or(RuntimeError::ConnectionDead)?;
            match socket.send(&remaining[..admitted]) {
                Ok(n) => {
                    drop(raw);
                    entry.advance(n);
                    Ok(n)
                }
                Err(RuntimeError::WouldBlock) => Ok(0),
                Err(e) => Err(e),
            }
        }
    }

    fn admit_send(&self, want: usize) -> usize {
        match self.send_limiter.consume(want) {
            Admission::Allowed => want,
            Admission::Wait(_) => self.send_limiter.available(),
        }
    }

    /// `receive(context*, data, options)` synchronous variant.
    pub fn receive_sync(&self, data: &mut [u8], min_size: usize) -> Result<usize> {
        self.read_queue.lock().take_sync(data, min_size)
    }

    /// `receive(options, callback)` asynchronous variant.
    pub fn receive(
        self: &Arc<Self>,
        min_size: usize,
        max_size: usize,
        options: IoOptions,
        callback: Arc<dyn Operation>,
    ) {
        let id = next_id();
        let mut read_queue = self.read_queue.lock();
        read_queue.submit(PendingReceive {
            id,
            min_size,
            max_size,
            deadline: options.deadline,
            token: options.token,
            callback,
        });
        let event = read_queue.drain_pending();
        drop(read_queue);
        self.announce_watermark(event, Direction::Receive);
        if let Some(deadline) = options.deadline {
            let session = Arc::new(ReceiveDeadline(self.clone(), id)) as Arc<dyn TimerSession>;
            let _timer = self.engine.clone().create_timer(TimerOptions::at(deadline), session);
        }
    }

    pub fn cancel(&self, token: u64) -> bool {
        self.read_queue.lock().cancel(token) || self.write_queue.lock().cancel(token)
    }

    fn is_servicable(&self) -> bool {
        let phase = self.phase.lock();
        phase.open.load() == OpenState::Opened && !phase.shutdown_send.is_shut()
    }

    /// `shutdown(direction, mode)`.
    pub fn shutdown(self: &Arc<Self>, direction: Direction, mode: ShutdownMode) -> Result<()> {
        let mut phase = self.phase.lock();
        let state = match direction {
            Direction::Send => &mut phase.shutdown_send,
            Direction::Receive => &mut phase.shutdown_receive,
        };
        if state.is_shut() {
            return Ok(());
        }
        *state = ShutdownState::InitiatedLocally;
        drop(phase);

        if let Some(session) = self.session() {
            session.process_shutdown(ShutdownPhase::Initiated);
        }

        match (direction, mode) {
            (Direction::Send, ShutdownMode::Immediate) => {
                self.write_queue.lock().fail_all(|| RuntimeError::Cancelled);
                self.do_shutdown(StdShutdown::Write)?;
            }
            (Direction::Send, ShutdownMode::Graceful) => {
                if self.write_queue.lock().is_empty() {
                    self.do_shutdown(StdShutdown::Write)?;
                }
                // Otherwise deferred: `drive_writable` finishes the
                // shutdown once the queue empties.
            }
            (Direction::Receive, _) => {
                self.read_queue.lock().fail_all(|| RuntimeError::Cancelled);
                self.do_shutdown(StdShutdown::Read)?;
            }
        }

        let mut phase = self.phase.lock();
        let state = match direction {
            Direction::Send => &mut phase.shutdown_send,
            Direction::Receive => &mut phase.shutdown_receive,
        };
        if *state == ShutdownState::InitiatedLocally {
            *state = ShutdownState::Complete;
        }
        let complete = phase.shutdown_send.is_shut() && phase.shutdown_receive.is_shut();
        drop(phase);

        if let Some(session) = self.session() {
            match direction {
                Direction::Send => session.process_shutdown(ShutdownPhase::Send),
                Direction::Receive => session.process_shutdown(ShutdownPhase::Receive),
            }
            if complete {
                session.process_shutdown(ShutdownPhase::Complete);
            }
        }
        Ok(())
    }

    fn do_shutdown(&self, how: StdShutdown) -> Result<()> {
        if let Some(socket) = self.raw.lock().as_ref() {
            socket.shutdown(how)?;
        }
        Ok(())
    }

    /// `close()`: immediate shutdown on both directions, detach, close
    /// callback exactly once.
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
        self.write_queue.lock().fail_all(|| RuntimeError::Cancelled);
        self.read_queue.lock().fail_all(|| RuntimeError::Cancelled);
        let _ = self.do_shutdown(StdShutdown::Both);
        *self.raw.lock() = None;
        let _ = self.engine.deregister(self.token);
    }

    fn announce_watermark(&self, event: WatermarkEvent, direction: Direction) {
        let Some(session) = self.session() else {
            return;
        };
        let watermark = match (direction, event) {
            (_, WatermarkEvent::None) => return,
            (Direction::Send, WatermarkEvent::High) => Watermark::WriteQueueHigh,
            (Direction::Send, WatermarkEvent::Low) => Watermark::WriteQueueLow,
            (Direction::Receive, WatermarkEvent::High) => Watermark::ReadQueueHigh,
            (Direction::Receive, WatermarkEvent::Low) => Watermark::ReadQueueLow,
        };
        session.process_watermark(watermark);
    }

    fn drive_readable(self: &Arc<Self>) {
        if self.phase.lock().connecting {
            self.drive_connect_outcome();
            return;
        }
        loop {
            let admitted = self.admit_receive(4096);
            if admitted == 0 {
                let wait = self.receive_limiter.available().max(1) as u64;
                self.arm_throttle_timer(Duration::from_millis(wait));
                return;
            }
            let mut buf = vec![0u8; admitted];
            let result = {
                let raw = self.raw.lock();
                raw.as_ref().map(|s| s.receive(&mut buf))
            };
            match result {
                Some(Ok(0)) => {
                    self.handle_eof();
                    break;
                }
                Some(Ok(n)) => {
                    let breached = match self.ingest_received(&buf[..n]) {
                        Ok(breached) => breached,
                        Err(e) => {
                            self.fail_socket(e);
                            break;
                        }
                    };
                    if breached {
                        let _ = self.rearm(*self.armed.lock());
                        break;
                    }
                    if n < admitted || !self.config.receive_greedily {
                        break;
                    }
                }
                Some(Err(RuntimeError::WouldBlock)) | None => break,
                Some(Err(e)) => {
                    self.fail_socket(e);
                    break;
                }
            }
        }
    }

    /// Route newly-arrived raw bytes through the active TLS adapter, if
    /// any, before they reach the read queue. Returns whether the read
    /// queue's high watermark is now breached.
    fn ingest_received(self: &Arc<Self>, data: &[u8]) -> Result<bool> {
        #[cfg(feature = "tls")]
        {
            let mut tls_guard = self.tls.lock();
            if let Some(adapter) = tls_guard.as_mut() {
                let cleartext = adapter.feed_ciphertext(data)?;
                let outgoing = adapter.drain_outgoing()?;
                drop(tls_guard);
                if !outgoing.is_empty() {
                    if let Some(socket) = self.raw.lock().as_ref() {
                        socket.send(&outgoing)?;
                    }
                }
                self.check_tls_handshake_complete();
                return Ok(self.deliver_cleartext(&cleartext));
            }
        }
        Ok(self.deliver_cleartext(data))
    }

    fn deliver_cleartext(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let (event, drain_event, breached) = {
            let mut read_queue = self.read_queue.lock();
            let event = read_queue.fill(data);
            let drain_event = read_queue.drain_pending();
            (event, drain_event, read_queue.is_breached())
        };
        self.announce_watermark(event, Direction::Receive);
        self.announce_watermark(drain_event, Direction::Receive);
        breached
    }

    #[cfg(feature = "tls")]
    fn check_tls_handshake_complete(&self) {
        let done = {
            let mut tls = self.tls.lock();
            match tls.as_mut() {
                Some(adapter) if !adapter.is_closing() => !adapter.is_handshaking(),
                _ => false,
            }
        };
        if !done {
            return;
        }
        let Some(callback) = self.tls_upgrade_callback.lock().take() else {
            return;
        };
        if let Some(session) = self.session() {
            session.process_upgrade_complete(&Context::ok(0, Transport::Stream));
        }
        callback.complete(Context::ok(0, Transport::Stream));
    }

    fn admit_receive(&self, want: usize) -> usize {
        match self.receive_limiter.consume(want) {
            Admission::Allowed => want,
            Admission::Wait(_) => self.receive_limiter.available(),
        }
    }

    fn drive_connect_outcome(self: &Arc<Self>) {
        let connected = self
            .raw
            .lock()
            .as_ref()
            .map(|s| s.peer_endpoint().is_ok())
            .unwrap_or(false);
        if connected {
            self.finish_connect_ok();
        } else {
            self.handle_connect_failure();
        }
    }

    fn drive_writable(self: &Arc<Self>) {
        if self.phase.lock().connecting {
            self.drive_connect_outcome();
            return;
        }
        loop {
            let mut write_queue = self.write_queue.lock();
            let Some(entry) = write_queue.front_mut() else {
                drop(write_queue);
                let _ = self.rearm(Interest::READABLE);
                self.finish_graceful_shutdown_if_pending();
                return;
            };
            match self.pump_entry(entry, usize::MAX) {
                Ok(0) => break,
                Ok(n) => {
                    let event = write_queue.account_sent(n);
                    drop(write_queue);
                    self.announce_watermark(event, Direction::Send);
                }
                Err(e) => {
                    drop(write_queue);
                    self.fail_socket(e);
                    break;
                }
            }
        }
    }

    fn finish_graceful_shutdown_if_pending(&self) {
        let mut phase = self.phase.lock();
        if phase.shutdown_send == ShutdownState::InitiatedLocally && self.write_queue.lock().is_empty() {
            phase.shutdown_send = ShutdownState::Complete;
            drop(phase);
            let _ = self.do_shutdown(StdShutdown::Write);
            if let Some(session) = self.session() {
                session.process_shutdown(ShutdownPhase::Send);
            }
        }
    }

    fn handle_eof(self: &Arc<Self>) {
        let event = {
            let mut read_queue = self.read_queue.lock();
            read_queue.mark_eof();
            read_queue.drain_pending()
        };
        self.announce_watermark(event, Direction::Receive);

        {
            let mut phase = self.phase.lock();
            phase.shutdown_receive = ShutdownState::InitiatedRemotely;
        }
        if let Some(session) = self.session() {
            session.process_shutdown(ShutdownPhase::Receive);
        }
        if !self.config.keep_half_open {
            let _ = self.shutdown(Direction::Send, ShutdownMode::Graceful);
        }
    }

    fn fail_socket(self: &Arc<Self>, error: RuntimeError) {
        if let Some(session) = self.session() {
            session.process_error(&error);
        }
        self.write_queue.lock().fail_all(|| RuntimeError::ConnectionDead);
        self.read_queue.lock().fail_all(|| RuntimeError::ConnectionDead);
        self.close();
    }

    fn arm_throttle_timer(self: &Arc<Self>, wait: Duration) {
        let session = Arc::new(ThrottleTimer(self.clone())) as Arc<dyn TimerSession>;
        let _timer = self.engine.clone().create_timer(TimerOptions::after(wait), session);
    }

    /// `upgrade(options, callback)`: begins a TLS handshake over the
    /// socket's existing byte stream. The callback fires once the
    /// handshake completes, not immediately — for the client role that
    /// means after the first flight is sent here and the rest is driven
    /// from [`Self::ingest_received`] as the peer's flights arrive.
    #[cfg(feature = "tls")]
    pub fn upgrade(self: &Arc<Self>, options: UpgradeOptions, callback: Arc<dyn Operation>) -> Result<()> {
        let mut adapter = TlsAdapter::new(options)?;
        let outgoing = adapter.drain_outgoing()?;
        *self.tls.lock() = Some(adapter);
        *self.tls_upgrade_callback.lock() = Some(callback);
        if !outgoing.is_empty() {
            if let Some(socket) = self.raw.lock().as_ref() {
                socket.send(&outgoing)?;
            }
        }
        if let Some(session) = self.session() {
            session.process_upgrade_initiated();
        }
        self.check_tls_handshake_complete();
        Ok(())
    }

    /// `downgrade(callback)`: sends a close-notify and reverts to plain
    /// bytes. A handshake still in flight is cancelled rather than
    /// completed.
    #[cfg(feature = "tls")]
    pub fn downgrade(self: &Arc<Self>, callback: Arc<dyn Operation>) -> Result<()> {
        let mut tls = self.tls.lock();
        if let Some(adapter) = tls.as_mut() {
            if let Some(session) = self.session() {
                session.process_downgrade_initiated();
            }
            let wire = adapter.begin_close()?;
            if let Some(socket) = self.raw.lock().as_ref() {
                socket.send(&wire)?;
            }
        }
        *tls = None;
        drop(tls);
        if let Some(pending) = self.tls_upgrade_callback.lock().take() {
            pending.complete(Context::err(RuntimeError::Cancelled, Transport::Stream));
        }
        if let Some(session) = self.session() {
            session.process_downgrade_complete(&Context::ok(0, Transport::Stream));
        }
        callback.complete(Context::ok(0, Transport::Stream));
        Ok(())
    }

    fn handle_event(self: &Arc<Self>, event: Event) {
        if event.is_error() {
            self.fail_socket(RuntimeError::ConnectionDead);
            return;
        }
        if event.is_readable() || event.is_read_closed() {
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

/// A dispatch shim registered with the engine in place of `StreamSocket`
/// directly: `EventSink::on_event` takes `&self`, but handling an event
/// needs an owned `Arc<StreamSocket>` to post onto the socket's own
/// [`Strand`] (spec.md §5's per-socket serialisation guarantee).
struct StreamSink(Arc<StreamSocket>);

impl EventSink for StreamSink {
    fn on_event(&self, event: Event) {
        let socket = self.0.clone();
        let strand = socket.strand.clone();
        strand.execute(move || socket.handle_event(event));
    }

    fn on_detached(&self) {
        let socket = self.0.clone();
        let strand = socket.strand.clone();
        strand.execute(move || socket.handle_detached());
    }
}

/// Retries a throttled receive once the rate limiter should have
/// refilled, posted onto the socket's strand like any other event.
struct ThrottleTimer(Arc<StreamSocket>);

impl TimerSession for ThrottleTimer {
    fn on_timer(&self, event: TimerEvent) {
        if event != TimerEvent::Deadline {
            return;
        }
        let socket = self.0.clone();
        let strand = socket.strand.clone();
        strand.execute(move || socket.drive_readable());
    }
}

/// Fires a pending `receive`'s deadline with WOULD_BLOCK, posted onto the
/// socket's strand. A no-op if the request already resolved.
struct ReceiveDeadline(Arc<StreamSocket>, u64);

impl TimerSession for ReceiveDeadline {
    fn on_timer(&self, event: TimerEvent) {
        if event != TimerEvent::Deadline {
            return;
        }
        let socket = self.0.clone();
        let id = self.1;
        let strand = socket.strand.clone();
        strand.execute(move || socket.read_queue.lock().expire(id));
    }
}

/// Fires a queued send entry's deadline with WOULD_BLOCK if it hasn't
/// started transmitting yet, posted onto the socket's strand. A no-op if
/// the entry already started, completed, or was cancelled.
struct SendDeadline(Arc<StreamSocket>, u64);

impl TimerSession for SendDeadline {
    fn on_timer(&self, event: TimerEvent) {
        if event != TimerEvent::Deadline {
            return;
        }
        let socket = self.0.clone();
        let id = self.1;
        let strand = socket.strand.clone();
        strand.execute(move || {
            let event = socket.write_queue.lock().expire(id);
            socket.announce_watermark(event, Direction::Send);
        });
    }
}

/// Fails an in-progress connect with TIMED_OUT once its deadline elapses,
/// posted onto the socket's strand. A no-op if the connect already
/// resolved (success, failure, or a prior firing of this same timer
/// already cleared `connecting`).
struct ConnectDeadline(Arc<StreamSocket>);

impl TimerSession for ConnectDeadline {
    fn on_timer(&self, event: TimerEvent) {
        if event != TimerEvent::Deadline {
            return;
        }
        let socket = self.0.clone();
        let strand = socket.strand.clone();
        strand.execute(move || {
            if !socket.phase.lock().connecting {
                return;
            }
            socket.finish_connect_err(|| RuntimeError::TimedOut);
        });
    }
}

/// Re-initiates a connect attempt after a transient failure, posted onto
/// the socket's strand like any other event. A no-op if the connect
/// already resolved by the time the retry interval elapses.
struct ConnectRetry(Arc<StreamSocket>, Endpoint);

impl TimerSession for ConnectRetry {
    fn on_timer(&self, event: TimerEvent) {
        if event != TimerEvent::Deadline {
            return;
        }
        let socket = self.0.clone();
        let target = self.1.clone();
        let strand = socket.strand.clone();
        strand.execute(move || {
            if !socket.phase.lock().connecting {
                return;
            }
            if socket.attempt_connect(target).is_err() {
                socket.handle_connect_failure();
            }
        });
    }
}
