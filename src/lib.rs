//! Core of an asynchronous networking runtime.
//!
//! This crate provides a pair of event-driven I/O engines — a [reactor]
//! (readiness notification) and a [proactor] (completion notification) —
//! together with the asynchronous [stream], [listener] and datagram socket
//! state machines layered above them.
//!
//! The engines are hidden behind a single [`engine::Engine`] trait so that
//! callers can substitute one for the other without touching socket code.
//! Everything above the engine — queues, watermarks, the [strand]
//! serialiser, the [timer] wheel, the [rate limiter] and the TLS upgrade
//! adapter — is engine-agnostic.
//!
//! [reactor]: engine::reactor
//! [proactor]: engine::proactor
//! [stream]: socket::stream
//! [listener]: socket::listener
//! [strand]: strand::Strand
//! [timer]: timer::TimerWheel
//! [rate limiter]: ratelimiter::RateLimiter

#![warn(rust_2018_idioms)]

#[macro_use]
mod macros;

pub mod buf;
pub mod descriptor;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod event;
pub mod interest;
pub mod primitive;
pub mod queue;
pub mod ratelimiter;
pub mod session;
pub mod sockopt;
pub mod socket;
pub mod strand;
mod sys;
pub mod timer;
#[cfg(feature = "tls")]
pub mod tls;
pub mod token;
pub mod waker;

pub use descriptor::Descriptor;
pub use endpoint::Endpoint;
pub use error::{ErrorKind, RuntimeError};
pub use event::{Event, Events};
pub use interest::Interest;
pub use token::Token;
