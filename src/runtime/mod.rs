//! Single-threaded reactor runtime.
//!
//! Readiness-based I/O over a pluggable backend:
//! - `backend`: mio (epoll/kqueue) or poll(2), chosen at startup
//! - `reactor`: descriptor-indexed event table and the wait/dispatch loop
//! - `connection`: per-client socket plus reader/writer buffers
//! - `listener`: bound socket and non-blocking accept

pub mod backend;
mod buffer;
mod connection;
mod interest;
mod listener;
mod reactor;
mod token;

pub use backend::{Backend, BackendType};
pub use buffer::{Flush, Reader, Writer};
pub use connection::{ConnState, Connection, ReadOutcome};
pub use interest::Mask;
pub use listener::Listener;
pub use reactor::{Reactor, Service, DEFAULT_TICK};
pub use token::Token;
