//! reactord: a single-threaded, readiness-driven server for a small framed
//! binary protocol.
//!
//! - `runtime`: pluggable readiness backends, the event reactor, buffers
//!   and connection lifecycle
//! - `protocol`: frame layout, command table, codec and a blocking client
//! - `server`: wires the listener, reactor and codec together
//! - `config`, `signal`, `alloc`: process-level plumbing

pub mod alloc;
pub mod config;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod signal;

pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
