//! Error types shared by the runtime, protocol and server layers.

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Descriptor does not fit in the reactor's fixed event table.
    #[error("descriptor {fd} exceeds event table capacity {capacity}")]
    Capacity { fd: RawFd, capacity: usize },

    #[error("reader buffer overflow: {needed} bytes exceeds limit {limit}")]
    BufferOverflow { needed: usize, limit: usize },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
