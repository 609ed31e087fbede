//! Connection state machine for client sockets.
//!
//! `Accepted -> Active -> Released`. A connection owns its socket and both
//! buffers; releasing it drops the socket (closing the descriptor) and the
//! descriptor is never touched again afterwards.

use crate::runtime::buffer::{Flush, Reader, Writer};
use crate::Result;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket accepted, not yet registered.
    Accepted,
    /// Registered for read interest.
    Active,
    /// Socket closed. Terminal.
    Released,
}

/// Result of a single bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes appended to the reader.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// Peer closed its side.
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    /// `None` once released.
    stream: Option<TcpStream>,
    peer: SocketAddr,
    state: ConnState,
    last_read: Instant,
    pub reader: Reader,
    pub writer: Writer,
}

impl Connection {
    /// Wrap a freshly accepted socket.
    pub fn new(stream: TcpStream, peer: SocketAddr, read_limit: usize) -> Self {
        Self {
            stream: Some(stream),
            peer,
            state: ConnState::Accepted,
            last_read: Instant::now(),
            reader: Reader::new(read_limit),
            writer: Writer::new(),
        }
    }

    /// Descriptor, or `None` after release.
    pub fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Registration succeeded.
    pub fn activate(&mut self) {
        debug_assert_eq!(self.state, ConnState::Accepted);
        self.state = ConnState::Active;
    }

    /// Time since the last successful read.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_read)
    }

    /// Issue one read into `scratch` and append what arrived to the reader.
    pub fn read_from(&mut self, scratch: &mut [u8]) -> Result<ReadOutcome> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(ReadOutcome::Closed);
        };

        let n = loop {
            match stream.read(scratch) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.reader.append(&scratch[..n])?;
        self.last_read = Instant::now();
        Ok(ReadOutcome::Data(n))
    }

    /// Write staged reply bytes.
    pub fn flush(&mut self) -> io::Result<Flush> {
        match self.stream.as_mut() {
            Some(stream) => self.writer.flush_to(stream),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection released",
            )),
        }
    }

    /// Close the socket. Safe to call more than once.
    pub fn close(&mut self) {
        self.stream = None;
        self.state = ConnState::Released;
    }
}
