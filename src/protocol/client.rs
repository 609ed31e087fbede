//! Blocking client for the request side of the protocol.

use crate::protocol::frame::{pack_request, ResponseHeader, HEADER_SIZE};
use crate::Result;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Send one request without waiting for the reply.
    pub fn send(&mut self, kind: u16, body: &[u8]) -> Result<()> {
        self.stream.write_all(&pack_request(kind, body))?;
        Ok(())
    }

    /// Block until one reply frame arrives.
    pub fn recv(&mut self) -> Result<Response> {
        let mut header = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header)?;
        let header = ResponseHeader::decode(&header)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "short reply header"))?;

        let mut body = vec![0u8; header.size as usize];
        self.stream.read_exact(&mut body)?;
        Ok(Response {
            code: header.code,
            body,
        })
    }

    /// Send a request and wait for its reply.
    pub fn call(&mut self, kind: u16, body: &[u8]) -> Result<Response> {
        self.send(kind, body)?;
        self.recv()
    }

    /// Underlying socket, for tests that write raw bytes.
    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}
