//! Per-connection byte accumulators.
//!
//! - `Reader`: inbound bytes appended by the read handler and consumed by
//!   the codec. `0 <= read_pos <= len <= limit` always holds; bytes before
//!   `read_pos` are consumed and reclaimed by `compact`.
//! - `Writer`: reply bytes staged by the codec and drained by the write
//!   handler. Drained once `write_pos == len`.

use crate::{Error, Result};
use std::io::{self, Write};

/// Inbound accumulator with a consumption cursor.
#[derive(Debug)]
pub struct Reader {
    buf: Vec<u8>,
    read_pos: usize,
    /// Maximum unconsumed bytes held at once.
    limit: usize,
}

impl Reader {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            read_pos: 0,
            limit,
        }
    }

    /// Append freshly read bytes.
    ///
    /// Fails without modifying the buffer if the unconsumed bytes would
    /// exceed the limit.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let needed = self.remaining() + data.len();
        if needed > self.limit {
            return Err(Error::BufferOverflow {
                needed,
                limit: self.limit,
            });
        }
        self.compact();
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Unconsumed bytes.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.read_pos..]
    }

    /// Number of unconsumed bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.read_pos
    }

    /// Total bytes held, consumed or not.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Position of the next unconsumed byte.
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Mark `n` bytes as consumed.
    ///
    /// # Panics
    /// Panics if `n` exceeds the unconsumed byte count.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.remaining(), "consume past end of reader");
        self.read_pos += n;
        if self.read_pos == self.buf.len() {
            self.buf.clear();
            self.read_pos = 0;
        }
    }

    /// Move unconsumed bytes to the front of the buffer.
    pub fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        let len = self.buf.len();
        self.buf.copy_within(self.read_pos..len, 0);
        self.buf.truncate(len - self.read_pos);
        self.read_pos = 0;
    }
}

/// Outcome of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Every staged byte was written.
    Drained,
    /// Bytes remain; wait for the next write readiness.
    Partial,
}

/// Outbound accumulator with a progress cursor.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
    write_pos: usize,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage bytes for transmission.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Staging area for encoders that write through `bytes::BufMut`.
    pub(crate) fn staging(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Bytes staged but not yet written.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.write_pos..]
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.write_pos == self.buf.len()
    }

    /// Record that `n` pending bytes were written.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.pending().len(), "advance past end of writer");
        self.write_pos += n;
        if self.is_drained() {
            self.buf.clear();
            self.write_pos = 0;
        }
    }

    /// Write pending bytes to `sink` with a single write call.
    ///
    /// A would-block result counts as `Partial` with no progress.
    pub fn flush_to<W: Write>(&mut self, sink: &mut W) -> io::Result<Flush> {
        if self.is_drained() {
            return Ok(Flush::Drained);
        }

        let n = loop {
            match sink.write(self.pending()) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Partial),
                Err(e) => return Err(e),
            }
        };

        self.advance(n);
        if self.is_drained() {
            Ok(Flush::Drained)
        } else {
            Ok(Flush::Partial)
        }
    }
}
