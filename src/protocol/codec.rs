//! Incremental request decoding and dispatch.
//!
//! The codec keeps no state of its own: everything it needs is in the
//! connection's reader. Each call consumes every complete frame currently
//! buffered, runs the matching command, and leaves any trailing partial
//! frame for the next read event.

use crate::protocol::command::CommandTable;
use crate::protocol::frame::{checksum, RequestHeader, HEADER_SIZE};
use crate::runtime::{Connection, Reader, Writer};
use thiserror::Error;
use tracing::trace;

/// Largest body accepted by default.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Stream-fatal request problems. The connection must be closed: once a
/// header is rejected its size field cannot be trusted to find the next
/// frame.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("checksum mismatch for type {kind} size {size}: got {found}, expected {expected}")]
    Checksum {
        kind: u16,
        size: u32,
        found: u32,
        expected: u32,
    },

    #[error("unknown command type {0}")]
    UnknownCommand(u16),

    #[error("frame body of {size} bytes exceeds limit {max}")]
    FrameTooLarge { size: u32, max: u32 },
}

/// What the caller should do after a successful analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Analysis {
    /// At least one processed command staged a reply.
    NeedReply,
    /// Nothing to send; wait for more input.
    Continue,
}

#[derive(Debug, Clone, Copy)]
pub struct Codec {
    commands: CommandTable,
    max_frame_size: u32,
}

impl Codec {
    pub fn new(commands: CommandTable, max_frame_size: u32) -> Self {
        Self {
            commands,
            max_frame_size,
        }
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Process the connection's buffered input.
    pub fn analyze(&self, conn: &mut Connection) -> crate::Result<Analysis> {
        Ok(self.process(&mut conn.reader, &mut conn.writer)?)
    }

    /// Decode and execute every complete frame in `reader`.
    pub fn process(
        &self,
        reader: &mut Reader,
        writer: &mut Writer,
    ) -> Result<Analysis, ProtocolError> {
        let mut analysis = Analysis::Continue;

        loop {
            let Some(header) = RequestHeader::decode(reader.unread()) else {
                break;
            };

            if !header.is_valid() {
                return Err(ProtocolError::Checksum {
                    kind: header.kind,
                    size: header.size,
                    found: header.validate,
                    expected: checksum(header.kind, header.size),
                });
            }

            if header.size > self.max_frame_size {
                return Err(ProtocolError::FrameTooLarge {
                    size: header.size,
                    max: self.max_frame_size,
                });
            }

            let frame_len = HEADER_SIZE + header.size as usize;
            if reader.remaining() < frame_len {
                break;
            }

            let command = self
                .commands
                .lookup(header.kind)
                .ok_or(ProtocolError::UnknownCommand(header.kind))?;

            trace!(command = command.name, size = header.size, "dispatch");
            command.execute(&reader.unread()[HEADER_SIZE..frame_len], writer);
            reader.consume(frame_len);

            if command.needs_reply {
                analysis = Analysis::NeedReply;
            }
        }

        Ok(analysis)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CommandTable::standard(), DEFAULT_MAX_FRAME_SIZE)
    }
}
