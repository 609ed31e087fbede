//! Wire format.
//!
//! ```text
//! Request:  type:u16 | size:u32 | validate:u32 | body[size]
//! Response: code:u16 | size:u32 | validate:u32 | body[size]
//! ```
//!
//! All integers are in host byte order; both ends are assumed to share it.
//! For requests `validate = type * 2 + size`, for responses
//! `validate = size`.

use crate::runtime::Writer;
use bytes::{Buf, BufMut};

/// Header length shared by requests and responses.
pub const HEADER_SIZE: usize = 2 + 4 + 4;

/// Request integrity value for a header.
pub fn checksum(kind: u16, size: u32) -> u32 {
    u32::from(kind).wrapping_mul(2).wrapping_add(size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub kind: u16,
    pub size: u32,
    pub validate: u32,
}

impl RequestHeader {
    /// Header for a request of `kind` carrying `size` body bytes.
    pub fn new(kind: u16, size: u32) -> Self {
        Self {
            kind,
            size,
            validate: checksum(kind, size),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate == checksum(self.kind, self.size)
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u16_ne(self.kind);
        out.put_u32_ne(self.size);
        out.put_u32_ne(self.validate);
    }

    /// Decode from the front of `buf`; `None` if fewer than
    /// `HEADER_SIZE` bytes are available.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            kind: buf.get_u16_ne(),
            size: buf.get_u32_ne(),
            validate: buf.get_u32_ne(),
        })
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReplyCode {
    Success = 0,
    Failure = 1,
}

impl ReplyCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(ReplyCode::Success),
            1 => Some(ReplyCode::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub code: u16,
    pub size: u32,
    pub validate: u32,
}

impl ResponseHeader {
    pub fn new(code: ReplyCode, size: u32) -> Self {
        Self {
            code: code as u16,
            size,
            validate: size,
        }
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u16_ne(self.code);
        out.put_u32_ne(self.size);
        out.put_u32_ne(self.validate);
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            code: buf.get_u16_ne(),
            size: buf.get_u32_ne(),
            validate: buf.get_u32_ne(),
        })
    }
}

/// Encode a complete request frame.
pub fn pack_request(kind: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    RequestHeader::new(kind, body.len() as u32).encode(&mut out);
    out.put_slice(body);
    out
}

/// Split a complete response frame into header and body.
///
/// Returns `None` until `buf` holds the whole frame.
pub fn unpack_response(buf: &[u8]) -> Option<(ResponseHeader, &[u8])> {
    let header = ResponseHeader::decode(buf)?;
    let end = HEADER_SIZE.checked_add(header.size as usize)?;
    let body = buf.get(HEADER_SIZE..end)?;
    Some((header, body))
}

/// Append a reply frame to a connection's writer.
pub fn stage_reply(writer: &mut Writer, code: ReplyCode, body: &[u8]) {
    let out = writer.staging();
    out.reserve(HEADER_SIZE + body.len());
    ResponseHeader::new(code, body.len() as u32).encode(out);
    out.put_slice(body);
}
