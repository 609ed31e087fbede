//! Length-prefixed binary request/response protocol.
//!
//! - `frame`: header layout and field-by-field encoding
//! - `command`: the tag-indexed command table
//! - `codec`: incremental decode + dispatch over a connection's reader
//! - `client`: blocking request helper

pub mod client;
pub mod codec;
pub mod command;
pub mod frame;

pub use client::{Client, Response};
pub use codec::{Analysis, Codec, ProtocolError, DEFAULT_MAX_FRAME_SIZE};
pub use command::{Command, CommandKind, CommandTable};
pub use frame::{pack_request, unpack_response, ReplyCode, HEADER_SIZE};
