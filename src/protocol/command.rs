//! Command table.
//!
//! Commands are indexed by their wire tag. The table is built once and never
//! mutated; lookup goes through `slice::get`, so a tag equal to or beyond
//! the table length is rejected.

use crate::protocol::frame::{stage_reply, ReplyCode};
use crate::runtime::Writer;

pub const ECHO: u16 = 0;
pub const TIME: u16 = 1;
/// Reserved for keepalives. Declared but not served.
pub const HEARTBEAT: u16 = 2;

/// Fixed body of every `time` reply.
pub const TIME_REPLY: &[u8] = b"13.14";

/// What a command does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Reply with the request body.
    Echo,
    /// Reply with [`TIME_REPLY`], ignoring the body.
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub name: &'static str,
    pub tag: u16,
    pub kind: CommandKind,
    pub needs_reply: bool,
}

impl Command {
    /// Run against a request body, staging any reply into `writer`.
    pub fn execute(&self, body: &[u8], writer: &mut Writer) {
        match self.kind {
            CommandKind::Echo => stage_reply(writer, ReplyCode::Success, body),
            CommandKind::Time => stage_reply(writer, ReplyCode::Success, TIME_REPLY),
        }
    }
}

const STANDARD: [Command; 2] = [
    Command {
        name: "echo",
        tag: ECHO,
        kind: CommandKind::Echo,
        needs_reply: true,
    },
    Command {
        name: "time",
        tag: TIME,
        kind: CommandKind::Time,
        needs_reply: true,
    },
];

/// Read-only registry of served commands.
#[derive(Debug, Clone, Copy)]
pub struct CommandTable {
    commands: &'static [Command],
}

impl CommandTable {
    /// The commands this server answers.
    pub fn standard() -> Self {
        Self {
            commands: &STANDARD,
        }
    }

    pub fn lookup(&self, tag: u16) -> Option<&Command> {
        self.commands.get(usize::from(tag))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::standard()
    }
}
