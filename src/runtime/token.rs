//! Generation-checked handles for event table slots.
//!
//! The table is indexed directly by descriptor value, and the kernel reuses
//! descriptor numbers as soon as they are closed. Each slot therefore carries
//! a generation counter that is bumped on release; a token minted before the
//! release no longer matches and every lookup through it fails.

use std::fmt;
use std::os::unix::io::RawFd;

/// Handle to a registered descriptor at a specific generation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    fd: RawFd,
    generation: u32,
}

impl Token {
    pub(crate) fn new(fd: RawFd, generation: u32) -> Self {
        Self { fd, generation }
    }

    /// Descriptor this token refers to.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Slot generation at the time the token was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}#{})", self.fd, self.generation)
    }
}
