//! Interest masks recorded in the event table.
//!
//! Unlike `mio::Interest`, a mask can be empty: `Mask::NONE` marks an
//! unregistered slot.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Mask(u8);

impl Mask {
    pub const NONE: Mask = Mask(0);
    pub const READ: Mask = Mask(0b01);
    pub const WRITE: Mask = Mask(0b10);
    pub const ALL: Mask = Mask(0b11);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub const fn contains(self, other: Mask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Mask) -> bool {
        self.0 & other.0 != 0
    }

    /// Clear the bits of `other`, returning the result.
    #[must_use]
    pub const fn remove(self, other: Mask) -> Mask {
        Mask(self.0 & !other.0)
    }
}

impl BitOr for Mask {
    type Output = Mask;

    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

impl BitOrAssign for Mask {
    fn bitor_assign(&mut self, rhs: Mask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Mask {
    type Output = Mask;

    fn bitand(self, rhs: Mask) -> Mask {
        Mask(self.0 & rhs.0)
    }
}

impl fmt::Debug for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Mask::READ), self.contains(Mask::WRITE)) {
            (false, false) => f.write_str("NONE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (true, true) => f.write_str("READ | WRITE"),
        }
    }
}
