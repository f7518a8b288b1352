//! Client-facing log coordinates.

use std::fmt;

use bytes::Bytes;

/// A slot number in the log. Positions are dense, assigned by the
/// elected coordinator starting at 1; 0 is reserved for "no
/// position" (the boundary of an empty log).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(u64);

impl Position {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One appended payload, as returned by reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub position: Position,
    pub bytes: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_order_by_value() {
        assert!(Position::new(1) < Position::new(2));
        assert_eq!(Position::new(3).value(), 3);
        assert_eq!(Position::from(4), Position::new(4));
        assert_eq!(Position::new(9).to_string(), "9");
    }
}
