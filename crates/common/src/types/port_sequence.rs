use crate::{Error, Result};

/// A sequential allocator of per-node integers such as ports. When instantiated, it hands out
/// consecutive values starting at `start` until the highest value is reached.
///
/// The allocator is stateful; constructing a new instance restarts the sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence {
    /// The next value to be returned by the allocator when requested, `None` once the whole
    /// `u64` range has been handed out.
    next: Option<u64>,

    /// The highest value (inclusive) that can be returned by this allocator.
    highest_inclusive: u64,
}

impl Sequence {
    /// Creates an unbounded sequence starting at `start`.
    pub fn new(start: u64) -> Self {
        Self {
            next: Some(start),
            highest_inclusive: u64::MAX,
        }
    }

    /// Creates a sequence of TCP ports starting at `start`.
    pub fn ports(start: u16) -> Self {
        Self {
            next: Some(start as u64),
            highest_inclusive: u16::MAX as u64,
        }
    }

    /// Returns the value the next call to [`Sequence::allocate`] would return.
    pub fn peek(&self) -> Option<u64> {
        self.next.filter(|next| *next <= self.highest_inclusive)
    }

    /// Allocates the next value and errors out if the sequence has been exhausted.
    pub fn allocate(&mut self) -> Result<u64> {
        let Some(value) = self.peek() else {
            return Err(Error::configuration(format!(
                "sequence exhausted, no value left after {}",
                self.highest_inclusive
            )));
        };
        self.next = value.checked_add(1);
        Ok(value)
    }
}

impl Iterator for Sequence {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        self.allocate().ok()
    }
}
