//! Log Sequence Numbers
//!
//! An LSN is the only notion of "happened before" recovery relies on. LSNs
//! start at 1, strictly increase, and are never reused.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Log Sequence Number - monotonically increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The first LSN ever handed out by a fresh log
    pub const FIRST: Lsn = Lsn(1);

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

/// Issues strictly increasing LSNs
///
/// The allocator itself is lock-free, but the log manager only calls
/// [`LsnAllocator::next`] while holding its append lock, at the moment the
/// record's byte position is fixed. That keeps LSN order identical to the
/// physical order of records in the file.
#[derive(Debug)]
pub struct LsnAllocator {
    next: AtomicU64,
}

impl LsnAllocator {
    /// Allocator whose first LSN is `first`
    pub fn starting_at(first: Lsn) -> Self {
        Self {
            next: AtomicU64::new(first.0.max(Lsn::FIRST.0)),
        }
    }

    /// Allocator resuming after the last LSN found in an existing log
    pub fn resume_after(last: Option<Lsn>) -> Self {
        Self::starting_at(last.map(Lsn::next).unwrap_or(Lsn::FIRST))
    }

    /// Hand out the next LSN
    pub fn next(&self) -> Lsn {
        Lsn(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// The LSN the next call to `next()` will return
    pub fn peek(&self) -> Lsn {
        Lsn(self.next.load(Ordering::SeqCst))
    }
}

impl Default for LsnAllocator {
    fn default() -> Self {
        Self::starting_at(Lsn::FIRST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_is_strictly_increasing() {
        let alloc = LsnAllocator::default();
        let a = alloc.next();
        let b = alloc.next();
        assert_eq!(a, Lsn(1));
        assert_eq!(b, Lsn(2));
        assert_eq!(alloc.peek(), Lsn(3));
    }

    #[test]
    fn test_resume_after_existing_log() {
        assert_eq!(LsnAllocator::resume_after(None).peek(), Lsn(1));
        assert_eq!(LsnAllocator::resume_after(Some(Lsn(41))).peek(), Lsn(42));
    }

    #[test]
    fn test_zero_is_never_issued() {
        let alloc = LsnAllocator::starting_at(Lsn(0));
        assert_eq!(alloc.next(), Lsn(1));
    }
}
