//! Generation and sequence counters.
//!
//! A `Gen` identifies one sstable; a `Seq` identifies one memtable epoch.
//! Both are strictly increasing and double as the file names on disk.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-sstable identifier. Dense: recovery restarts the counter at the
/// highest generation still referenced by the live version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gen(pub i64);

/// Per-memtable identifier. Strictly increasing across process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(pub i64);

impl std::fmt::Display for Gen {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for Seq {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates strictly increasing `Gen` values.
#[derive(Debug)]
pub struct GenIter {
    gen: AtomicI64,
}

impl GenIter {
    /// `next` will return `last + 1` first.
    pub fn new(last: Gen) -> Self {
        Self {
            gen: AtomicI64::new(last.0),
        }
    }

    pub fn next(&self) -> Gen {
        Gen(self.gen.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Generates strictly increasing `Seq` values.
///
/// The counter is seeded from the wall clock in microseconds so that
/// sequences stay unique across a crash and restart: any memtable opened by
/// the new process outranks every WAL file the old process left behind.
#[derive(Debug)]
pub struct SeqIter {
    seq: AtomicI64,
}

impl SeqIter {
    pub fn new() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros() as i64);
        Self {
            seq: AtomicI64::new(micros),
        }
    }

    pub fn next(&self) -> Seq {
        Seq(self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl Default for SeqIter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_iter_starts_after_last() {
        let iter = GenIter::new(Gen(0));
        assert_eq!(iter.next(), Gen(1));
        assert_eq!(iter.next(), Gen(2));

        let iter = GenIter::new(Gen(41));
        assert_eq!(iter.next(), Gen(42));
    }

    #[test]
    fn test_seq_iter_is_strictly_increasing() {
        let iter = SeqIter::new();
        let a = iter.next();
        let b = iter.next();
        let c = iter.next();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_seq_iter_outranks_earlier_instances() {
        // A later process must hand out sequences above anything an earlier
        // one produced, even with no state carried over.
        let earlier = SeqIter::new().next();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let later = SeqIter::new().next();
        assert!(later > earlier);
    }
}
