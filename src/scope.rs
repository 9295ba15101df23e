//! Closed key intervals.

use std::fmt::Display;

/// The `[min, max]` key interval covered by an sstable. Both bounds are
/// inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    min: String,
    max: String,
}

impl Scope {
    pub fn new(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    pub fn min(&self) -> &str {
        &self.min
    }

    pub fn max(&self) -> &str {
        &self.max
    }

    pub fn contains(&self, key: &str) -> bool {
        self.min.as_str() <= key && key <= self.max.as_str()
    }

    pub fn overlaps(&self, other: &Scope) -> bool {
        !(self.max < other.min || self.min > other.max)
    }

    /// The smallest scope covering every scope in `scopes`, or `None` if the
    /// iterator is empty.
    pub fn fusion<'a>(scopes: impl IntoIterator<Item = &'a Scope>) -> Option<Scope> {
        let mut iter = scopes.into_iter();
        let first = iter.next()?;
        let mut fused = first.clone();
        for scope in iter {
            if scope.min < fused.min {
                fused.min = scope.min.clone();
            }
            if scope.max > fused.max {
                fused.max = scope.max.clone();
            }
        }
        Some(fused)
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{:?}, {:?}]", self.min, self.max)
    }
}
