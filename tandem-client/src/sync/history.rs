//! Bounded record of drift measurements

use std::collections::VecDeque;

/// One `synchronize()` measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncEntry {
    /// Local time of the measurement (epoch milliseconds)
    pub timestamp: f64,
    /// Expected position (seconds)
    pub expected: f64,
    /// Audio engine position (seconds)
    pub actual: f64,
    /// `|expected - actual|` (seconds)
    pub diff: f64,
    /// Tolerance in force when measured (seconds)
    pub tolerance: f64,
    /// The pass could not read or correct the engine. A failed read leaves
    /// `actual` and `diff` as NaN.
    pub failed: bool,
}

impl SyncEntry {
    /// Failed passes always count as out of tolerance
    pub fn out_of_tolerance(&self) -> bool {
        self.failed || self.diff > self.tolerance
    }
}

/// Ring buffer of sync entries, oldest evicted first
#[derive(Debug, Clone)]
pub struct SyncHistory {
    entries: VecDeque<SyncEntry>,
    capacity: usize,
}

impl SyncHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: SyncEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn latest(&self) -> Option<&SyncEntry> {
        self.entries.back()
    }

    /// Most recent `n` entries, oldest first
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &SyncEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip)
    }

    /// Mean drift of the most recent `n` entries that have a measurement
    pub fn average_drift(&self, n: usize) -> Option<f64> {
        let (sum, count) = self
            .recent(n)
            .filter(|e| e.diff.is_finite())
            .fold((0.0, 0usize), |(sum, count), e| (sum + e.diff, count + 1));
        (count > 0).then(|| sum / count as f64)
    }

    /// Whether at least `threshold` of the last `window` entries were out of tolerance
    pub fn sustained_poor_performance(&self, window: usize, threshold: usize) -> bool {
        threshold > 0
            && self
                .recent(window)
                .filter(|e| e.out_of_tolerance())
                .count()
                >= threshold
    }
}
