//! Bounded recent history of finalized minutes.

use std::collections::VecDeque;

use super::MinuteSnapshot;

/// Fixed-capacity ring of the most recent snapshots for one engine.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    capacity: usize,
    entries: VecDeque<MinuteSnapshot>,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a snapshot, evicting the oldest once full.
    pub fn push(&mut self, snapshot: MinuteSnapshot) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
    }

    /// The most recent `n` snapshots, oldest first. Shorter when history is short.
    pub fn last(&self, n: usize) -> Vec<&MinuteSnapshot> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).collect()
    }

    pub fn latest(&self) -> Option<&MinuteSnapshot> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
