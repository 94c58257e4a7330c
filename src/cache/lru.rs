//! Reclaim order of resident pages

use std::collections::{HashMap, VecDeque};

/// Page indices in least-recently-used order
///
/// Each access pushes a stamped entry; only the entry whose stamp matches
/// the index's latest stamp counts, older ones are skipped and compacted
/// away once they outnumber the live ones.
#[derive(Debug, Default)]
pub struct PageLru {
    /// Stamped accesses, oldest at the front
    queue: VecDeque<(u64, u64)>,
    /// Latest stamp of every tracked index
    latest: HashMap<u64, u64>,
    clock: u64,
}

impl PageLru {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a use of `index`, tracking it if it was not tracked yet
    pub fn access(&mut self, index: u64) {
        self.clock += 1;
        self.latest.insert(index, self.clock);
        self.queue.push_back((index, self.clock));
        if self.queue.len() > 2 * self.latest.len() + 32 {
            let latest = &self.latest;
            self.queue
                .retain(|(index, stamp)| latest.get(index) == Some(stamp));
        }
    }

    /// Stop tracking `index`
    pub fn forget(&mut self, index: u64) {
        self.latest.remove(&index);
    }

    /// Tracked indices, coldest first
    pub fn coldest_first(&self) -> impl Iterator<Item = u64> + '_ {
        self.queue
            .iter()
            .filter(|(index, stamp)| self.latest.get(index) == Some(stamp))
            .map(|(index, _)| *index)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
