//! Per-tick boolean cache keyed by entity index
//!
//! ```text
//! known: ┌─┬─┬─┬─┬─┬─┐   bit i set: a result for entity i exists
//!        └─┴─┴─┴─┴─┴─┘
//! value: ┌─┬─┬─┬─┬─┬─┐   bit i: the result itself
//!        └─┴─┴─┴─┴─┴─┘
//! ```
//!
//! Results belong to the epoch they were stored in. The first access with a
//! different epoch drops everything.

use sourcebind_sdk::EntityIndex;

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Debug, Clone)]
pub struct EpochCache<E = u64> {
    known: Vec<u64>,
    value: Vec<u64>,
    capacity: usize,
    epoch: Option<E>,
}

impl<E: Copy + PartialEq> EpochCache<E> {
    /// Cache for indices `0..capacity`
    pub fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(WORD_BITS);
        Self {
            known: vec![0; words],
            value: vec![0; words],
            capacity,
            epoch: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Epoch the stored results belong to
    pub fn epoch(&self) -> Option<E> {
        self.epoch
    }

    fn slot(&self, index: EntityIndex) -> Option<(usize, u64)> {
        let index = index as usize;
        (index < self.capacity).then(|| (index / WORD_BITS, 1u64 << (index % WORD_BITS)))
    }

    fn roll(&mut self, epoch: E) {
        if self.epoch != Some(epoch) {
            self.clear();
            self.epoch = Some(epoch);
        }
    }

    /// Stored result for `index` in `epoch`
    pub fn get(&mut self, index: EntityIndex, epoch: E) -> Option<bool> {
        self.roll(epoch);
        let (word, bit) = self.slot(index)?;
        (self.known[word] & bit != 0).then(|| self.value[word] & bit != 0)
    }

    /// Store a result; indices past the capacity are not cached
    pub fn set(&mut self, index: EntityIndex, value: bool, epoch: E) {
        self.roll(epoch);
        let Some((word, bit)) = self.slot(index) else {
            return;
        };
        self.known[word] |= bit;
        if value {
            self.value[word] |= bit;
        } else {
            self.value[word] &= !bit;
        }
    }

    /// Forget the result for one index
    pub fn invalidate(&mut self, index: EntityIndex) {
        if let Some((word, bit)) = self.slot(index) {
            self.known[word] &= !bit;
            self.value[word] &= !bit;
        }
    }

    pub fn clear(&mut self) {
        self.known.fill(0);
        self.value.fill(0);
    }

    /// Number of stored results
    pub fn len(&self) -> usize {
        self.known.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.known.iter().all(|w| *w == 0)
    }
}
