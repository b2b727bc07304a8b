//! Fixed-length history of quantized audio levels.
//!
//! Uses `ringbuf::HeapRb<u8>` in overwrite mode: the buffer is pre-filled
//! with silence so it is always full, and every push evicts the oldest level.

use ringbuf::{
    traits::{Consumer, RingBuffer},
    HeapRb,
};

/// Ring of the most recent levels of one participant.
///
/// Index 0 of [`LevelHistory::newest_first`] is the latest level.
pub struct LevelHistory {
    rb: HeapRb<u8>,
    len: usize,
}

impl LevelHistory {
    /// Create a history of `len` levels, all silent.
    ///
    /// # Panics
    /// Panics if `len` is zero.
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "level history must hold at least one level");
        let mut rb = HeapRb::<u8>::new(len);
        for _ in 0..len {
            rb.push_overwrite(0);
        }
        Self { rb, len }
    }

    /// Number of levels retained. Constant for the lifetime of the history.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Push the newest level, evicting the oldest.
    pub fn push(&mut self, level: u8) {
        self.rb.push_overwrite(level);
    }

    /// The most recently pushed level.
    pub fn latest(&self) -> u8 {
        self.newest_first().next().unwrap_or(0)
    }

    /// Iterate from the newest level to the oldest.
    pub fn newest_first(&self) -> impl Iterator<Item = u8> + '_ {
        // `as_slices` yields oldest → newest as (head, tail).
        let (head, tail) = self.rb.as_slices();
        tail.iter().rev().chain(head.iter().rev()).copied()
    }

    /// Copy of the history, newest first.
    pub fn to_vec(&self) -> Vec<u8> {
        self.newest_first().collect()
    }
}

impl std::fmt::Debug for LevelHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelHistory")
            .field("levels", &self.to_vec())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_silent_and_full() {
        let history = LevelHistory::new(8);
        assert_eq!(history.len(), 8);
        assert_eq!(history.to_vec(), vec![0; 8]);
        assert_eq!(history.latest(), 0);
    }

    #[test]
    fn newest_level_is_first() {
        let mut history = LevelHistory::new(4);
        history.push(1);
        history.push(2);
        history.push(3);
        assert_eq!(history.to_vec(), vec![3, 2, 1, 0]);
        assert_eq!(history.latest(), 3);
    }

    #[test]
    fn push_evicts_oldest_and_keeps_length() {
        let mut history = LevelHistory::new(3);
        for level in 1..=10u8 {
            history.push(level);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.to_vec(), vec![10, 9, 8]);
    }
}
