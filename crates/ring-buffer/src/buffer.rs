//! Ring Buffer Implementation

use std::collections::VecDeque;
use tracing::trace;

/// Default buffer capacity (~50 min of breath-by-breath messages at 20/min)
pub const DEFAULT_CAPACITY: usize = 1000;

/// Bounded FIFO that evicts its oldest entry on overflow
#[derive(Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    /// Total items pushed (for statistics)
    total_written: u64,
    /// Total items evicted by overflow
    total_evicted: u64,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer; capacity is at least one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            total_written: 0,
            total_evicted: 0,
        }
    }

    /// Create a buffer with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Append an item; returns the evicted oldest item if the buffer was full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.total_evicted += 1;
            self.items.pop_front()
        } else {
            None
        };

        self.items.push_back(item);
        self.total_written += 1;
        trace!("Ring buffer depth {}/{}", self.items.len(), self.capacity);
        evicted
    }

    /// Oldest item
    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Oldest item, mutably
    pub fn front_mut(&mut self) -> Option<&mut T> {
        self.items.front_mut()
    }

    /// Remove and return the oldest item
    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Remove every item, oldest first
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }

    /// Iterate oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get fill ratio (0.0 to 1.0)
    pub fn fill_ratio(&self) -> f64 {
        self.items.len() as f64 / self.capacity as f64
    }

    /// Total items ever pushed
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Total items lost to overflow
    pub fn total_evicted(&self) -> u64 {
        self.total_evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_and_pop_fifo() {
        let mut buffer = RingBuffer::new(10);
        for i in 0..5 {
            assert!(buffer.push(i).is_none());
        }

        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.front(), Some(&0));
        assert_eq!(buffer.pop_front(), Some(0));
        assert_eq!(buffer.pop_front(), Some(1));
    }

    #[test]
    fn test_overwrite_oldest() {
        let mut buffer = RingBuffer::new(3);
        let evicted: Vec<_> = (0..5).filter_map(|i| buffer.push(i)).collect();

        assert_eq!(evicted, vec![0, 1]);
        assert!(buffer.is_full());
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(buffer.total_evicted(), 2);
        assert_eq!(buffer.total_written(), 5);
    }

    #[test]
    fn test_fill_ratio() {
        let mut buffer = RingBuffer::new(100);
        assert_eq!(buffer.fill_ratio(), 0.0);

        for i in 0..50 {
            buffer.push(i);
        }

        assert!((buffer.fill_ratio() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut buffer = RingBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.push("a");
        assert_eq!(buffer.push("b"), Some("a"));
    }

    #[test]
    fn test_drain_empties_in_order() {
        let mut buffer = RingBuffer::new(4);
        buffer.push(1);
        buffer.push(2);
        assert_eq!(buffer.drain().collect::<Vec<_>>(), vec![1, 2]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_front_mut_updates_in_place() {
        let mut buffer = RingBuffer::new(2);
        buffer.push(1);
        buffer.push(2);
        if let Some(front) = buffer.front_mut() {
            *front += 10;
        }
        assert_eq!(buffer.pop_front(), Some(11));
    }

    proptest! {
        #[test]
        fn prop_keeps_newest_in_order(capacity in 1usize..32, count in 0usize..100) {
            let mut buffer = RingBuffer::new(capacity);
            let mut evicted = 0;
            for i in 0..count {
                if buffer.push(i).is_some() {
                    evicted += 1;
                }
            }

            let kept: Vec<usize> = buffer.iter().copied().collect();
            let expected: Vec<usize> = (count.saturating_sub(capacity)..count).collect();
            prop_assert_eq!(kept, expected);
            prop_assert_eq!(evicted, count.saturating_sub(capacity));
        }
    }
}
