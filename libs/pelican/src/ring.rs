//! Fixed-capacity circular buffer
//!
//! Insertion never fails: when the buffer is full the oldest element is
//! overwritten. Capacity is fixed at construction; a zero-capacity buffer
//! discards everything and is always empty.

/// Ring of `Copy` records with overwrite-oldest insertion
#[derive(Debug, Clone)]
pub struct CircularBuffer<T> {
    slots: Box<[T]>,
    start: usize,
    count: usize,
}

impl<T: Copy + Default> CircularBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![T::default(); capacity].into_boxed_slice(),
            start: 0,
            count: 0,
        }
    }

    /// Append `item`; returns `true` if the oldest element was evicted
    pub fn add(&mut self, item: T) -> bool {
        let capacity = self.capacity();
        if capacity == 0 {
            return false;
        }
        if self.count < capacity {
            self.slots[(self.start + self.count) % capacity] = item;
            self.count += 1;
            false
        } else {
            self.slots[self.start] = item;
            self.start = (self.start + 1) % capacity;
            true
        }
    }

    pub fn pop_first(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let item = self.slots[self.start];
        self.start = (self.start + 1) % self.capacity();
        self.count -= 1;
        Some(item)
    }

    /// Peek at the oldest element without removing it
    pub fn read_first(&self) -> Option<T> {
        (self.count > 0).then(|| self.slots[self.start])
    }

    /// Pop until empty; returns the number of elements removed
    pub fn drain_all(&mut self) -> usize {
        let drained = self.count;
        self.count = 0;
        self.start = 0;
        drained
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    /// Iterate oldest to newest without consuming
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        let capacity = self.capacity();
        (0..self.count).map(move |i| self.slots[(self.start + i) % capacity])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buffer: &mut CircularBuffer<u32>) -> Vec<u32> {
        std::iter::from_fn(|| buffer.pop_first()).collect()
    }

    #[test]
    fn test_fifo_without_eviction() {
        let mut buffer = CircularBuffer::new(4);
        for x in 1..=4 {
            assert!(!buffer.add(x));
        }
        assert!(buffer.is_full());
        assert_eq!(drain(&mut buffer), vec![1, 2, 3, 4]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.pop_first(), None);
    }

    #[test]
    fn test_overwrites_oldest_when_full() {
        let mut buffer = CircularBuffer::new(3);
        buffer.add(1);
        buffer.add(2);
        buffer.add(3);
        assert!(buffer.add(4));
        assert_eq!(buffer.iter().collect::<Vec<_>>(), vec![2, 3, 4]);

        assert_eq!(buffer.pop_first(), Some(2));
        assert_eq!(buffer.iter().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(buffer.count(), 2);
    }

    #[test]
    fn test_eviction_keeps_last_n() {
        let capacity = 5;
        let mut buffer = CircularBuffer::new(capacity);
        for x in 0..=capacity as u32 {
            buffer.add(x);
        }
        assert_eq!(drain(&mut buffer), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_count_stays_within_capacity() {
        let mut buffer = CircularBuffer::new(3);
        // Interleave adds and pops so start wraps several times
        for round in 0..20u32 {
            buffer.add(round);
            if round % 3 == 0 {
                buffer.pop_first();
            }
            assert!(buffer.count() <= buffer.capacity());
        }
        let remaining = drain(&mut buffer);
        assert!(remaining.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(remaining.last(), Some(&19));
    }

    #[test]
    fn test_read_first_does_not_remove() {
        let mut buffer = CircularBuffer::new(2);
        assert_eq!(buffer.read_first(), None);
        buffer.add(7);
        buffer.add(8);
        assert_eq!(buffer.read_first(), Some(7));
        assert_eq!(buffer.read_first(), Some(7));
        assert_eq!(buffer.count(), 2);
    }

    #[test]
    fn test_drain_all_returns_count() {
        let mut buffer = CircularBuffer::new(8);
        for x in 0..5 {
            buffer.add(x);
        }
        assert_eq!(buffer.drain_all(), 5);
        assert_eq!(buffer.drain_all(), 0);
        assert!(buffer.is_empty());
        buffer.add(42);
        assert_eq!(buffer.pop_first(), Some(42));
    }

    #[test]
    fn test_zero_capacity_discards() {
        let mut buffer: CircularBuffer<u32> = CircularBuffer::new(0);
        assert!(!buffer.add(1));
        assert_eq!(buffer.count(), 0);
        assert_eq!(buffer.pop_first(), None);
        assert_eq!(buffer.read_first(), None);
        assert_eq!(buffer.drain_all(), 0);
    }
}
