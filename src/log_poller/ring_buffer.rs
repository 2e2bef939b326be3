use std::collections::VecDeque;

/// How many recent blocks the poller remembers for reorg detection.
///
/// The tracked window is also the deepest reorganization that can be pinned to an exact common
/// ancestor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RingBufferCapacity {
    /// Keep at most `n` blocks. `0` disables reorg detection.
    Limited(usize),
    /// Keep every block seen. Memory grows with the length of the session.
    Infinite,
}

impl From<usize> for RingBufferCapacity {
    fn from(value: usize) -> Self {
        RingBufferCapacity::Limited(value)
    }
}

/// Bounded FIFO that evicts its oldest element when full.
#[derive(Clone, Debug)]
pub(crate) struct RingBuffer<T> {
    inner: VecDeque<T>,
    capacity: RingBufferCapacity,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: RingBufferCapacity) -> Self {
        match capacity {
            RingBufferCapacity::Limited(limit) => Self { inner: VecDeque::with_capacity(limit), capacity },
            RingBufferCapacity::Infinite => Self { inner: VecDeque::new(), capacity },
        }
    }

    pub fn push(&mut self, item: T) {
        match self.capacity {
            RingBufferCapacity::Infinite => self.inner.push_back(item),
            RingBufferCapacity::Limited(0) => {}
            RingBufferCapacity::Limited(limit) => {
                if self.inner.len() == limit {
                    self.inner.pop_front();
                }
                self.inner.push_back(item);
            }
        }
    }

    pub fn back(&self) -> Option<&T> {
        self.inner.back()
    }

    pub fn back_mut(&mut self) -> Option<&mut T> {
        self.inner.back_mut()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.inner.iter()
    }

    /// Removes newest elements while `pred` holds, returning them newest first.
    pub fn pop_back_while(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        while self.inner.back().is_some_and(&mut pred) {
            if let Some(item) = self.inner.pop_back() {
                removed.push(item);
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_ignores_elements() {
        let mut buf = RingBuffer::<u32>::new(RingBufferCapacity::Limited(0));
        buf.push(1);
        assert!(buf.iter().next().is_none());
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut buf = RingBuffer::new(RingBufferCapacity::Limited(3));
        for i in 1..=5 {
            buf.push(i);
        }
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), [3, 4, 5]);
        assert_eq!(buf.back(), Some(&5));
    }

    #[test]
    fn pops_newest_while_predicate_holds() {
        let mut buf = RingBuffer::new(RingBufferCapacity::Infinite);
        for i in [10, 11, 12, 13] {
            buf.push(i);
        }
        let removed = buf.pop_back_while(|n| *n > 11);
        assert_eq!(removed, [13, 12]);
        assert_eq!(buf.back(), Some(&11));

        buf.clear();
        assert!(buf.pop_back_while(|_| true).is_empty());
    }
}
