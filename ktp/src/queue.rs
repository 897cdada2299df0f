//! Fixed-capacity FIFO used for the per-connection outbound and inbound
//! message queues.
//!
//! Backed by a ring buffer: push and pop are O(1) and the capacity given at
//! construction is never exceeded.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `item`, or hand it back when the queue is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Remove and return the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots left before the queue is full.
    pub fn headroom(&self) -> usize {
        self.capacity - self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = BoundedQueue::new(3);
        for i in 0..3 {
            q.push(i).unwrap();
        }
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn push_on_full_queue_returns_item_unchanged() {
        let mut q = BoundedQueue::new(2);
        q.push("a").unwrap();
        q.push("b").unwrap();
        assert!(q.is_full());
        assert_eq!(q.push("c"), Err("c"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.front(), Some(&"a"));
    }

    #[test]
    fn headroom_tracks_occupancy_across_wrap() {
        let mut q = BoundedQueue::new(4);
        for round in 0..10 {
            q.push(round).unwrap();
            q.push(round).unwrap();
            assert_eq!(q.headroom(), 2);
            q.pop();
            q.pop();
            assert_eq!(q.headroom(), 4);
        }
        assert!(q.is_empty());
        assert_eq!(q.capacity(), 4);
    }
}
