//! Lock-free hand-off between the capture callback and the framer
//!
//! The capture callback runs on a real-time audio thread and must never
//! block or allocate behind a lock. Blocks go into a bounded lock-free ring;
//! when the framer falls behind, the oldest block is displaced so the ring
//! always holds the freshest audio.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

/// Bounded ring of capture callback blocks
pub struct CaptureQueue {
    queue: ArrayQueue<Vec<f32>>,
    pushed: AtomicU64,
    displaced: AtomicU64,
}

impl CaptureQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            pushed: AtomicU64::new(0),
            displaced: AtomicU64::new(0),
        }
    }

    /// Push a block, displacing the oldest one when full
    pub fn push(&self, block: Vec<f32>) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        if self.queue.force_push(block).is_some() {
            self.displaced.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pop(&self) -> Option<Vec<f32>> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total blocks pushed since creation
    pub fn pushed_blocks(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Blocks lost to displacement since creation
    pub fn displaced_blocks(&self) -> u64 {
        self.displaced.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = CaptureQueue::new(4);
        queue.push(vec![1.0]);
        queue.push(vec![2.0]);
        queue.push(vec![3.0]);

        assert_eq!(queue.pop(), Some(vec![1.0]));
        assert_eq!(queue.pop(), Some(vec![2.0]));
        assert_eq!(queue.pop(), Some(vec![3.0]));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_displaces_oldest_when_full() {
        let queue = CaptureQueue::new(2);
        queue.push(vec![1.0]);
        queue.push(vec![2.0]);
        queue.push(vec![3.0]);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.displaced_blocks(), 1);
        assert_eq!(queue.pop(), Some(vec![2.0]));
        assert_eq!(queue.pop(), Some(vec![3.0]));
    }

    #[test]
    fn test_counters() {
        let queue = CaptureQueue::new(2);
        for i in 0..5 {
            queue.push(vec![i as f32]);
        }
        assert_eq!(queue.pushed_blocks(), 5);
        assert_eq!(queue.displaced_blocks(), 3);
    }
}
