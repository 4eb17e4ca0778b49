//! Outbound frame queue.
//!
//! One FIFO per connection. Frames submitted before the connection exists
//! wait here and are flushed in submission order once it is established.
//! A frame whose write fails goes back to the front, so ordering survives
//! reconnects.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::error::{PeerError, PeerResult};

/// What a full queue does with a new frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new frame with [`PeerError::QueueFull`].
    #[default]
    Reject,
    /// Evict the oldest queued frame to make room.
    DropOldest,
    /// Never refuse; `max_queue_size` is ignored.
    Unbounded,
}

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The frame was appended.
    Accepted,
    /// The frame was appended after evicting the oldest one.
    DroppedOldest,
}

/// Bounded FIFO of encoded frames.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<Vec<u8>>,
    max_size: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    /// Create an empty queue.
    pub fn new(max_size: usize, policy: OverflowPolicy) -> Self {
        Self {
            frames: VecDeque::new(),
            max_size,
            policy,
        }
    }

    /// Append a frame, applying the overflow policy when full.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::QueueFull`] under [`OverflowPolicy::Reject`].
    pub fn push(&mut self, frame: Vec<u8>) -> PeerResult<Enqueued> {
        if self.policy == OverflowPolicy::Unbounded || self.frames.len() < self.max_size {
            self.frames.push_back(frame);
            return Ok(Enqueued::Accepted);
        }
        match self.policy {
            OverflowPolicy::Reject => Err(PeerError::QueueFull {
                capacity: self.max_size,
            }),
            _ => {
                self.frames.pop_front();
                self.frames.push_back(frame);
                Ok(Enqueued::DroppedOldest)
            }
        }
    }

    /// Put back a frame whose write failed. Ignores the bound: the frame
    /// was already accepted once.
    pub fn requeue_front(&mut self, frame: Vec<u8>) {
        self.frames.push_front(frame);
    }

    /// Take the next frame to write.
    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        self.frames.pop_front()
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drop every queued frame, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.frames.len();
        self.frames.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Vec<u8> {
        vec![tag]
    }

    #[test]
    fn test_fifo_with_requeue_front() {
        let mut queue = OutboundQueue::new(10, OverflowPolicy::Reject);
        for tag in 1..=3 {
            queue.push(frame(tag)).expect("push");
        }
        let first = queue.pop_front().expect("first");
        queue.requeue_front(first);
        let drained: Vec<Vec<u8>> = std::iter::from_fn(|| queue.pop_front()).collect();
        assert_eq!(drained, vec![frame(1), frame(2), frame(3)]);
    }

    #[test]
    fn test_reject_when_full() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::Reject);
        queue.push(frame(1)).expect("push");
        queue.push(frame(2)).expect("push");
        assert_eq!(queue.push(frame(3)), Err(PeerError::QueueFull { capacity: 2 }));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(frame(1)).expect("push");
        queue.push(frame(2)).expect("push");
        assert_eq!(queue.push(frame(3)), Ok(Enqueued::DroppedOldest));
        assert_eq!(queue.pop_front(), Some(frame(2)));
        assert_eq!(queue.pop_front(), Some(frame(3)));
    }

    #[test]
    fn test_unbounded_ignores_limit() {
        let mut queue = OutboundQueue::new(1, OverflowPolicy::Unbounded);
        for tag in 0..5 {
            assert_eq!(queue.push(frame(tag)), Ok(Enqueued::Accepted));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_ignores_bound() {
        let mut queue = OutboundQueue::new(1, OverflowPolicy::Reject);
        queue.push(frame(2)).expect("push");
        queue.requeue_front(frame(1));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front(), Some(frame(1)));
    }
}
