//! Bounded outbound queue used while not connected

use std::collections::VecDeque;
use tandem_common::events::ClientMessage;
use tracing::warn;

/// A message waiting to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub message: ClientMessage,
    /// Send attempts made so far
    pub attempts: u32,
}

/// FIFO of pending sends; the oldest entry is dropped when full
#[derive(Debug)]
pub struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
    capacity: usize,
    max_attempts: u32,
}

impl MessageQueue {
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Enqueue, returning the evicted message if the queue was full
    pub fn push(&mut self, message: ClientMessage) -> Option<QueuedMessage> {
        let evicted = if self.entries.len() >= self.capacity {
            let evicted = self.entries.pop_front();
            warn!("Message queue full ({}), dropping oldest message", self.capacity);
            evicted
        } else {
            None
        };
        self.entries.push_back(QueuedMessage {
            message,
            attempts: 0,
        });
        evicted
    }

    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.entries.pop_front()
    }

    /// Put a message back at the head after a failed send
    ///
    /// Returns false (and drops it) once it has used its attempts.
    pub fn requeue_front(&mut self, mut entry: QueuedMessage) -> bool {
        entry.attempts += 1;
        if entry.attempts >= self.max_attempts {
            warn!(
                "Dropping message after {} failed send attempt(s): {:?}",
                entry.attempts, entry.message
            );
            return false;
        }
        self.entries.push_front(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
