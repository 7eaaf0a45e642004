//! Outbound message queue
//!
//! Buffers messages submitted while disconnected or while another write is
//! in flight. Insertion order is delivery order; a message that failed to
//! write goes back to the front, so later submissions never overtake it.

use crate::error::{ChannelError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;

/// One payload waiting for (or undergoing) delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Assigned at enqueue time; stable across requeues
    pub seq: u64,
    pub payload: Bytes,
    pub enqueued_at: Instant,
}

#[derive(Debug)]
struct QueueInner {
    messages: VecDeque<Message>,
    next_seq: u64,
}

/// FIFO of sequenced messages shared by submitters and the drain path
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    capacity: Option<usize>,
}

impl OutboundQueue {
    /// Create a queue; `None` means unbounded
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                messages: VecDeque::new(),
                next_seq: 1,
            }),
            capacity,
        }
    }

    /// Append a payload and return its sequence number
    pub fn enqueue(&self, payload: Bytes) -> Result<u64> {
        let mut inner = self.inner.lock();

        if let Some(capacity) = self.capacity {
            if inner.messages.len() >= capacity {
                return Err(ChannelError::QueueFull { capacity });
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.messages.push_back(Message {
            seq,
            payload,
            enqueued_at: Instant::now(),
        });

        Ok(seq)
    }

    /// Look at the next message to deliver without removing it
    pub fn peek_front(&self) -> Option<Message> {
        self.inner.lock().messages.front().cloned()
    }

    /// Take the next message to deliver
    pub fn pop_front(&self) -> Option<Message> {
        self.inner.lock().messages.pop_front()
    }

    /// Put a message whose write failed back at the front
    ///
    /// Capacity is not checked: the message was already admitted once.
    pub fn requeue_front(&self, message: Message) {
        self.inner.lock().messages.push_front(message);
    }

    /// Pop the front message into a guard that requeues it unless completed
    pub fn pop_in_flight(&self) -> Option<InFlight<'_>> {
        self.pop_front().map(|message| InFlight {
            queue: self,
            message,
            delivered: false,
        })
    }

    /// Whether a message with this sequence number is still waiting
    pub fn contains(&self, seq: u64) -> bool {
        self.inner.lock().messages.iter().any(|m| m.seq == seq)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().messages.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Sequence numbers currently queued, front first
    pub fn sequence_numbers(&self) -> Vec<u64> {
        self.inner.lock().messages.iter().map(|m| m.seq).collect()
    }
}

/// A message taken off the queue for writing
///
/// Dropping the guard without calling [`InFlight::complete`] puts the
/// message back at the front, so a cancelled or failed write never loses it.
pub struct InFlight<'a> {
    queue: &'a OutboundQueue,
    message: Message,
    delivered: bool,
}

impl InFlight<'_> {
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The message was fully written; do not requeue
    pub fn complete(mut self) {
        self.delivered = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.delivered {
            self.queue.requeue_front(self.message.clone());
        }
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(None)
    }
}
