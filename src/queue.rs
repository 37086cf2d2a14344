//! FIFO hand-off of messages from the batcher to the submitter.
//!
//! Pushing never blocks the producer. The queue is unbounded unless a capacity
//! is configured; at capacity the oldest pending message is dropped to make
//! room for the newest.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use crate::message::Message;

struct Shared {
    pending: Mutex<VecDeque<Message>>,
    notify: Notify,
    capacity: Option<usize>,
    dropped: AtomicU64,
}

/// Cloneable handle to a message queue.
#[derive(Clone)]
pub struct OutboundQueue {
    shared: Arc<Shared>,
}

impl OutboundQueue {
    /// Create an unbounded queue.
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Create a queue that keeps at most `capacity` pending messages when
    /// `Some`. A capacity of zero is treated as one.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity: capacity.map(|c| c.max(1)),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue a message. Returns the message evicted to make room, if any.
    pub fn push(&self, message: Message) -> Option<Message> {
        let evicted = {
            let mut pending = self.lock();
            let evicted = match self.shared.capacity {
                Some(capacity) if pending.len() >= capacity => pending.pop_front(),
                _ => None,
            };
            pending.push_back(message);
            evicted
        };

        if let Some(old) = &evicted {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_id = %old.id,
                records = old.len(),
                capacity = self.shared.capacity.unwrap_or_default(),
                "Outbound queue full: dropping oldest message"
            );
        }

        self.shared.notify.notify_one();
        evicted
    }

    /// Dequeue the oldest message without waiting.
    pub fn try_pop(&self) -> Option<Message> {
        self.lock().pop_front()
    }

    /// Wait for the next message.
    pub async fn pop(&self) -> Message {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(message) = self.try_pop() {
                return message;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Messages evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}
