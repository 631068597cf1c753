//! In-memory dead-letter queue.

use eventfold_core::dead_letter::{DeadLetterQueue, DeadLetteredMessage};
use std::sync::{Mutex, PoisonError};

/// In-memory [`DeadLetterQueue`].
///
/// Entries are held in arrival order. [`DeadLetterQueue::dequeue_all`]
/// returns a snapshot copy, so callers can sift through failures without
/// affecting the queue.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterQueue {
    messages: Mutex<Vec<DeadLetteredMessage>>,
}

impl InMemoryDeadLetterQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<DeadLetteredMessage>> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeadLetterQueue for InMemoryDeadLetterQueue {
    fn enqueue(&self, dead_lettered: DeadLetteredMessage) {
        tracing::warn!(
            message_id = dead_lettered.message_id(),
            message_type = dead_lettered.message.message_type(),
            reason = %dead_lettered.reason,
            failure_count = dead_lettered.failure_count,
            "message dead-lettered"
        );
        self.entries().push(dead_lettered);
    }

    fn dequeue_all(&self) -> Vec<DeadLetteredMessage> {
        self.entries().clone()
    }

    fn clear(&self) {
        self.entries().clear();
    }

    fn count(&self) -> usize {
        self.entries().len()
    }

    fn get_by_message_id(&self, message_id: &str) -> Option<DeadLetteredMessage> {
        self.entries()
            .iter()
            .find(|entry| entry.message_id() == message_id)
            .cloned()
    }

    fn get_by_reason(&self, reason: &str) -> Vec<DeadLetteredMessage> {
        self.entries()
            .iter()
            .filter(|entry| entry.reason == reason)
            .cloned()
            .collect()
    }
}
