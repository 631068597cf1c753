//! Dead-letter queue contract: an append-only sink for messages that could
//! not be processed.
//!
//! When a handler keeps failing past its retry budget, the message is routed
//! here with the reason and failure count, held for inspection, debugging,
//! or manual replay. The same message may appear more than once under
//! different reasons.
//!
//! The in-memory implementation lives in `eventfold-memory`; persistent
//! sinks implement the same trait.

use crate::message::Message;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A message that failed processing, with failure metadata.
#[derive(Clone, Debug)]
pub struct DeadLetteredMessage {
    /// The original message.
    pub message: Arc<dyn Message>,
    /// Why it was dead-lettered.
    pub reason: String,
    /// How many times handling failed before giving up.
    pub failure_count: u32,
    /// When it was dead-lettered.
    pub timestamp: DateTime<Utc>,
}

impl DeadLetteredMessage {
    /// Dead-letter a message now.
    #[must_use]
    pub fn new(message: Arc<dyn Message>, reason: impl Into<String>, failure_count: u32) -> Self {
        Self {
            message,
            reason: reason.into(),
            failure_count,
            timestamp: Utc::now(),
        }
    }

    /// Id of the original message.
    #[must_use]
    pub fn message_id(&self) -> &str {
        self.message.id()
    }
}

/// Append-only sink for failed messages.
pub trait DeadLetterQueue: Send + Sync {
    /// Append a dead-lettered message.
    fn enqueue(&self, dead_lettered: DeadLetteredMessage);

    /// All dead-lettered messages, as a snapshot copy; mutating the result
    /// does not affect the queue.
    fn dequeue_all(&self) -> Vec<DeadLetteredMessage>;

    /// Remove everything.
    fn clear(&self);

    /// Number of dead-lettered messages.
    fn count(&self) -> usize;

    /// The first dead-lettered entry for an original message id.
    fn get_by_message_id(&self, message_id: &str) -> Option<DeadLetteredMessage>;

    /// All entries dead-lettered for the given reason.
    fn get_by_reason(&self, reason: &str) -> Vec<DeadLetteredMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EventEnvelope;

    #[test]
    fn dead_lettered_message_exposes_original_id() {
        let event = EventEnvelope::new("PaymentFailed", serde_json::json!({}));
        let id = event.metadata.id.clone();
        let dead = DeadLetteredMessage::new(Arc::new(event), "handler exhausted retries", 3);

        assert_eq!(dead.message_id(), id);
        assert_eq!(dead.failure_count, 3);
        assert_eq!(dead.reason, "handler exhausted retries");
    }
}
