use thiserror::Error;
use uuid::Uuid;

use crate::types::Message;

/// Errors that can occur while applying timeline operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineMergeError {
    /// An operation referenced a message that is not in the timeline.
    #[error("message '{0}' was not found")]
    MissingMessage(Uuid),
}

/// Change applied to a thread's message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineOp {
    /// New or redelivered messages; merged by id, newest copy wins.
    Merge(Vec<Message>),
    /// Older page loaded by pagination.
    PrependOlder(Vec<Message>),
    /// Read/seen receipt for one message.
    PatchStatus {
        message_id: Uuid,
        seen_at_ms: Option<u64>,
        read_at_ms: Option<u64>,
    },
    /// Drop one message (used for local placeholders).
    Remove { message_id: Uuid },
}

/// Time-ordered, id-unique message list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    messages: Vec<Message>,
}

impl Timeline {
    pub fn new(messages: Vec<Message>) -> Self {
        let mut timeline = Self::default();
        timeline.merge(messages);
        timeline
    }

    /// Messages ordered by creation time.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn contains(&self, message_id: Uuid) -> bool {
        self.messages.iter().any(|message| message.id == message_id)
    }

    /// Apply operations in order.
    pub fn apply_ops(&mut self, ops: &[TimelineOp]) -> Result<(), TimelineMergeError> {
        for op in ops {
            match op {
                TimelineOp::Merge(incoming) | TimelineOp::PrependOlder(incoming) => {
                    self.merge(incoming.iter().cloned())
                }
                TimelineOp::PatchStatus {
                    message_id,
                    seen_at_ms,
                    read_at_ms,
                } => {
                    let message = self
                        .messages
                        .iter_mut()
                        .find(|message| message.id == *message_id)
                        .ok_or(TimelineMergeError::MissingMessage(*message_id))?;
                    if seen_at_ms.is_some() {
                        message.seen_at_ms = *seen_at_ms;
                    }
                    if read_at_ms.is_some() {
                        message.read_at_ms = *read_at_ms;
                    }
                }
                TimelineOp::Remove { message_id } => {
                    let idx = self
                        .messages
                        .iter()
                        .position(|message| message.id == *message_id)
                        .ok_or(TimelineMergeError::MissingMessage(*message_id))?;
                    self.messages.remove(idx);
                }
            }
        }
        Ok(())
    }

    fn merge(&mut self, incoming: impl IntoIterator<Item = Message>) {
        for message in incoming {
            match self
                .messages
                .iter_mut()
                .find(|existing| existing.id == message.id)
            {
                Some(existing) => *existing = message,
                None => self.messages.push(message),
            }
        }
        // Stable, so equal timestamps keep arrival order.
        self.messages.sort_by_key(|message| message.created_at_ms);
    }
}
