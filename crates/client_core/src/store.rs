use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, DeliveryState, MessageId, UserId},
    protocol::{MessageBody, MessageRecord},
};

/// A message as held for display: confirmed history, live arrivals, and
/// locally-originated sends that are still pending or have failed.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub sent_at: DateTime<Utc>,
    pub delivery: DeliveryState,
}

impl StoredMessage {
    fn confirmed(record: MessageRecord) -> Self {
        Self {
            message_id: record.message_id,
            sender_id: record.sender_id,
            body: record.body,
            sent_at: record.sent_at,
            delivery: DeliveryState::Confirmed,
        }
    }
}

/// Ordered, deduplicated message sequence for the open conversation.
///
/// Invariants: ids are unique and the sequence ascends by `sent_at`. Because
/// `append` dedups by id and inserts by timestamp, merging a history fetch and
/// live events produces the same sequence regardless of arrival order.
pub struct MessageStore {
    conversation: Option<ConversationId>,
    messages: Vec<StoredMessage>,
    next_local_id: i64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            conversation: None,
            messages: Vec::new(),
            next_local_id: -1,
        }
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.conversation
    }

    pub fn messages(&self) -> &[StoredMessage] {
        &self.messages
    }

    pub fn get(&self, message_id: MessageId) -> Option<&StoredMessage> {
        self.messages.iter().find(|m| m.message_id == message_id)
    }

    /// Replaces the store contents with a freshly fetched history.
    pub fn load(&mut self, conversation: ConversationId, history: Vec<MessageRecord>) {
        self.conversation = Some(conversation);
        self.messages.clear();
        for record in history {
            self.insert_record(StoredMessage::confirmed(record));
        }
    }

    /// Timestamp-ordered insert of a confirmed message; no-op on a duplicate
    /// id. Returns whether the message was inserted.
    pub fn append(&mut self, record: MessageRecord) -> bool {
        if self.contains(record.message_id) {
            return false;
        }
        self.insert_record(StoredMessage::confirmed(record));
        true
    }

    /// Inserts a locally-sent message with Pending delivery and a fresh local
    /// id, returning that id.
    pub fn insert_optimistic(
        &mut self,
        sender_id: UserId,
        body: MessageBody,
        sent_at: DateTime<Utc>,
    ) -> MessageId {
        let local_id = MessageId(self.next_local_id);
        self.next_local_id -= 1;
        self.insert_record(StoredMessage {
            message_id: local_id,
            sender_id,
            body,
            sent_at,
            delivery: DeliveryState::Pending,
        });
        local_id
    }

    /// Replaces the pending entry in place with its server-confirmed
    /// counterpart, preserving its position. If the confirmed id already
    /// arrived through the live channel, the pending entry is dropped instead
    /// so ids stay unique. Returns whether anything changed.
    pub fn reconcile(&mut self, local_id: MessageId, record: MessageRecord) -> bool {
        let Some(index) = self.index_of(local_id) else {
            return false;
        };
        if self
            .messages
            .iter()
            .any(|m| m.message_id == record.message_id)
        {
            self.messages.remove(index);
            return true;
        }
        self.messages[index] = StoredMessage::confirmed(record);
        true
    }

    /// Matches a live echo of the local user's own send against the oldest
    /// pending entry with the same body, confirming it in place. Returns
    /// whether a pending entry was consumed.
    pub fn reconcile_pending_echo(&mut self, record: &MessageRecord) -> bool {
        if self.contains(record.message_id) {
            return false;
        }
        let Some(index) = self.messages.iter().position(|m| {
            m.delivery == DeliveryState::Pending
                && m.sender_id == record.sender_id
                && m.body == record.body
        }) else {
            return false;
        };
        self.messages[index] = StoredMessage::confirmed(record.clone());
        true
    }

    /// Marks a pending send as Failed; the entry stays visible for retry or
    /// discard. Returns whether the entry existed.
    pub fn fail(&mut self, local_id: MessageId) -> bool {
        match self.messages.iter_mut().find(|m| m.message_id == local_id) {
            Some(message) => {
                message.delivery = DeliveryState::Failed;
                true
            }
            None => false,
        }
    }

    /// Removes a Failed entry. Pending and Confirmed entries are not
    /// discardable through this path.
    pub fn discard(&mut self, local_id: MessageId) -> bool {
        let Some(index) = self.index_of(local_id) else {
            return false;
        };
        if self.messages[index].delivery != DeliveryState::Failed {
            return false;
        }
        self.messages.remove(index);
        true
    }

    pub fn remove(&mut self, message_id: MessageId) -> bool {
        let Some(index) = self.index_of(message_id) else {
            return false;
        };
        self.messages.remove(index);
        true
    }

    fn contains(&self, message_id: MessageId) -> bool {
        self.messages.iter().any(|m| m.message_id == message_id)
    }

    fn index_of(&self, message_id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.message_id == message_id)
    }

    fn insert_record(&mut self, message: StoredMessage) {
        debug_assert!(!self.contains(message.message_id));
        let index = self
            .messages
            .iter()
            .rposition(|m| m.sent_at <= message.sent_at)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.messages.insert(index, message);
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
