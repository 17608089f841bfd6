use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, GroupId, UserId},
    protocol::UnreadCounts,
};
use tokio::sync::Mutex;

use crate::api::ApiClient;

/// Per-conversation read state: the unread counter plus the time the last
/// mark-as-read was acknowledged by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReadState {
    pub unread: u32,
    pub last_acknowledged: Option<DateTime<Utc>>,
}

/// Per-conversation unread counters.
///
/// `reset` is the only operation that lowers a count, and it only does so
/// after the remote mark-as-read succeeds. Incoming events from the local
/// user never increment.
pub struct UnreadTracker {
    self_id: UserId,
    counts: Mutex<HashMap<ConversationId, ReadState>>,
}

impl UnreadTracker {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds counters from the server's unread snapshot.
    pub async fn load(&self, snapshot: UnreadCounts) {
        let mut counts = self.counts.lock().await;
        counts.clear();
        for (peer_id, unread) in snapshot.direct {
            counts.insert(
                ConversationId::Direct(UserId(peer_id)),
                ReadState {
                    unread,
                    last_acknowledged: None,
                },
            );
        }
        for (group_id, unread) in snapshot.groups {
            counts.insert(
                ConversationId::Group(GroupId(group_id)),
                ReadState {
                    unread,
                    last_acknowledged: None,
                },
            );
        }
    }

    /// Counts an incoming event for a conversation that is not open. Returns
    /// the new count, or `None` when the event was the local user's own send.
    pub async fn observe(&self, conversation: ConversationId, sender_id: UserId) -> Option<u32> {
        if sender_id == self.self_id {
            return None;
        }
        let mut counts = self.counts.lock().await;
        let state = counts.entry(conversation).or_default();
        state.unread += 1;
        Some(state.unread)
    }

    /// Marks the conversation read remotely, then zeroes the local counter.
    /// On failure the counter is left unchanged and the error surfaces to the
    /// caller; the orchestrator retries at the next open rather than looping.
    pub async fn reset(&self, api: &ApiClient, conversation: ConversationId) -> Result<()> {
        match conversation {
            ConversationId::Direct(peer_id) => api.mark_direct_read(self.self_id, peer_id).await?,
            ConversationId::Group(group_id) => api.mark_group_read(self.self_id, group_id).await?,
        }
        let mut counts = self.counts.lock().await;
        let state = counts.entry(conversation).or_default();
        state.unread = 0;
        state.last_acknowledged = Some(Utc::now());
        Ok(())
    }

    pub async fn get(&self, conversation: ConversationId) -> u32 {
        self.read_state(conversation).await.unread
    }

    pub async fn read_state(&self, conversation: ConversationId) -> ReadState {
        self.counts
            .lock()
            .await
            .get(&conversation)
            .copied()
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> HashMap<ConversationId, u32> {
        self.counts
            .lock()
            .await
            .iter()
            .map(|(conversation, state)| (*conversation, state.unread))
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
