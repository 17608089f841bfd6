use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, UserId},
    protocol::PeerSummary,
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::api::ApiClient;

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    pub conversation: ConversationId,
    pub display_name: String,
    /// `None` means never contacted; such entries sort after every
    /// timestamped entry and are a distinct state from zero unread.
    pub last_activity: Option<DateTime<Utc>>,
    pub unread: u32,
}

#[derive(Default)]
struct DirectoryState {
    entries: Vec<ConversationEntry>,
    roster: Vec<PeerSummary>,
}

/// Merged, sorted list of known conversations: direct peers with history plus
/// groups, most recent first, with the full peer roster retained for
/// name-filtered lookups.
#[derive(Default)]
pub struct ConversationDirectory {
    inner: Mutex<DirectoryState>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refetches all three sources concurrently and rebuilds the merged list.
    /// A failed source degrades to an empty contribution; it is logged, never
    /// raised, so one bad endpoint cannot blank the whole directory call.
    pub async fn refresh(&self, api: &ApiClient, self_id: UserId) -> Vec<ConversationEntry> {
        let (peers, roster, groups) = tokio::join!(
            api.peers_with_history(self_id),
            api.peer_roster(),
            api.groups_with_history(self_id),
        );

        let peers = peers.unwrap_or_else(|err| {
            warn!("peer history fetch failed during directory refresh: {err:#}");
            Vec::new()
        });
        let roster = roster.unwrap_or_else(|err| {
            warn!("roster fetch failed during directory refresh: {err:#}");
            Vec::new()
        });
        let groups = groups.unwrap_or_else(|err| {
            warn!("group fetch failed during directory refresh: {err:#}");
            Vec::new()
        });

        let mut entries = Vec::with_capacity(peers.len() + groups.len());
        let mut seen = HashSet::new();
        for peer in &peers {
            let conversation = ConversationId::Direct(peer.internal_id);
            if seen.insert(conversation) {
                entries.push(ConversationEntry {
                    conversation,
                    display_name: peer.display_name.clone(),
                    last_activity: peer.last_message_time,
                    unread: 0,
                });
            }
        }
        for group in &groups {
            let conversation = ConversationId::Group(group.group_id);
            if seen.insert(conversation) {
                entries.push(ConversationEntry {
                    conversation,
                    display_name: group.name.clone(),
                    last_activity: group.last_message_time,
                    unread: 0,
                });
            }
        }
        sort_entries(&mut entries);

        let mut state = self.inner.lock().await;
        state.entries = entries.clone();
        state.roster = roster;
        entries
    }

    /// Bumps a conversation's last activity (never backwards) and restores
    /// ordering. Unknown conversations are created on first observation; the
    /// next refresh fills in their display name.
    pub async fn touch(&self, conversation: ConversationId, at: DateTime<Utc>) {
        let mut state = self.inner.lock().await;
        match state
            .entries
            .iter_mut()
            .find(|e| e.conversation == conversation)
        {
            Some(entry) => {
                if entry.last_activity.map_or(true, |current| current < at) {
                    entry.last_activity = Some(at);
                }
            }
            None => {
                let display_name = state
                    .roster
                    .iter()
                    .find(|p| ConversationId::Direct(p.internal_id) == conversation)
                    .map(|p| p.display_name.clone())
                    .unwrap_or_default();
                state.entries.push(ConversationEntry {
                    conversation,
                    display_name,
                    last_activity: Some(at),
                    unread: 0,
                });
            }
        }
        sort_entries(&mut state.entries);
    }

    pub async fn snapshot(
        &self,
        unread: &HashMap<ConversationId, u32>,
    ) -> Vec<ConversationEntry> {
        let state = self.inner.lock().await;
        annotate(state.entries.clone(), unread)
    }

    /// Name-filtered view: the merged list narrowed to matching names,
    /// unioned with roster peers that match but have no conversation yet,
    /// appended without a timestamp.
    pub async fn search(
        &self,
        filter: &str,
        unread: &HashMap<ConversationId, u32>,
    ) -> Vec<ConversationEntry> {
        let needle = filter.to_lowercase();
        let state = self.inner.lock().await;
        let mut matches: Vec<ConversationEntry> = state
            .entries
            .iter()
            .filter(|e| e.display_name.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        let present: HashSet<ConversationId> = matches.iter().map(|e| e.conversation).collect();
        for peer in &state.roster {
            let conversation = ConversationId::Direct(peer.internal_id);
            if present.contains(&conversation) {
                continue;
            }
            if peer.display_name.to_lowercase().contains(&needle) {
                matches.push(ConversationEntry {
                    conversation,
                    display_name: peer.display_name.clone(),
                    last_activity: None,
                    unread: 0,
                });
            }
        }
        annotate(matches, unread)
    }
}

fn annotate(
    mut entries: Vec<ConversationEntry>,
    unread: &HashMap<ConversationId, u32>,
) -> Vec<ConversationEntry> {
    for entry in &mut entries {
        entry.unread = unread.get(&entry.conversation).copied().unwrap_or(0);
    }
    entries
}

/// Descending by last activity; never-contacted entries sort after all
/// timestamped ones. The sort is stable, so equal timestamps and the
/// no-timestamp tail keep the order their source supplied.
fn sort_entries(entries: &mut [ConversationEntry]) {
    entries.sort_by(|a, b| match (a.last_activity, b.last_activity) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
