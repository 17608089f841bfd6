use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use shared::domain::{ConversationId, DeliveryState, GroupId, MessageId, UserId};
use shared::protocol::{MessageBody, MessageRecord};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;
use uuid::Uuid;

pub mod api;
pub mod channel;
pub mod config;
pub mod directory;
pub mod error;
pub mod identity;
pub mod store;
pub mod unread;

pub use channel::{ChannelEvent, ChannelState};
pub use config::{load_settings, Settings};
pub use directory::ConversationEntry;
pub use error::ClientError;
pub use store::StoredMessage;
pub use unread::ReadState;

use api::ApiClient;
use channel::LiveEventChannel;
use directory::ConversationDirectory;
use identity::IdentityResolver;
use store::MessageStore;
use unread::UnreadTracker;

const UI_EVENT_CAPACITY: usize = 1024;

/// Change notifications for the UI layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    DirectoryChanged,
    ConversationLoaded {
        conversation: ConversationId,
    },
    MessageAdded {
        conversation: ConversationId,
        message: StoredMessage,
    },
    MessageUpdated {
        conversation: ConversationId,
        message: StoredMessage,
    },
    MessageRemoved {
        conversation: ConversationId,
        message_id: MessageId,
    },
    UnreadChanged {
        conversation: ConversationId,
        count: u32,
    },
    Error(String),
}

/// Lifecycle of the currently selected conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Opening(ConversationId),
    Open(ConversationId),
    Closing(ConversationId),
}

struct SyncState {
    phase: Phase,
    /// Bumped on every open and close; an in-flight history fetch applies its
    /// result only if the epoch it captured is still current. Superseded
    /// results are discarded, never applied to a different conversation.
    open_epoch: u64,
    router_task: Option<JoinHandle<()>>,
    refresh_task: Option<JoinHandle<()>>,
}

/// Top-level coordinator: owns the stores, wires the live channel to them,
/// and drives the open/send/close lifecycles.
pub struct SyncClient {
    api: Arc<ApiClient>,
    identity: IdentityResolver,
    directory: ConversationDirectory,
    unread: UnreadTracker,
    channel: Arc<LiveEventChannel>,
    store: Mutex<MessageStore>,
    inner: Mutex<SyncState>,
    events: broadcast::Sender<ClientEvent>,
    self_id: UserId,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("self_id", &self.self_id)
            .finish_non_exhaustive()
    }
}

impl SyncClient {
    /// Resolves the caller's identity, seeds unread counts and the directory,
    /// connects the live channel and starts the routing and periodic-refresh
    /// tasks.
    pub async fn login(settings: Settings, external_id: &str) -> Result<Arc<Self>> {
        let api = Arc::new(ApiClient::new(&settings.api_url, &settings.session_token));
        let identity = IdentityResolver::new(Arc::clone(&api));
        let self_id = identity.resolve(external_id).await?;

        let unread = UnreadTracker::new(self_id);
        match api.unread_counts(self_id).await {
            Ok(counts) => unread.load(counts).await,
            Err(err) => warn!("unread snapshot fetch failed at login: {err:#}"),
        }

        let channel = LiveEventChannel::new(
            &settings.channel_url,
            &settings.session_token,
            Uuid::new_v4(),
            self_id,
        );
        let (events, _) = broadcast::channel(UI_EVENT_CAPACITY);

        let client = Arc::new(Self {
            api,
            identity,
            directory: ConversationDirectory::new(),
            unread,
            channel,
            store: Mutex::new(MessageStore::new()),
            inner: Mutex::new(SyncState {
                phase: Phase::Closed,
                open_epoch: 0,
                router_task: None,
                refresh_task: None,
            }),
            events,
            self_id,
        });

        // Subscribe before connecting so no early event slips past the router.
        let channel_events = client.channel.subscribe();
        client.channel.connect().await;

        let router = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.route_events(channel_events).await }
        });
        let refresh = tokio::spawn({
            let client = Arc::clone(&client);
            let period = Duration::from_secs(settings.directory_refresh_secs.max(1));
            async move { client.run_directory_refresh(period).await }
        });
        {
            let mut inner = client.inner.lock().await;
            inner.router_task = Some(router);
            inner.refresh_task = Some(refresh);
        }

        client.refresh_directory().await;
        Ok(client)
    }

    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Stream view of the same notifications, for consumers that prefer
    /// `StreamExt` over a bare receiver.
    pub fn event_stream(&self) -> BroadcastStream<ClientEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Opens a conversation: history fetch and mark-as-read run concurrently,
    /// and a group's topic is subscribed for the duration of the open. A
    /// mark-as-read failure is reported but never blocks the open; a history
    /// failure tears the open back down and surfaces to the caller.
    pub async fn open_conversation(&self, conversation: ConversationId) -> Result<()> {
        self.close_conversation().await;

        let epoch = {
            let mut inner = self.inner.lock().await;
            inner.open_epoch += 1;
            inner.phase = Phase::Opening(conversation);
            inner.open_epoch
        };

        if let ConversationId::Group(group_id) = conversation {
            self.channel.subscribe_group(group_id).await;
        }

        let (history, reset) = tokio::join!(
            self.fetch_history(conversation),
            self.unread.reset(&self.api, conversation),
        );

        match reset {
            Ok(()) => {
                let _ = self.events.send(ClientEvent::UnreadChanged {
                    conversation,
                    count: 0,
                });
            }
            Err(err) => {
                // Count stays as-is; the next open of this conversation
                // retries the mark-as-read.
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("mark-as-read failed: {err:#}")));
            }
        }

        let history = match history {
            Ok(history) => history,
            Err(err) => {
                let unwind = {
                    let mut inner = self.inner.lock().await;
                    if inner.open_epoch == epoch {
                        inner.phase = Phase::Closed;
                        true
                    } else {
                        false
                    }
                };
                if unwind {
                    if let ConversationId::Group(group_id) = conversation {
                        self.channel.unsubscribe_group(group_id).await;
                    }
                }
                return Err(err);
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.open_epoch != epoch {
                // Superseded while fetching; the late result is discarded.
                return Ok(());
            }
            inner.phase = Phase::Open(conversation);
        }
        self.store.lock().await.load(conversation, history);
        let _ = self
            .events
            .send(ClientEvent::ConversationLoaded { conversation });
        Ok(())
    }

    /// Closes the current conversation, releasing its group topic reference.
    /// The store keeps its contents; the next `open` replaces them, which
    /// avoids racing a fast reopen against the teardown.
    pub async fn close_conversation(&self) {
        let conversation = {
            let mut inner = self.inner.lock().await;
            let current = match inner.phase {
                Phase::Open(c) | Phase::Opening(c) => c,
                Phase::Closed | Phase::Closing(_) => return,
            };
            inner.phase = Phase::Closing(current);
            inner.open_epoch += 1;
            current
        };

        if let ConversationId::Group(group_id) = conversation {
            self.channel.unsubscribe_group(group_id).await;
        }

        let mut inner = self.inner.lock().await;
        if inner.phase == Phase::Closing(conversation) {
            inner.phase = Phase::Closed;
        }
    }

    /// Optimistic send: the message is visible as Pending immediately, then
    /// reconciled in place on confirmation or marked Failed on error.
    pub async fn send_message(&self, body: MessageBody) -> Result<MessageId> {
        let conversation = {
            let inner = self.inner.lock().await;
            match inner.phase {
                Phase::Open(c) => c,
                _ => return Err(ClientError::NoOpenConversation.into()),
            }
        };

        let (local_id, pending) = {
            let mut store = self.store.lock().await;
            let local_id = store.insert_optimistic(self.self_id, body.clone(), Utc::now());
            let pending = store.get(local_id).cloned();
            (local_id, pending)
        };
        if let Some(message) = pending {
            let _ = self.events.send(ClientEvent::MessageAdded {
                conversation,
                message,
            });
        }

        let sent = match conversation {
            ConversationId::Direct(peer_id) => {
                self.api
                    .send_direct_message(self.self_id, peer_id, &body)
                    .await
            }
            ConversationId::Group(group_id) => {
                self.api
                    .send_group_message(self.self_id, group_id, &body)
                    .await
            }
        };

        match sent {
            Ok(confirmed) => {
                let updated = {
                    let mut store = self.store.lock().await;
                    store.reconcile(local_id, confirmed.clone());
                    store.get(confirmed.message_id).cloned()
                };
                if let Some(message) = updated {
                    let _ = self.events.send(ClientEvent::MessageUpdated {
                        conversation,
                        message,
                    });
                }
                self.directory.touch(conversation, confirmed.sent_at).await;
                let _ = self.events.send(ClientEvent::DirectoryChanged);
                Ok(confirmed.message_id)
            }
            Err(err) => {
                let failed = {
                    let mut store = self.store.lock().await;
                    store.fail(local_id);
                    store.get(local_id).cloned()
                };
                if let Some(message) = failed {
                    let _ = self.events.send(ClientEvent::MessageUpdated {
                        conversation,
                        message,
                    });
                }
                Err(ClientError::SendFailed {
                    local_id,
                    reason: format!("{err:#}"),
                }
                .into())
            }
        }
    }

    /// Re-issues a failed send. The failed entry is removed and the payload
    /// goes through the normal optimistic path again.
    pub async fn retry_send(&self, local_id: MessageId) -> Result<MessageId> {
        let (conversation, body) = {
            let mut store = self.store.lock().await;
            let Some(message) = store.get(local_id) else {
                return Err(ClientError::UnknownLocalMessage(local_id).into());
            };
            if message.delivery != DeliveryState::Failed {
                return Err(ClientError::NotRetriable(local_id).into());
            }
            let body = message.body.clone();
            store.discard(local_id);
            (store.conversation(), body)
        };
        if let Some(conversation) = conversation {
            let _ = self.events.send(ClientEvent::MessageRemoved {
                conversation,
                message_id: local_id,
            });
        }
        self.send_message(body).await
    }

    /// Drops a failed send for good. Never silent: the caller asked.
    pub async fn discard_failed(&self, local_id: MessageId) -> Result<()> {
        let conversation = {
            let mut store = self.store.lock().await;
            if !store.discard(local_id) {
                return Err(ClientError::NotRetriable(local_id).into());
            }
            store.conversation()
        };
        if let Some(conversation) = conversation {
            let _ = self.events.send(ClientEvent::MessageRemoved {
                conversation,
                message_id: local_id,
            });
        }
        Ok(())
    }

    pub async fn directory(&self) -> Vec<ConversationEntry> {
        let counts = self.unread.snapshot().await;
        self.directory.snapshot(&counts).await
    }

    pub async fn search_directory(&self, filter: &str) -> Vec<ConversationEntry> {
        let counts = self.unread.snapshot().await;
        self.directory.search(filter, &counts).await
    }

    /// Full three-source refetch; degraded sources are logged inside the
    /// directory and never abort the refresh.
    pub async fn refresh_directory(&self) -> Vec<ConversationEntry> {
        self.directory.refresh(&self.api, self.self_id).await;
        let _ = self.events.send(ClientEvent::DirectoryChanged);
        self.directory().await
    }

    pub async fn unread_count(&self, conversation: ConversationId) -> u32 {
        self.unread.get(conversation).await
    }

    /// Contents of the message store for the open conversation.
    pub async fn messages(&self) -> Vec<StoredMessage> {
        self.store.lock().await.messages().to_vec()
    }

    pub async fn join_group(&self, group_id: GroupId) -> Result<()> {
        self.api.join_group(self.self_id, group_id).await?;
        self.refresh_directory().await;
        Ok(())
    }

    pub async fn leave_group(&self, group_id: GroupId) -> Result<()> {
        let open = {
            let inner = self.inner.lock().await;
            matches!(
                inner.phase,
                Phase::Open(c) | Phase::Opening(c) if c == ConversationId::Group(group_id)
            )
        };
        if open {
            self.close_conversation().await;
        }
        self.api.leave_group(self.self_id, group_id).await?;
        self.refresh_directory().await;
        Ok(())
    }

    /// Stops the routing and refresh tasks and drops the live connection.
    pub async fn shutdown(&self) {
        let (router, refresh) = {
            let mut inner = self.inner.lock().await;
            (inner.router_task.take(), inner.refresh_task.take())
        };
        if let Some(task) = router {
            task.abort();
        }
        if let Some(task) = refresh {
            task.abort();
        }
        self.channel.disconnect().await;
    }

    async fn fetch_history(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<MessageRecord>> {
        match conversation {
            ConversationId::Direct(peer_id) => {
                self.api.direct_messages(self.self_id, peer_id).await
            }
            ConversationId::Group(group_id) => self.api.group_messages(group_id).await,
        }
    }

    async fn route_events(&self, mut rx: broadcast::Receiver<ChannelEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => self.route_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "live event consumer lagged; periodic refresh reconciles");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Routes one normalized live event: into the store when its conversation
    /// is open, into the unread tracker otherwise; the directory's ordering
    /// is bumped either way.
    async fn route_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::MessageReceived {
                conversation,
                message,
            } => {
                self.directory.touch(conversation, message.sent_at).await;
                let _ = self.events.send(ClientEvent::DirectoryChanged);

                let open = matches!(
                    self.inner.lock().await.phase,
                    Phase::Open(c) if c == conversation
                );
                if open {
                    let (reconciled, appended) = {
                        let mut store = self.store.lock().await;
                        if message.sender_id == self.self_id
                            && store.reconcile_pending_echo(&message)
                        {
                            (store.get(message.message_id).cloned(), None)
                        } else if store.append(message.clone()) {
                            (None, store.get(message.message_id).cloned())
                        } else {
                            (None, None)
                        }
                    };
                    if let Some(message) = reconciled {
                        let _ = self.events.send(ClientEvent::MessageUpdated {
                            conversation,
                            message,
                        });
                    }
                    if let Some(message) = appended {
                        let _ = self.events.send(ClientEvent::MessageAdded {
                            conversation,
                            message,
                        });
                    }
                } else if let Some(count) =
                    self.unread.observe(conversation, message.sender_id).await
                {
                    let _ = self.events.send(ClientEvent::UnreadChanged {
                        conversation,
                        count,
                    });
                }
            }
            ChannelEvent::MessageDeleted {
                conversation,
                message_id,
            } => {
                let open = matches!(
                    self.inner.lock().await.phase,
                    Phase::Open(c) if c == conversation
                );
                if open && self.store.lock().await.remove(message_id) {
                    let _ = self.events.send(ClientEvent::MessageRemoved {
                        conversation,
                        message_id,
                    });
                }
            }
        }
    }

    async fn run_directory_refresh(&self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // login already refreshed once
        loop {
            interval.tick().await;
            self.refresh_directory().await;
        }
    }
}

/// The surface the UI layer consumes; `Arc<SyncClient>` is the production
/// implementation.
#[async_trait]
pub trait ConversationClient: Send + Sync {
    async fn open_conversation(&self, conversation: ConversationId) -> Result<()>;
    async fn close_conversation(&self);
    async fn send_message(&self, body: MessageBody) -> Result<MessageId>;
    async fn retry_send(&self, local_id: MessageId) -> Result<MessageId>;
    async fn discard_failed(&self, local_id: MessageId) -> Result<()>;
    async fn directory(&self) -> Vec<ConversationEntry>;
    async fn search_directory(&self, filter: &str) -> Vec<ConversationEntry>;
    async fn refresh_directory(&self) -> Vec<ConversationEntry>;
    async fn unread_count(&self, conversation: ConversationId) -> u32;
    async fn messages(&self) -> Vec<StoredMessage>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
    async fn shutdown(&self);
}

#[async_trait]
impl ConversationClient for Arc<SyncClient> {
    async fn open_conversation(&self, conversation: ConversationId) -> Result<()> {
        SyncClient::open_conversation(self, conversation).await
    }

    async fn close_conversation(&self) {
        SyncClient::close_conversation(self).await
    }

    async fn send_message(&self, body: MessageBody) -> Result<MessageId> {
        SyncClient::send_message(self, body).await
    }

    async fn retry_send(&self, local_id: MessageId) -> Result<MessageId> {
        SyncClient::retry_send(self, local_id).await
    }

    async fn discard_failed(&self, local_id: MessageId) -> Result<()> {
        SyncClient::discard_failed(self, local_id).await
    }

    async fn directory(&self) -> Vec<ConversationEntry> {
        SyncClient::directory(self).await
    }

    async fn search_directory(&self, filter: &str) -> Vec<ConversationEntry> {
        SyncClient::search_directory(self, filter).await
    }

    async fn refresh_directory(&self) -> Vec<ConversationEntry> {
        SyncClient::refresh_directory(self).await
    }

    async fn unread_count(&self, conversation: ConversationId) -> u32 {
        SyncClient::unread_count(self, conversation).await
    }

    async fn messages(&self) -> Vec<StoredMessage> {
        SyncClient::messages(self).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        SyncClient::subscribe_events(self)
    }

    async fn shutdown(&self) {
        SyncClient::shutdown(self).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
