use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ConversationId, GroupId, MessageId, UserId},
    protocol::{ChannelRequest, MessageRecord, PushFrame, Topic},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::ClientError;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// The normalized event shape consumers see. The transport's raw frame
/// schema never leaves this module.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    MessageReceived {
        conversation: ConversationId,
        message: MessageRecord,
    },
    MessageDeleted {
        conversation: ConversationId,
        message_id: MessageId,
    },
}

/// One persistent push subscription per session.
///
/// The personal topic is subscribed on every (re)connect; group topics are
/// reference-counted so repeated opens of the same group share a single
/// subscription, and all tracked topics are re-established after a reconnect.
/// Events are fanned out in transport arrival order; delivery is
/// at-least-once, so consumers dedup by message id.
pub struct LiveEventChannel {
    channel_url: String,
    token: String,
    session_id: Uuid,
    self_id: UserId,
    state: Mutex<ChannelState>,
    group_refs: Mutex<HashMap<GroupId, usize>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ChannelRequest>>>,
    events: broadcast::Sender<ChannelEvent>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveEventChannel {
    pub fn new(
        channel_url: impl Into<String>,
        token: impl Into<String>,
        session_id: Uuid,
        self_id: UserId,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            channel_url: channel_url.into(),
            token: token.into(),
            session_id,
            self_id,
            state: Mutex::new(ChannelState::Disconnected),
            group_refs: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            events,
            run_task: Mutex::new(None),
        })
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.lock().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Starts the connection task; idempotent while it is running.
    pub async fn connect(self: &Arc<Self>) {
        let mut task = self.run_task.lock().await;
        if task.is_some() {
            return;
        }
        let channel = Arc::clone(self);
        *task = Some(tokio::spawn(async move { channel.run().await }));
    }

    pub async fn disconnect(&self) {
        if let Some(task) = self.run_task.lock().await.take() {
            task.abort();
        }
        self.outbound.lock().await.take();
        *self.state.lock().await = ChannelState::Disconnected;
        info!("live channel disconnected");
    }

    /// Adds a reference to the group's topic, subscribing on the wire only
    /// for the first reference.
    pub async fn subscribe_group(&self, group_id: GroupId) {
        let first = {
            let mut refs = self.group_refs.lock().await;
            let count = refs.entry(group_id).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            self.send_request(ChannelRequest::Subscribe {
                topic: Topic::Group(group_id),
            })
            .await;
        }
    }

    /// Drops a reference; the wire subscription is torn down when the last
    /// reference closes.
    pub async fn unsubscribe_group(&self, group_id: GroupId) {
        let last = {
            let mut refs = self.group_refs.lock().await;
            match refs.get_mut(&group_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    refs.remove(&group_id);
                    true
                }
                None => false,
            }
        };
        if last {
            self.send_request(ChannelRequest::Unsubscribe {
                topic: Topic::Group(group_id),
            })
            .await;
        }
    }

    async fn send_request(&self, request: ChannelRequest) {
        if let Some(tx) = self.outbound.lock().await.as_ref() {
            let _ = tx.send(request);
        }
        // While disconnected the refcount alone is authoritative; the next
        // session replays every tracked topic.
    }

    async fn run(self: Arc<Self>) {
        let mut delay = RECONNECT_INITIAL_DELAY;
        loop {
            *self.state.lock().await = ChannelState::Connecting;
            let result = self.run_session().await;
            let was_connected = *self.state.lock().await == ChannelState::Connected;
            if let Err(err) = result {
                warn!("live channel session ended: {err:#}");
            }
            *self.state.lock().await = ChannelState::Disconnected;
            self.outbound.lock().await.take();

            if was_connected {
                delay = RECONNECT_INITIAL_DELAY;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }
    }

    async fn run_session(&self) -> Result<()> {
        let url = self.endpoint()?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect live channel: {url}"))?;
        *self.state.lock().await = ChannelState::Connected;
        info!("live channel connected");

        let (mut writer, mut reader) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelRequest>();

        let _ = tx.send(ChannelRequest::Subscribe {
            topic: Topic::Personal(self.self_id),
        });
        {
            let refs = self.group_refs.lock().await;
            for group_id in refs.keys() {
                let _ = tx.send(ChannelRequest::Subscribe {
                    topic: Topic::Group(*group_id),
                });
            }
        }
        *self.outbound.lock().await = Some(tx);

        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(request) = request else {
                        return Err(anyhow!("outbound request queue closed"));
                    };
                    let text = serde_json::to_string(&request)
                        .context("failed to encode channel request")?;
                    writer
                        .send(Message::Text(text))
                        .await
                        .context("failed to write channel request")?;
                }
                inbound = reader.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<PushFrame>(&text) {
                            Ok(frame) => {
                                if let Some(event) = normalize(frame, self.self_id) {
                                    let _ = self.events.send(event);
                                }
                            }
                            Err(err) => warn!("invalid push frame: {err}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(ClientError::ChannelDisconnected.into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return Err(anyhow::Error::from(err).context("live channel receive failed"));
                    }
                }
            }
        }
    }

    fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.channel_url)
            .with_context(|| format!("invalid channel url '{}'", self.channel_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("channel url cannot be a base"))?
            .pop_if_empty()
            .push("ws");
        url.query_pairs_mut()
            .append_pair("user_id", &self.self_id.0.to_string())
            .append_pair("session_id", &self.session_id.to_string())
            .append_pair("token", &self.token);
        Ok(url)
    }
}

/// Maps a raw transport frame onto the closed event set. Error frames are
/// logged here and never reach consumers.
pub fn normalize(frame: PushFrame, self_id: UserId) -> Option<ChannelEvent> {
    match frame {
        PushFrame::DirectMessage {
            receiver_id,
            message,
        } => {
            let peer = if message.sender_id == self_id {
                receiver_id
            } else {
                message.sender_id
            };
            Some(ChannelEvent::MessageReceived {
                conversation: ConversationId::Direct(peer),
                message,
            })
        }
        PushFrame::GroupMessage { group_id, message } => Some(ChannelEvent::MessageReceived {
            conversation: ConversationId::Group(group_id),
            message,
        }),
        PushFrame::DirectMessageDeleted {
            peer_id,
            message_id,
        } => Some(ChannelEvent::MessageDeleted {
            conversation: ConversationId::Direct(peer_id),
            message_id,
        }),
        PushFrame::GroupMessageDeleted {
            group_id,
            message_id,
        } => Some(ChannelEvent::MessageDeleted {
            conversation: ConversationId::Group(group_id),
            message_id,
        }),
        PushFrame::Error(err) => {
            warn!("live channel error frame: {:?}: {}", err.code, err.message);
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
