use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{FileId, GroupId, MessageId, UserId},
    error::ApiError,
};

/// A peer as returned by both the history listing and the full roster; the
/// roster variant carries no `last_message_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub external_id: String,
    pub internal_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: GroupId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
}

/// Attachment metadata envelope. Content encoding and upload are handled by
/// the caller before the send; the core only moves the envelope around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub file_id: FileId,
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    Attachment(AttachmentPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub sent_at: DateTime<Utc>,
}

/// Per-target unread counters, keyed by peer user id and group id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnreadCounts {
    #[serde(default)]
    pub direct: HashMap<i64, u32>,
    #[serde(default)]
    pub groups: HashMap<i64, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendDirectMessageRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Topic {
    Personal(UserId),
    Group(GroupId),
}

/// Outbound frames the client writes on the live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChannelRequest {
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
}

/// Inbound frames the live channel delivers. This is the transport's raw
/// schema; consumers only ever see the normalized event shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushFrame {
    DirectMessage {
        receiver_id: UserId,
        message: MessageRecord,
    },
    GroupMessage {
        group_id: GroupId,
        message: MessageRecord,
    },
    DirectMessageDeleted {
        peer_id: UserId,
        message_id: MessageId,
    },
    GroupMessageDeleted {
        group_id: GroupId,
        message_id: MessageId,
    },
    Error(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_frame_round_trips_tagged_representation() {
        let frame = PushFrame::GroupMessage {
            group_id: GroupId(4),
            message: MessageRecord {
                message_id: MessageId(17),
                sender_id: UserId(3),
                body: MessageBody::Text("status update".to_string()),
                sent_at: "2024-01-02T09:00:00Z".parse().expect("timestamp"),
            },
        };

        let json = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(json["type"], "group_message");
        assert_eq!(json["payload"]["group_id"], 4);

        let back: PushFrame = serde_json::from_value(json).expect("deserialize");
        match back {
            PushFrame::GroupMessage { group_id, message } => {
                assert_eq!(group_id, GroupId(4));
                assert_eq!(message.message_id, MessageId(17));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unread_counts_accept_integer_keys() {
        let counts: UnreadCounts =
            serde_json::from_str(r#"{"direct":{"5":2},"groups":{"4":0}}"#).expect("deserialize");
        assert_eq!(counts.direct.get(&5), Some(&2));
        assert_eq!(counts.groups.get(&4), Some(&0));
    }

    #[test]
    fn attachment_bodies_round_trip() {
        let body = MessageBody::Attachment(AttachmentPayload {
            file_id: FileId(88),
            filename: "q3-forecast.xlsx".to_string(),
            size_bytes: 24_576,
            mime_type: Some("application/vnd.ms-excel".to_string()),
        });

        let json = serde_json::to_string(&body).expect("serialize");
        let back: MessageBody = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, body);
    }

    #[test]
    fn roster_peer_deserializes_without_last_message_time() {
        let peer: PeerSummary = serde_json::from_str(
            r#"{"external_id":"auth0|abc","internal_id":9,"display_name":"Dana"}"#,
        )
        .expect("deserialize");
        assert_eq!(peer.internal_id, UserId(9));
        assert!(peer.last_message_time.is_none());
    }
}
