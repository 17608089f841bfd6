use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(MessageId);
id_newtype!(FileId);

impl MessageId {
    /// Locally-allocated optimistic ids are negative; server-assigned ids are positive.
    pub fn is_local(self) -> bool {
        self.0 < 0
    }
}

/// Conversation identity. Equality and hashing are by (kind, id), so a direct
/// conversation with user 7 and a group with id 7 are distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationId {
    Direct(UserId),
    Group(GroupId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}
