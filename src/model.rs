use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub is_online: bool,
    pub last_seen_at: Option<i64>,
    pub created_at: i64,
}

/// Projection of a user embedded in chat lists, contact lists and search
/// results. `is_online`/`last_seen_at` are overlaid from the ephemeral
/// presence record before the summary leaves the server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub is_online: bool,
    pub last_seen_at: Option<i64>,
}

/// Author stub attached to every message payload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserBrief {
    pub id: i64,
    pub name: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    // reserved; no creation surface yet
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Direct => "direct",
            ChatKind::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "group" => ChatKind::Group,
            _ => ChatKind::Direct,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: Uuid,
    pub kind: ChatKind,
    pub name: Option<String>,
    pub last_message_id: Option<Uuid>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Chat as presented in listings: the row itself plus the other members,
/// the denormalized last message and the derived unread count.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    #[serde(flatten)]
    pub chat: Chat,
    pub users: Vec<UserSummary>,
    pub last_message: Option<MessageView>,
    pub unread_count: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub author_id: i64,
    pub content: String,
    pub is_read: bool,
    pub read_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub author: UserBrief,
}
