use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ConversationScope, CorrelationId, GroupId, PresenceStatus, ServerMessageId, TypingStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub is_self: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersResponse {
    pub members: Vec<MemberSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub server_id: ServerMessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub sender: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitMessageRequest {
    pub scope: ConversationScope,
    pub text: String,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitMessageResponse {
    pub server_id: ServerMessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub scope: ConversationScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub scope: ConversationScope,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCountsResponse {
    pub unread: Vec<UnreadCount>,
}

/// A message as it travels over the realtime channel. Identifiers are raw:
/// the client resolves them to peer keys once it has decoded the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerMessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelEvent {
    Message {
        message: WireMessage,
    },
    Presence {
        peer: String,
        status: PresenceStatus,
    },
    Typing {
        from: String,
        to: String,
        status: TypingStatus,
    },
    MessageRead {
        server_ids: Vec<ServerMessageId>,
    },
    /// Badge-only notice that a message arrived somewhere, without payload.
    NewMessage {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        to: String,
        text: String,
        correlation_id: CorrelationId,
    },
    GroupMessage {
        group_id: GroupId,
        text: String,
        correlation_id: CorrelationId,
    },
    Typing {
        from: String,
        to: String,
        status: TypingStatus,
    },
}

impl ClientFrame {
    pub fn for_scope(scope: &ConversationScope, text: &str, correlation_id: CorrelationId) -> Self {
        match scope {
            ConversationScope::Direct(peer) => Self::Message {
                to: peer.to_string(),
                text: text.to_string(),
                correlation_id,
            },
            ConversationScope::Group(group_id) => Self::GroupMessage {
                group_id: group_id.clone(),
                text: text.to_string(),
                correlation_id,
            },
        }
    }
}
