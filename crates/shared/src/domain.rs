use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical identity of a user within a tenant: trimmed and lowercased.
///
/// The only way to build one is through [`PeerKey::normalize`] (serde goes
/// through it too), so two keys compare equal exactly when they name the same
/// user. An empty key means "cannot address this peer".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PeerKey(String);

impl PeerKey {
    pub fn normalize(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerKey {
    fn from(value: String) -> Self {
        Self::normalize(&value)
    }
}

impl From<PeerKey> for String {
    fn from(value: PeerKey) -> Self {
        value.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! text_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl AsRef<str>) -> Self {
                Self(raw.as_ref().trim().to_string())
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

text_id_newtype!(GroupId);
text_id_newtype!(TenantId);
text_id_newtype!(CorrelationId);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(format!("cid-{}", Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerMessageId(pub i64);

impl fmt::Display for ServerMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The addressed target of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationScope {
    Direct(PeerKey),
    Group(GroupId),
}

impl ConversationScope {
    /// A direct scope needs a non-empty peer, a group scope a non-empty id.
    pub fn is_addressable(&self) -> bool {
        match self {
            Self::Direct(peer) => !peer.is_empty(),
            Self::Group(group_id) => !group_id.is_empty(),
        }
    }

    pub fn direct_peer(&self) -> Option<&PeerKey> {
        match self {
            Self::Direct(peer) => Some(peer),
            Self::Group(_) => None,
        }
    }
}

impl fmt::Display for ConversationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(peer) => write!(f, "direct:{peer}"),
            Self::Group(group_id) => write!(f, "group:{group_id}"),
        }
    }
}

/// Delivery progress of a message. Ordered so that `max` never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadState {
    Pending,
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingStatus {
    Typing,
    Idle,
}

impl TypingStatus {
    pub fn from_active(active: bool) -> Self {
        if active {
            Self::Typing
        } else {
            Self::Idle
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Typing)
    }
}
