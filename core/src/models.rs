/// Domain entities shared by the REST collaborator and the live protocol
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Canonical key for a two-party conversation.
///
/// Built by sorting both participant ids and joining them with `_`, so either
/// side derives the same key without asking the server. Identities are
/// server-issued hex object ids and never contain `_`; ids that do can
/// collide (`a_b`+`c` and `a`+`b_c` share a key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn between(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}_{}", low, high))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The participant that is not `me`, if `me` takes part at all.
    /// Anchored on `me` rather than the first `_`, and only accepts the
    /// split that `between` would have produced.
    pub fn peer_of(&self, me: &str) -> Option<&str> {
        let key = self.0.as_str();
        let low = key
            .strip_prefix(me)
            .and_then(|rest| rest.strip_prefix('_'))
            .filter(|peer| me <= *peer);
        low.or_else(|| {
            key.strip_suffix(me)
                .and_then(|rest| rest.strip_suffix('_'))
                .filter(|peer| *peer <= me)
        })
    }
}

impl From<&str> for ConversationId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accepts either a bare id or a populated user object (`{"_id": ..}`).
pub(crate) fn user_ref<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum UserRef {
        Id(String),
        Populated {
            #[serde(rename = "_id", alias = "id")]
            id: String,
        },
    }

    Ok(match UserRef::deserialize(deserializer)? {
        UserRef::Id(id) => id,
        UserRef::Populated { id } => id,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    #[serde(deserialize_with = "user_ref")]
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(deserialize_with = "user_ref")]
    pub sender_id: String,
    #[serde(deserialize_with = "user_ref")]
    pub receiver_id: String,
    #[serde(rename = "conversationId", alias = "chatId")]
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub content: String,
    /// Attachment URLs (uploads happen elsewhere)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

/// Public profile as returned by `GET /users/:id`.
///
/// `user:updated` carries the same shape with only the changed fields set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reputation: Option<i64>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            avatar: None,
            bio: None,
            reputation: None,
        }
    }

    /// Overlay the fields present in `patch`
    pub fn merge(&mut self, patch: &UserProfile) {
        if patch.name.is_some() {
            self.name = patch.name.clone();
        }
        if patch.avatar.is_some() {
            self.avatar = patch.avatar.clone();
        }
        if patch.bio.is_some() {
            self.bio = patch.bio.clone();
        }
        if patch.reputation.is_some() {
            self.reputation = patch.reputation;
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A help request or offer. Only the fields the core looks at are typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Post {
    /// Shallow merge: fields in `update` win, everything else is kept
    pub fn merge(&mut self, update: &Post) {
        if update.title.is_some() {
            self.title = update.title.clone();
        }
        if update.status.is_some() {
            self.status = update.status.clone();
        }
        for (key, value) in &update.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// One row of the conversation list (`GET /messages/chats`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(rename = "conversationId", alias = "chatId")]
    pub conversation_id: ConversationId,
    pub other_user: UserProfile,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
}
