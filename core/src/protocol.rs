/// Live event protocol spoken over the realtime connection
///
/// Every frame is a JSON text message `{"event": "<name>", "data": <payload>}`.
/// Event names are fixed by the server; payloads are typed per event.
use crate::error::{Result, SyncError};
use crate::models::{user_ref, ConversationId, Message, Notification, Post, UserProfile};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadConfirm {
    #[serde(rename = "conversationId", alias = "chatId")]
    pub conversation_id: ConversationId,
}

/// `message:read`: tells `sender_id` their messages were read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadAnnounce {
    #[serde(rename = "conversationId", alias = "chatId")]
    pub conversation_id: ConversationId,
    pub sender_id: String,
}

/// `message:send`: fan-out of a message the REST API already persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAnnounce {
    #[serde(rename = "conversationId", alias = "chatId")]
    pub conversation_id: ConversationId,
    pub receiver_id: String,
    pub message: Message,
}

/// `message:delete` (out) / `message:deleted` (in)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRemoval {
    #[serde(rename = "conversationId", alias = "chatId")]
    pub conversation_id: ConversationId,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
}

/// `message:react` in both directions. Carries the full server-computed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdate {
    #[serde(rename = "conversationId", alias = "chatId")]
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCleared {
    #[serde(rename = "conversationId", alias = "chatId")]
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
}

/// Outbound typing start/stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingAnnounce {
    #[serde(rename = "conversationId", alias = "chatId")]
    pub conversation_id: ConversationId,
    pub receiver_id: String,
}

/// Inbound typing start/stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    #[serde(
        default,
        rename = "conversationId",
        alias = "chatId",
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_id: Option<ConversationId>,
    #[serde(alias = "userId", deserialize_with = "user_ref")]
    pub sender_id: String,
}

/// Older single-event typing indicator (`typing:status`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatus {
    #[serde(alias = "senderId", deserialize_with = "user_ref")]
    pub user_id: String,
    pub is_typing: bool,
    #[serde(
        default,
        rename = "conversationId",
        alias = "chatId",
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_id: Option<ConversationId>,
}

/// Events this client sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "user:join")]
    Join(String),

    #[serde(rename = "message:send")]
    MessageSend(MessageAnnounce),

    #[serde(rename = "message:read")]
    MessageRead(ReadAnnounce),

    #[serde(rename = "message:delete")]
    MessageDelete(MessageRemoval),

    #[serde(rename = "message:react")]
    MessageReact(ReactionUpdate),

    #[serde(rename = "chat:cleared")]
    ChatCleared(ChatCleared),

    #[serde(rename = "typing:start")]
    TypingStart(TypingAnnounce),

    #[serde(rename = "typing:stop")]
    TypingStop(TypingAnnounce),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join(_) => "user:join",
            ClientEvent::MessageSend(_) => "message:send",
            ClientEvent::MessageRead(_) => "message:read",
            ClientEvent::MessageDelete(_) => "message:delete",
            ClientEvent::MessageReact(_) => "message:react",
            ClientEvent::ChatCleared(_) => "chat:cleared",
            ClientEvent::TypingStart(_) => "typing:start",
            ClientEvent::TypingStop(_) => "typing:stop",
        }
    }

    /// Serialize to a text frame
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(SyncError::Serialization)
    }

    pub fn decode(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(SyncError::Serialization)
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientEvent({})", self.name())
    }
}

/// Events the server pushes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Full list of connected identities, replaces any previous list
    #[serde(rename = "users:online")]
    UsersOnline(Vec<String>),

    #[serde(rename = "message:receive")]
    MessageReceive(Message),

    #[serde(rename = "message:read:confirm")]
    MessageReadConfirm(ReadConfirm),

    #[serde(rename = "message:deleted")]
    MessageDeleted(MessageRemoval),

    #[serde(rename = "message:react")]
    MessageReact(ReactionUpdate),

    #[serde(rename = "chat:cleared")]
    ChatCleared(ChatCleared),

    #[serde(rename = "typing:start")]
    TypingStart(TypingSignal),

    #[serde(rename = "typing:stop")]
    TypingStop(TypingSignal),

    #[serde(rename = "typing:status")]
    TypingStatus(TypingStatus),

    #[serde(rename = "user:updated")]
    UserUpdated(UserProfile),

    #[serde(rename = "post:updated")]
    PostUpdated(Post),

    #[serde(rename = "notification:new")]
    NotificationNew(Notification),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::UsersOnline(_) => "users:online",
            ServerEvent::MessageReceive(_) => "message:receive",
            ServerEvent::MessageReadConfirm(_) => "message:read:confirm",
            ServerEvent::MessageDeleted(_) => "message:deleted",
            ServerEvent::MessageReact(_) => "message:react",
            ServerEvent::ChatCleared(_) => "chat:cleared",
            ServerEvent::TypingStart(_) => "typing:start",
            ServerEvent::TypingStop(_) => "typing:stop",
            ServerEvent::TypingStatus(_) => "typing:status",
            ServerEvent::UserUpdated(_) => "user:updated",
            ServerEvent::PostUpdated(_) => "post:updated",
            ServerEvent::NotificationNew(_) => "notification:new",
        }
    }

    /// Conversation the event belongs to, when it names one
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            ServerEvent::MessageReceive(m) => Some(&m.conversation_id),
            ServerEvent::MessageReadConfirm(c) => Some(&c.conversation_id),
            ServerEvent::MessageDeleted(d) => Some(&d.conversation_id),
            ServerEvent::MessageReact(r) => Some(&r.conversation_id),
            ServerEvent::ChatCleared(c) => Some(&c.conversation_id),
            ServerEvent::TypingStart(t) | ServerEvent::TypingStop(t) => t.conversation_id.as_ref(),
            ServerEvent::TypingStatus(t) => t.conversation_id.as_ref(),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(SyncError::Serialization)
    }

    /// Parse a text frame
    pub fn decode(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| {
            let name = peek_event_name(frame).unwrap_or_else(|| "<unnamed>".to_string());
            SyncError::Protocol(format!("Unreadable '{}' frame: {}", name, e))
        })
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerEvent({})", self.name())
    }
}

/// Best-effort read of the event name, for logging frames we can't decode
pub fn peek_event_name(frame: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(frame).ok()?;
    value.get("event")?.as_str().map(str::to_string)
}
