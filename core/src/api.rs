/// REST collaborator: persistence for everything the live protocol announces
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::models::{ConversationId, ConversationSummary, Message, Notification, UserProfile};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Body of `POST /messages`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    pub receiver_id: String,
    pub content: String,
    /// URLs of already-uploaded attachments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

impl MessageDraft {
    pub fn text(receiver_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            receiver_id: receiver_id.into(),
            content: content.into(),
            attachments: Vec::new(),
        }
    }
}

/// Request/response contract of the REST API the core calls into
#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>>;

    async fn fetch_history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;

    /// Persist a message; the server assigns id and timestamp
    async fn send_message(&self, draft: &MessageDraft) -> Result<Message>;

    /// Mark a conversation read. Returns the peer whose messages were read,
    /// if there were any.
    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<Option<String>>;

    async fn delete_message(&self, message_id: &str) -> Result<()>;

    /// Add a reaction; returns the message with server-computed reactions
    async fn react(&self, message_id: &str, emoji: &str) -> Result<Message>;

    /// Remove the caller's reaction
    async fn unreact(&self, message_id: &str) -> Result<Message>;

    async fn clear_conversation(&self, conversation_id: &ConversationId) -> Result<()>;

    async fn fetch_user(&self, user_id: &str) -> Result<UserProfile>;

    async fn fetch_notifications(&self) -> Result<Vec<Notification>>;

    async fn mark_notification_read(&self, notification_id: &str) -> Result<()>;

    async fn mark_all_notifications_read(&self) -> Result<()>;

    async fn delete_notification(&self, notification_id: &str) -> Result<()>;

    async fn clear_notifications(&self) -> Result<()>;
}

#[derive(Deserialize)]
struct HistoryBody {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadBody {
    #[serde(default)]
    sender_id: Option<String>,
}

#[derive(Deserialize)]
struct UserBody {
    user: UserProfile,
}

/// `GET /notifications` answers either wrapped or as a bare list
#[derive(Deserialize)]
#[serde(untagged)]
enum NotificationsBody {
    Wrapped { notifications: Vec<Notification> },
    Bare(Vec<Notification>),
}

#[derive(Serialize)]
struct ReactBody<'a> {
    emoji: &'a str,
}

/// HTTP implementation of [`ChatApi`]
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpApi {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.auth_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn accepted(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Api {
                status: status.as_u16(),
                message: rejection_message(&body, status.canonical_reason()),
            });
        }
        Ok(response)
    }

    async fn call<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.accepted(builder).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Same as `call` for endpoints whose acknowledgement body is not needed
    async fn call_empty(&self, builder: RequestBuilder) -> Result<()> {
        self.accepted(builder).await.map(|_| ())
    }
}

/// Human-readable reason from a rejected request (`{"message": ..}` bodies)
fn rejection_message(body: &str, fallback: Option<&str>) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message")?.as_str().map(str::to_string))
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| fallback.unwrap_or("request rejected").to_string())
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.call(self.request(Method::GET, "/messages/chats")).await
    }

    async fn fetch_history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let body: HistoryBody = self
            .call(self.request(Method::GET, &format!("/messages/{}", conversation_id)))
            .await?;
        Ok(body.messages)
    }

    async fn send_message(&self, draft: &MessageDraft) -> Result<Message> {
        self.call(self.request(Method::POST, "/messages").json(draft))
            .await
    }

    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<Option<String>> {
        let body: ReadBody = self
            .call(self.request(Method::PUT, &format!("/messages/{}/read", conversation_id)))
            .await?;
        Ok(body.sender_id)
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        self.call_empty(self.request(Method::DELETE, &format!("/messages/{}", message_id)))
            .await
    }

    async fn react(&self, message_id: &str, emoji: &str) -> Result<Message> {
        self.call(
            self.request(Method::POST, &format!("/messages/{}/react", message_id))
                .json(&ReactBody { emoji }),
        )
        .await
    }

    async fn unreact(&self, message_id: &str) -> Result<Message> {
        self.call(self.request(Method::DELETE, &format!("/messages/{}/react", message_id)))
            .await
    }

    async fn clear_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        self.call_empty(self.request(Method::DELETE, &format!("/messages/{}/clear", conversation_id)))
            .await
    }

    async fn fetch_user(&self, user_id: &str) -> Result<UserProfile> {
        let body: UserBody = self
            .call(self.request(Method::GET, &format!("/users/{}", user_id)))
            .await?;
        Ok(body.user)
    }

    async fn fetch_notifications(&self) -> Result<Vec<Notification>> {
        let body: NotificationsBody = self.call(self.request(Method::GET, "/notifications")).await?;
        Ok(match body {
            NotificationsBody::Wrapped { notifications } => notifications,
            NotificationsBody::Bare(notifications) => notifications,
        })
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        self.call_empty(self.request(Method::PUT, &format!("/notifications/{}/read", notification_id)))
            .await
    }

    async fn mark_all_notifications_read(&self) -> Result<()> {
        self.call_empty(self.request(Method::PUT, "/notifications/mark-all-read"))
            .await
    }

    async fn delete_notification(&self, notification_id: &str) -> Result<()> {
        self.call_empty(self.request(Method::DELETE, &format!("/notifications/{}", notification_id)))
            .await
    }

    async fn clear_notifications(&self) -> Result<()> {
        self.call_empty(self.request(Method::DELETE, "/notifications/clear-all"))
            .await
    }
}
