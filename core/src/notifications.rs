/// Live notification inbox, chat unread badge and the live post cache
use crate::api::ChatApi;
use crate::error::Result;
use crate::models::{ConversationId, Notification, Post};
use crate::protocol::ServerEvent;
use crate::utils::{lock, with_timeout};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Inbox {
    notifications: Vec<Notification>,
    unread: usize,
    chat_unread: HashMap<ConversationId, u32>,
}

impl Inbox {
    fn recount(&mut self) {
        self.unread = self.notifications.iter().filter(|n| !n.read).count();
    }
}

/// Notifications, newest first.
///
/// Mutations go through REST first; the local list only changes once the
/// server accepted them.
pub struct NotificationCenter {
    api: Arc<dyn ChatApi>,
    request_timeout: Duration,
    inbox: Mutex<Inbox>,
}

impl NotificationCenter {
    pub fn new(api: Arc<dyn ChatApi>, request_timeout: Duration) -> Self {
        Self {
            api,
            request_timeout,
            inbox: Mutex::new(Inbox::default()),
        }
    }

    /// Fold a `notification:new` push in. Returns false for anything else
    /// and for ids already listed.
    pub fn apply(&self, event: &ServerEvent) -> bool {
        let ServerEvent::NotificationNew(notification) = event else {
            return false;
        };
        let mut inbox = lock(&self.inbox);
        if inbox.notifications.iter().any(|n| n.id == notification.id) {
            return false;
        }
        inbox.notifications.insert(0, notification.clone());
        if !notification.read {
            inbox.unread += 1;
        }
        true
    }

    pub async fn load(&self) -> Result<usize> {
        let notifications = with_timeout(
            self.request_timeout,
            "notification fetch",
            self.api.fetch_notifications(),
        )
        .await?;
        let mut inbox = lock(&self.inbox);
        inbox.notifications = notifications;
        inbox.recount();
        info!(
            "Loaded {} notifications ({} unread)",
            inbox.notifications.len(),
            inbox.unread
        );
        Ok(inbox.notifications.len())
    }

    pub async fn mark_read(&self, notification_id: &str) -> Result<()> {
        with_timeout(
            self.request_timeout,
            "mark notification read",
            self.api.mark_notification_read(notification_id),
        )
        .await?;
        let mut inbox = lock(&self.inbox);
        if let Some(n) = inbox
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id && !n.read)
        {
            n.read = true;
            inbox.unread = inbox.unread.saturating_sub(1);
        }
        Ok(())
    }

    pub async fn mark_all_read(&self) -> Result<()> {
        with_timeout(
            self.request_timeout,
            "mark all notifications read",
            self.api.mark_all_notifications_read(),
        )
        .await?;
        let mut inbox = lock(&self.inbox);
        for n in inbox.notifications.iter_mut() {
            n.read = true;
        }
        inbox.unread = 0;
        Ok(())
    }

    pub async fn remove(&self, notification_id: &str) -> Result<()> {
        with_timeout(
            self.request_timeout,
            "delete notification",
            self.api.delete_notification(notification_id),
        )
        .await?;
        let mut inbox = lock(&self.inbox);
        inbox.notifications.retain(|n| n.id != notification_id);
        inbox.recount();
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<()> {
        with_timeout(
            self.request_timeout,
            "clear notifications",
            self.api.clear_notifications(),
        )
        .await?;
        let mut inbox = lock(&self.inbox);
        inbox.notifications.clear();
        inbox.unread = 0;
        Ok(())
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.inbox).notifications.clone()
    }

    pub fn unread_count(&self) -> usize {
        lock(&self.inbox).unread
    }

    /// A message arrived for a conversation that is not open
    pub fn count_chat_message(&self, conversation_id: &ConversationId) {
        let mut inbox = lock(&self.inbox);
        *inbox.chat_unread.entry(conversation_id.clone()).or_default() += 1;
    }

    pub fn reset_chat_unread(&self, conversation_id: &ConversationId) {
        lock(&self.inbox).chat_unread.remove(conversation_id);
    }

    pub fn chat_unread(&self, conversation_id: &ConversationId) -> u32 {
        lock(&self.inbox)
            .chat_unread
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn chat_unread_total(&self) -> u32 {
        lock(&self.inbox).chat_unread.values().sum()
    }
}

/// Posts the user is looking at, kept fresh by `post:updated`
#[derive(Debug, Default)]
pub struct PostFeed {
    posts: HashMap<String, Post>,
}

impl PostFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, post: Post) {
        self.posts.insert(post.id.clone(), post);
    }

    pub fn untrack(&mut self, post_id: &str) -> Option<Post> {
        self.posts.remove(post_id)
    }

    /// Merge a `post:updated` push. Returns the post as it now stands.
    pub fn apply(&mut self, event: &ServerEvent) -> Option<Post> {
        let ServerEvent::PostUpdated(update) = event else {
            return None;
        };
        let post = self
            .posts
            .entry(update.id.clone())
            .and_modify(|post| post.merge(update))
            .or_insert_with(|| update.clone());
        debug!("Post {} updated", post.id);
        Some(post.clone())
    }

    pub fn get(&self, post_id: &str) -> Option<&Post> {
        self.posts.get(post_id)
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }
}
