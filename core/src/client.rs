/// Chat client: every sync component wired over one connection
///
/// The rendering layer talks to [`ChatClient`] only. It reads snapshots and
/// listens to [`SyncUpdate`]s; it never touches the transport directly.
use crate::api::{ChatApi, HttpApi, MessageDraft};
use crate::config::Config;
use crate::conversation::{ConversationView, Effect, LoadPhase, Reconciler};
use crate::error::{Result, SyncError};
use crate::models::{ConversationId, ConversationSummary, Message, Notification, Post, UserProfile};
use crate::notifications::{NotificationCenter, PostFeed};
use crate::presence::{resolve_profiles, PresenceTracker};
use crate::protocol::{
    ChatCleared, ClientEvent, MessageAnnounce, MessageRemoval, ReactionUpdate, ReadAnnounce,
    ServerEvent, TypingAnnounce,
};
use crate::realtime::{
    ConnectionId, ConnectionManager, ConnectionState, Event, EventKind, Subscription,
};
use crate::typing::{TypingChange, TypingDebouncer, TypingTracker};
use crate::utils::{lock, with_timeout};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const UPDATE_BUFFER: usize = 256;

/// What changed, for the rendering layer to re-read
#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    ConnectionChanged(ConnectionState),
    ConversationChanged(ConversationId),
    PresenceChanged { online: Vec<String> },
    TypingChanged(TypingChange),
    NotificationsChanged { unread: usize, chat_unread: u32 },
    PostUpdated(Post),
    ProfileUpdated(UserProfile),
    /// Recoverable, user-facing problem (a rejected action, a lost link)
    Notice(String),
}

struct ClientInner {
    config: Config,
    connection: ConnectionManager,
    api: Arc<dyn ChatApi>,
    identity: Mutex<Option<String>>,
    /// Open conversation and the peer on the other side
    target: Mutex<Option<(ConversationId, String)>>,
    reconciler: Mutex<Reconciler>,
    presence: Mutex<PresenceTracker>,
    typing_in: Mutex<TypingTracker>,
    typing_out: TypingDebouncer,
    notifications: NotificationCenter,
    posts: Mutex<PostFeed>,
    /// Conversations with a mark-read in flight, flagged when another
    /// acknowledgement was asked for meanwhile
    acking: Mutex<HashMap<ConversationId, bool>>,
    updates: broadcast::Sender<SyncUpdate>,
    subscriptions: Mutex<Vec<Subscription>>,
    state_watch: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

impl ChatClient {
    /// Build a client over an existing connection manager
    pub fn new(config: Config, connection: ConnectionManager, api: Arc<dyn ChatApi>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let typing_out = TypingDebouncer::new(connection.clone(), config.typing_debounce);
        let notifications = NotificationCenter::new(api.clone(), config.request_timeout);
        let typing_in = TypingTracker::new(None, config.typing_expiry);
        Self {
            inner: Arc::new(ClientInner {
                config,
                connection,
                api,
                identity: Mutex::new(None),
                target: Mutex::new(None),
                reconciler: Mutex::new(Reconciler::new(None)),
                presence: Mutex::new(PresenceTracker::new(None)),
                typing_in: Mutex::new(typing_in),
                typing_out,
                notifications,
                posts: Mutex::new(PostFeed::new()),
                acking: Mutex::new(HashMap::new()),
                updates,
                subscriptions: Mutex::new(Vec::new()),
                state_watch: Mutex::new(None),
            }),
        }
    }

    /// WebSocket transport plus HTTP REST client, both from `config`
    pub fn from_config(config: Config) -> Result<Self> {
        let api = Arc::new(HttpApi::new(&config)?);
        let connection = ConnectionManager::with_websocket(config.clone());
        Ok(Self::new(config, connection, api))
    }

    /// Subscribe to live events and connect as `identity`.
    ///
    /// Safe to call again (after `stop`, or with another identity).
    pub fn start(&self, identity: &str) -> ConnectionId {
        let inner = &self.inner;
        let identity = identity.to_string();
        *lock(&inner.identity) = Some(identity.clone());
        lock(&inner.reconciler).set_local_identity(Some(identity.clone()));
        lock(&inner.presence).set_local_identity(Some(identity.clone()));
        lock(&inner.typing_in).set_local_identity(Some(identity.clone()));

        ClientInner::subscribe(inner);
        ClientInner::watch_connection(inner);

        let id = inner.connection.connect(Some(&identity));
        info!("Chat client started as {} on connection {}", identity, id);
        id
    }

    /// Close the transport but keep every subscription, so `start` or a
    /// plain reconnect picks up where it left off
    pub fn stop(&self) {
        self.inner.typing_out.flush();
        self.inner.connection.disconnect();
    }

    /// Application teardown: unsubscribe and discard the transport
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.typing_out.cancel();
        let subscriptions: Vec<Subscription> = lock(&inner.subscriptions).drain(..).collect();
        for subscription in &subscriptions {
            inner.connection.off(subscription);
        }
        if let Some(handle) = lock(&inner.state_watch).take() {
            handle.abort();
        }
        inner.connection.force_destroy();
        info!("Chat client shut down");
    }

    pub fn updates(&self) -> broadcast::Receiver<SyncUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn identity(&self) -> Option<String> {
        lock(&self.inner.identity).clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.inner
            .persist("Loading conversations", self.inner.api.fetch_conversations())
            .await
    }

    /// Open the conversation with `peer` and load its history.
    ///
    /// Returns `None` if another conversation was opened before the history
    /// arrived.
    pub async fn open_conversation(&self, peer: &str) -> Result<Option<ConversationView>> {
        let inner = &self.inner;
        let me = self.identity().ok_or(SyncError::NotConnected)?;
        let conversation_id = ConversationId::between(&me, peer);

        let previous = lock(&inner.target).replace((conversation_id.clone(), peer.to_string()));
        if previous.is_some_and(|(id, _)| id != conversation_id) {
            inner.typing_out.flush();
        }
        let ticket = lock(&inner.reconciler).open(conversation_id.clone());
        inner.notifications.reset_chat_unread(&conversation_id);
        inner.publish_notifications();

        let history = with_timeout(
            inner.config.request_timeout,
            "history fetch",
            inner.api.fetch_history(&conversation_id),
        )
        .await;

        match history {
            Ok(messages) => {
                let count = messages.len();
                let effects = lock(&inner.reconciler).apply_history(&ticket, messages);
                let Some(effects) = effects else {
                    return Ok(None);
                };
                info!("Loaded {} messages for {}", count, conversation_id);
                inner.publish(SyncUpdate::ConversationChanged(conversation_id.clone()));
                for effect in effects {
                    inner.run_effect(effect).await;
                }
                Ok(lock(&inner.reconciler).view(&conversation_id).cloned())
            }
            Err(e) => {
                if lock(&inner.reconciler).fail_history(&ticket, &e.to_string()) {
                    inner.publish(SyncUpdate::ConversationChanged(conversation_id));
                    inner.publish(SyncUpdate::Notice(format!("Could not load messages: {}", e)));
                }
                Err(e)
            }
        }
    }

    pub fn close_conversation(&self) {
        self.inner.typing_out.flush();
        lock(&self.inner.target).take();
        lock(&self.inner.reconciler).close();
    }

    /// Persist, show, then announce. A rejected send changes nothing.
    pub async fn send_message(&self, content: &str) -> Result<Message> {
        self.send_draft(content, Vec::new()).await
    }

    pub async fn send_with_attachments(&self, content: &str, attachments: Vec<String>) -> Result<Message> {
        self.send_draft(content, attachments).await
    }

    async fn send_draft(&self, content: &str, attachments: Vec<String>) -> Result<Message> {
        let inner = &self.inner;
        let (conversation_id, peer) = inner.target()?;
        let draft = MessageDraft {
            receiver_id: peer.clone(),
            content: content.to_string(),
            attachments,
        };
        let message = inner
            .persist("Sending message", inner.api.send_message(&draft))
            .await?;

        lock(&inner.reconciler).record_sent(message.clone());
        inner.publish(SyncUpdate::ConversationChanged(conversation_id.clone()));

        inner.announce(ClientEvent::MessageSend(MessageAnnounce {
            conversation_id: conversation_id.clone(),
            receiver_id: peer.clone(),
            message: message.clone(),
        }));
        inner.typing_out.cancel();
        inner.announce(ClientEvent::TypingStop(TypingAnnounce {
            conversation_id,
            receiver_id: peer,
        }));
        Ok(message)
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        let inner = &self.inner;
        let (conversation_id, peer) = inner.target()?;
        inner
            .persist("Deleting message", inner.api.delete_message(message_id))
            .await?;

        lock(&inner.reconciler).record_deleted(&conversation_id, message_id);
        inner.publish(SyncUpdate::ConversationChanged(conversation_id.clone()));
        inner.announce(ClientEvent::MessageDelete(MessageRemoval {
            conversation_id,
            message_id: message_id.to_string(),
            receiver_id: Some(peer),
        }));
        Ok(())
    }

    pub async fn react(&self, message_id: &str, emoji: &str) -> Result<Message> {
        let inner = &self.inner;
        let target = inner.target()?;
        let message = inner
            .persist("Adding reaction", inner.api.react(message_id, emoji))
            .await?;
        inner.reaction_applied(target, message.clone());
        Ok(message)
    }

    pub async fn unreact(&self, message_id: &str) -> Result<Message> {
        let inner = &self.inner;
        let target = inner.target()?;
        let message = inner
            .persist("Removing reaction", inner.api.unreact(message_id))
            .await?;
        inner.reaction_applied(target, message.clone());
        Ok(message)
    }

    pub async fn clear_conversation(&self) -> Result<()> {
        let inner = &self.inner;
        let (conversation_id, peer) = inner.target()?;
        inner
            .persist("Clearing chat", inner.api.clear_conversation(&conversation_id))
            .await?;

        lock(&inner.reconciler).record_cleared(&conversation_id);
        inner.publish(SyncUpdate::ConversationChanged(conversation_id.clone()));
        inner.announce(ClientEvent::ChatCleared(ChatCleared {
            conversation_id,
            receiver_id: Some(peer),
        }));
        Ok(())
    }

    /// The user typed into the composer of the open conversation
    pub fn keystroke(&self) -> Result<()> {
        let (conversation_id, receiver_id) = self.inner.target()?;
        self.inner.typing_out.keystroke(TypingAnnounce {
            conversation_id,
            receiver_id,
        });
        Ok(())
    }

    pub async fn load_notifications(&self) -> Result<usize> {
        let loaded = self.inner.notifications.load().await;
        self.inner.after_notification_call(loaded)
    }

    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        let done = self.inner.notifications.mark_read(notification_id).await;
        self.inner.after_notification_call(done)
    }

    pub async fn mark_all_notifications_read(&self) -> Result<()> {
        let done = self.inner.notifications.mark_all_read().await;
        self.inner.after_notification_call(done)
    }

    pub async fn delete_notification(&self, notification_id: &str) -> Result<()> {
        let done = self.inner.notifications.remove(notification_id).await;
        self.inner.after_notification_call(done)
    }

    pub async fn clear_notifications(&self) -> Result<()> {
        let done = self.inner.notifications.clear_all().await;
        self.inner.after_notification_call(done)
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        lock(&self.inner.reconciler).active().cloned()
    }

    pub fn active_view(&self) -> Option<ConversationView> {
        lock(&self.inner.reconciler).active_view().cloned()
    }

    pub fn view(&self, conversation_id: &ConversationId) -> Option<ConversationView> {
        lock(&self.inner.reconciler).view(conversation_id).cloned()
    }

    pub fn phase(&self, conversation_id: &ConversationId) -> LoadPhase {
        lock(&self.inner.reconciler).phase(conversation_id)
    }

    pub fn online(&self) -> Vec<String> {
        lock(&self.inner.presence).online()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        lock(&self.inner.presence).is_online(user_id)
    }

    pub fn online_profiles(&self) -> Vec<UserProfile> {
        lock(&self.inner.presence).online_profiles()
    }

    pub fn profile(&self, user_id: &str) -> Option<UserProfile> {
        lock(&self.inner.presence).profile(user_id).cloned()
    }

    /// Peers typing in the open conversation
    pub fn typing(&self) -> Vec<String> {
        match self.active_conversation() {
            Some(id) => lock(&self.inner.typing_in).typing_in(&id),
            None => Vec::new(),
        }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.notifications.notifications()
    }

    pub fn unread_notifications(&self) -> usize {
        self.inner.notifications.unread_count()
    }

    pub fn chat_unread(&self) -> u32 {
        self.inner.notifications.chat_unread_total()
    }

    pub fn track_post(&self, post: Post) {
        lock(&self.inner.posts).track(post);
    }

    pub fn post(&self, post_id: &str) -> Option<Post> {
        lock(&self.inner.posts).get(post_id).cloned()
    }
}

impl ClientInner {
    fn publish(&self, update: SyncUpdate) {
        // No receivers is fine
        let _ = self.updates.send(update);
    }

    fn publish_notifications(&self) {
        self.publish(SyncUpdate::NotificationsChanged {
            unread: self.notifications.unread_count(),
            chat_unread: self.notifications.chat_unread_total(),
        });
    }

    fn after_notification_call<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.publish_notifications(),
            Err(e) => {
                warn!("Notification request failed: {}", e);
                self.publish(SyncUpdate::Notice(format!("Notification request failed: {}", e)));
            }
        }
        result
    }

    fn target(&self) -> Result<(ConversationId, String)> {
        lock(&self.target).clone().ok_or(SyncError::NoActiveConversation)
    }

    /// Bounded REST call; a failure becomes a notice as well as an error
    async fn persist<T, F>(&self, what: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match with_timeout(self.config.request_timeout, what, call).await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("{} failed: {}", what, e);
                self.publish(SyncUpdate::Notice(format!("{} failed: {}", what, e)));
                Err(e)
            }
        }
    }

    /// Live fan-out of an already persisted action
    fn announce(&self, event: ClientEvent) {
        let name = event.name();
        if let Err(e) = self.connection.emit(event) {
            warn!("Could not announce {}: {}", name, e);
            self.publish(SyncUpdate::Notice(format!("Could not announce {}: {}", name, e)));
        }
    }

    fn reaction_applied(&self, (conversation_id, peer): (ConversationId, String), message: Message) {
        lock(&self.reconciler).record_reaction(message.clone());
        self.publish(SyncUpdate::ConversationChanged(conversation_id.clone()));
        self.announce(ClientEvent::MessageReact(ReactionUpdate {
            conversation_id,
            receiver_id: Some(peer),
            message,
        }));
    }

    fn subscribe(inner: &Arc<Self>) {
        let mut subscriptions = lock(&inner.subscriptions);
        if !subscriptions.is_empty() {
            return;
        }
        for kind in EventKind::ALL {
            let weak: Weak<Self> = Arc::downgrade(inner);
            subscriptions.push(inner.connection.on(kind, move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_event(event);
                }
            }));
        }
        debug!("Chat client subscribed to {} events", subscriptions.len());
    }

    fn watch_connection(inner: &Arc<Self>) {
        let mut slot = lock(&inner.state_watch);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let mut states = inner.connection.watch_state();
        let weak = Arc::downgrade(inner);
        *slot = Some(tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                debug!("Connection state: {:?}", state);
                inner.publish(SyncUpdate::ConnectionChanged(state));
            }
        }));
    }

    fn on_event(self: &Arc<Self>, event: &Event) {
        match event {
            Event::ReconnectFailed => {
                self.publish(SyncUpdate::Notice(
                    "Lost connection to the chat server".to_string(),
                ));
            }
            Event::Server(server) => self.on_server_event(server),
            _ => {}
        }
    }

    fn on_server_event(self: &Arc<Self>, event: &ServerEvent) {
        match event {
            ServerEvent::UsersOnline(ids) => {
                let (online, unknown) = {
                    let mut presence = lock(&self.presence);
                    let unknown = presence.apply_broadcast(ids);
                    (presence.online(), unknown)
                };
                self.publish(SyncUpdate::PresenceChanged { online });
                if !unknown.is_empty() {
                    let inner = self.clone();
                    tokio::spawn(async move { inner.resolve_presence(unknown).await });
                }
            }
            ServerEvent::MessageReceive(_)
            | ServerEvent::MessageReadConfirm(_)
            | ServerEvent::MessageDeleted(_)
            | ServerEvent::MessageReact(_)
            | ServerEvent::ChatCleared(_) => {
                if let ServerEvent::MessageReceive(message) = event {
                    self.peer_stopped_typing(&message.conversation_id, &message.sender_id);
                }
                let effects = lock(&self.reconciler).apply(event);
                if let Some(conversation_id) = event.conversation_id() {
                    if lock(&self.reconciler).view(conversation_id).is_some() {
                        self.publish(SyncUpdate::ConversationChanged(conversation_id.clone()));
                    }
                }
                for effect in effects {
                    let inner = self.clone();
                    tokio::spawn(async move { inner.run_effect(effect).await });
                }
            }
            ServerEvent::TypingStart(_) | ServerEvent::TypingStop(_) | ServerEvent::TypingStatus(_) => {
                // Renewals change nothing visible but still move a deadline
                let (change, sweep) = {
                    let mut tracker = lock(&self.typing_in);
                    let change = tracker.apply(event);
                    (change, tracker.claim_sweep())
                };
                if let Some(change) = change {
                    self.publish(SyncUpdate::TypingChanged(change));
                }
                if sweep {
                    self.sweep_typing();
                }
            }
            ServerEvent::UserUpdated(patch) => {
                let profile = {
                    let mut presence = lock(&self.presence);
                    presence.apply_profile_update(patch);
                    presence.profile(&patch.id).cloned()
                };
                if let Some(profile) = profile {
                    self.publish(SyncUpdate::ProfileUpdated(profile));
                }
            }
            ServerEvent::PostUpdated(_) => {
                let post = lock(&self.posts).apply(event);
                if let Some(post) = post {
                    self.publish(SyncUpdate::PostUpdated(post));
                }
            }
            ServerEvent::NotificationNew(_) => {
                if self.notifications.apply(event) {
                    self.publish_notifications();
                }
            }
        }
    }

    fn peer_stopped_typing(&self, conversation_id: &ConversationId, user_id: &str) {
        if lock(&self.typing_in).stop(conversation_id, user_id) {
            self.publish(SyncUpdate::TypingChanged(TypingChange {
                conversation_id: conversation_id.clone(),
                user_id: user_id.to_string(),
                is_typing: false,
            }));
        }
    }

    /// Expire indicators as their deadlines pass, sleeping until the
    /// earliest one each round. Ends once nothing is showing.
    fn sweep_typing(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let next = lock(&inner.typing_in).next_deadline();
                    next
                };
                let Some(deadline) = deadline else {
                    return;
                };
                tokio::time::sleep_until(deadline).await;

                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let lapsed = lock(&inner.typing_in).expire();
                for change in lapsed {
                    debug!("Typing indicator for {} lapsed", change.user_id);
                    inner.publish(SyncUpdate::TypingChanged(change));
                }
            }
        });
    }

    async fn resolve_presence(&self, ids: Vec<String>) {
        let profiles = resolve_profiles(self.api.as_ref(), &ids, self.config.request_timeout).await;
        if profiles.is_empty() {
            return;
        }
        let online = {
            let mut presence = lock(&self.presence);
            for profile in profiles {
                presence.insert_profile(profile);
            }
            presence.online()
        };
        self.publish(SyncUpdate::PresenceChanged { online });
    }

    async fn run_effect(&self, effect: Effect) {
        match effect {
            Effect::AcknowledgeRead { conversation_id } => self.acknowledge_read(conversation_id).await,
            Effect::CountUnread { conversation_id } => {
                debug!("Unread message in {}", conversation_id);
                self.notifications.count_chat_message(&conversation_id);
                self.publish_notifications();
            }
        }
    }

    /// Mark read over REST, then tell the sender. One request per
    /// conversation at a time; asks that arrive meanwhile are folded into
    /// one more round, and the view is only marked read after the last one.
    async fn acknowledge_read(&self, conversation_id: ConversationId) {
        {
            let mut acking = lock(&self.acking);
            if let Some(again) = acking.get_mut(&conversation_id) {
                *again = true;
                return;
            }
            acking.insert(conversation_id.clone(), false);
        }

        let mut sender = None;
        let mut failure = None;
        loop {
            let result = with_timeout(
                self.config.request_timeout,
                "mark read",
                self.api.mark_read(&conversation_id),
            )
            .await;
            match result {
                Ok(found) => {
                    sender = found.or(sender);
                    failure = None;
                }
                Err(e) => failure = Some(e),
            }

            let mut acking = lock(&self.acking);
            match acking.get_mut(&conversation_id) {
                Some(again) if *again => {
                    debug!("Messages arrived in {} while marking read, marking again", conversation_id);
                    *again = false;
                }
                _ => {
                    acking.remove(&conversation_id);
                    if failure.is_none() {
                        lock(&self.reconciler).record_read(&conversation_id);
                    }
                    break;
                }
            }
        }

        if let Some(e) = failure {
            warn!("Failed to mark {} read: {}", conversation_id, e);
            return;
        }
        self.publish(SyncUpdate::ConversationChanged(conversation_id.clone()));
        if let Some(sender_id) = sender {
            self.announce(ClientEvent::MessageRead(ReadAnnounce {
                conversation_id,
                sender_id,
            }));
        }
    }
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("identity", &self.identity())
            .field("connection", &self.inner.connection)
            .finish()
    }
}
