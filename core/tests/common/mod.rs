#![allow(dead_code)]
/// Shared fakes for the integration tests: an in-process transport and an
/// in-memory REST collaborator
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use helplink_core::api::{ChatApi, MessageDraft};
use helplink_core::config::Config;
use helplink_core::models::{
    ConversationId, ConversationSummary, Message, Notification, Reaction, UserProfile,
};
use helplink_core::protocol::{ClientEvent, ServerEvent};
use helplink_core::realtime::{ConnectionManager, ConnectionState, Connector, Link, PendingWrite};
use helplink_core::{Result, SyncError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// Fast reconnects, no jitter
pub fn test_config() -> Config {
    Config {
        reconnection_attempts: 3,
        reconnection_delay: Duration::from_millis(10),
        reconnection_delay_max: Duration::from_millis(40),
        randomization_factor: 0.0,
        connect_timeout: Duration::from_secs(1),
        request_timeout: Duration::from_secs(2),
        typing_debounce: Duration::from_secs(1),
        typing_expiry: Duration::from_secs(5),
        ..Config::default()
    }
}

/// Server side of one loopback transport
pub struct Remote {
    to_client: mpsc::Sender<String>,
    from_client: mpsc::Receiver<String>,
}

impl Remote {
    pub async fn push(&self, event: &ServerEvent) {
        self.to_client.send(event.encode().unwrap()).await.unwrap();
    }

    pub async fn push_raw(&self, frame: &str) {
        self.to_client.send(frame.to_string()).await.unwrap();
    }

    /// Next frame the client wrote, or `None` once it closed the transport
    pub async fn next_frame(&mut self) -> Option<String> {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("no frame from client")
    }

    pub async fn next_event(&mut self) -> ClientEvent {
        let frame = self.next_frame().await.expect("transport closed");
        ClientEvent::decode(&frame).unwrap()
    }

    pub async fn next_names(&mut self, count: usize) -> Vec<&'static str> {
        let mut names = Vec::new();
        for _ in 0..count {
            names.push(self.next_event().await.name());
        }
        names
    }

    /// Hand both directions to a relay: (to client, from client)
    pub fn split(self) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        (self.to_client, self.from_client)
    }

    /// Whatever arrives within `within`; `None` if nothing does
    pub async fn try_next_event(&mut self, within: Duration) -> Option<ClientEvent> {
        match timeout(within, self.from_client.recv()).await {
            Ok(Some(frame)) => Some(ClientEvent::decode(&frame).unwrap()),
            _ => None,
        }
    }
}

/// Channel-backed [`Connector`]. Every successful open hands the server
/// side of the link to the test.
pub struct LoopbackConnector {
    remotes: mpsc::UnboundedSender<Remote>,
    opens: AtomicU32,
    fail_next: AtomicU32,
    refuse: AtomicBool,
    sever: Arc<AtomicBool>,
}

pub struct Remotes(mpsc::UnboundedReceiver<Remote>);

impl Remotes {
    pub async fn accept(&mut self) -> Remote {
        timeout(WAIT, self.0.recv())
            .await
            .expect("client never connected")
            .expect("connector dropped")
    }

    /// Next link without a deadline; `None` once the connector is gone
    pub async fn next(&mut self) -> Option<Remote> {
        self.0.recv().await
    }
}

impl LoopbackConnector {
    pub fn new() -> (Arc<Self>, Remotes) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            remotes: tx,
            opens: AtomicU32::new(0),
            fail_next: AtomicU32::new(0),
            refuse: AtomicBool::new(false),
            sever: Arc::new(AtomicBool::new(false)),
        });
        (connector, Remotes(rx))
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Fail the next frame written on the open link and kill that link,
    /// like a socket dying mid-write
    pub fn sever_next_write(&self) {
        self.sever.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self, _url: &str) -> Result<Link> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::Connection("refused".to_string()));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::Connection("unreachable".to_string()));
        }

        let (write_tx, mut write_rx) = mpsc::channel::<PendingWrite>(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let sever = self.sever.clone();
        tokio::spawn(async move {
            while let Some(write) = write_rx.recv().await {
                if sever.swap(false, Ordering::SeqCst) {
                    write.complete(Err(SyncError::Connection("write failed".to_string())));
                    break;
                }
                let delivered = out_tx.send(write.frame.clone()).await;
                write.complete(delivered.map_err(|_| SyncError::Connection("remote gone".to_string())));
            }
        });
        let _ = self.remotes.send(Remote {
            to_client: in_tx,
            from_client: out_rx,
        });
        Ok(Link::new(write_tx, in_rx))
    }
}

pub fn loopback_manager(config: Config) -> (ConnectionManager, Arc<LoopbackConnector>, Remotes) {
    let (connector, remotes) = LoopbackConnector::new();
    let manager = ConnectionManager::new(config, connector.clone());
    (manager, connector, remotes)
}

pub async fn wait_for_state(manager: &ConnectionManager, want: ConnectionState) {
    let mut states = manager.watch_state();
    timeout(WAIT, async {
        loop {
            if *states.borrow_and_update() == want {
                return;
            }
            if states.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("connection never reached {:?}", want));
}

/// Poll `check` until it holds
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let waited = timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

pub fn message(id: &str, conversation: &ConversationId, sender: &str, minute: u32) -> Message {
    let receiver = conversation.peer_of(sender).unwrap_or_default().to_string();
    Message {
        id: id.to_string(),
        sender_id: sender.to_string(),
        receiver_id: receiver,
        conversation_id: conversation.clone(),
        content: format!("content of {}", id),
        attachments: Vec::new(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap(),
        read: false,
        reactions: Vec::new(),
    }
}

#[derive(Default)]
struct FakeState {
    history: HashMap<ConversationId, Vec<Message>>,
    history_delay: HashMap<ConversationId, Duration>,
    mark_read_delay: Option<Duration>,
    profiles: HashMap<String, UserProfile>,
    failing_profiles: HashSet<String>,
    notifications: Vec<Notification>,
    reject: bool,
    next_id: u32,
    sent: Vec<MessageDraft>,
    calls: Vec<String>,
}

/// In-memory REST collaborator
pub struct FakeApi {
    local_id: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeApi {
    pub fn new(local_id: &str) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.to_string(),
            state: Arc::new(Mutex::new(FakeState::default())),
        })
    }

    /// Another user's view of the same backend
    pub fn sharing(&self, local_id: &str) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.to_string(),
            state: self.state.clone(),
        })
    }

    pub fn set_history(&self, conversation: &ConversationId, messages: Vec<Message>) {
        self.state
            .lock()
            .unwrap()
            .history
            .insert(conversation.clone(), messages);
    }

    pub fn delay_history(&self, conversation: &ConversationId, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .history_delay
            .insert(conversation.clone(), delay);
    }

    /// Hold every mark-read response back after the server applied it
    pub fn delay_mark_read(&self, delay: Duration) {
        self.state.lock().unwrap().mark_read_delay = Some(delay);
    }

    /// Store a message server-side without going through `send_message`
    pub fn persist(&self, message: Message) {
        self.state
            .lock()
            .unwrap()
            .history
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }

    pub fn stored(&self, conversation: &ConversationId, message_id: &str) -> Option<Message> {
        let state = self.state.lock().unwrap();
        state
            .history
            .get(conversation)?
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
    }

    pub fn add_profile(&self, id: &str, name: &str) {
        let mut profile = UserProfile::new(id);
        profile.name = Some(name.to_string());
        self.state
            .lock()
            .unwrap()
            .profiles
            .insert(id.to_string(), profile);
    }

    pub fn fail_profile(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_profiles
            .insert(id.to_string());
    }

    pub fn set_notifications(&self, notifications: Vec<Notification>) {
        self.state.lock().unwrap().notifications = notifications;
    }

    pub fn reject_all(&self, reject: bool) {
        self.state.lock().unwrap().reject = reject;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn sent(&self) -> Vec<MessageDraft> {
        self.state.lock().unwrap().sent.clone()
    }

    fn begin(&self, call: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.to_string());
        if state.reject {
            return Err(SyncError::Api {
                status: 400,
                message: format!("{} rejected", call),
            });
        }
        Ok(())
    }

    fn update_message<F: FnOnce(&mut Message)>(&self, message_id: &str, change: F) -> Result<Message> {
        let mut state = self.state.lock().unwrap();
        let found = state
            .history
            .values_mut()
            .flat_map(|messages| messages.iter_mut())
            .find(|m| m.id == message_id);
        match found {
            Some(message) => {
                change(message);
                Ok(message.clone())
            }
            None => Err(SyncError::Api {
                status: 404,
                message: "Message not found".to_string(),
            }),
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.begin("fetch_conversations")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .history
            .iter()
            .map(|(id, messages)| ConversationSummary {
                conversation_id: id.clone(),
                other_user: UserProfile::new(id.peer_of(&self.local_id).unwrap_or_default()),
                last_message: messages.last().cloned(),
                unread_count: messages.iter().filter(|m| !m.read).count() as u32,
            })
            .collect())
    }

    async fn fetch_history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        self.begin("fetch_history")?;
        let delay = self
            .state
            .lock()
            .unwrap()
            .history_delay
            .get(conversation_id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        Ok(state.history.get(conversation_id).cloned().unwrap_or_default())
    }

    async fn send_message(&self, draft: &MessageDraft) -> Result<Message> {
        self.begin("send_message")?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        state.sent.push(draft.clone());
        let conversation_id = ConversationId::between(&self.local_id, &draft.receiver_id);
        let message = Message {
            id: format!("srv-{}", state.next_id),
            sender_id: self.local_id.clone(),
            receiver_id: draft.receiver_id.clone(),
            conversation_id: conversation_id.clone(),
            content: draft.content.clone(),
            attachments: draft.attachments.clone(),
            created_at: Utc::now(),
            read: false,
            reactions: Vec::new(),
        };
        state
            .history
            .entry(conversation_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<Option<String>> {
        self.begin("mark_read")?;
        let (sender, delay) = {
            let mut state = self.state.lock().unwrap();
            let mut sender = None;
            if let Some(messages) = state.history.get_mut(conversation_id) {
                for m in messages.iter_mut().filter(|m| m.sender_id != self.local_id) {
                    m.read = true;
                    sender = Some(m.sender_id.clone());
                }
            }
            (sender, state.mark_read_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(sender)
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        self.begin("delete_message")?;
        let mut state = self.state.lock().unwrap();
        for messages in state.history.values_mut() {
            messages.retain(|m| m.id != message_id);
        }
        Ok(())
    }

    async fn react(&self, message_id: &str, emoji: &str) -> Result<Message> {
        self.begin("react")?;
        let me = self.local_id.clone();
        let emoji = emoji.to_string();
        self.update_message(message_id, move |m| {
            m.reactions.retain(|r| r.user_id != me);
            m.reactions.push(Reaction { emoji, user_id: me });
        })
    }

    async fn unreact(&self, message_id: &str) -> Result<Message> {
        self.begin("unreact")?;
        let me = self.local_id.clone();
        self.update_message(message_id, move |m| m.reactions.retain(|r| r.user_id != me))
    }

    async fn clear_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        self.begin("clear_conversation")?;
        self.state.lock().unwrap().history.remove(conversation_id);
        Ok(())
    }

    async fn fetch_user(&self, user_id: &str) -> Result<UserProfile> {
        self.begin("fetch_user")?;
        let state = self.state.lock().unwrap();
        if state.failing_profiles.contains(user_id) {
            return Err(SyncError::Http("connection reset".to_string()));
        }
        state.profiles.get(user_id).cloned().ok_or(SyncError::Api {
            status: 404,
            message: "User not found".to_string(),
        })
    }

    async fn fetch_notifications(&self) -> Result<Vec<Notification>> {
        self.begin("fetch_notifications")?;
        Ok(self.state.lock().unwrap().notifications.clone())
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        self.begin("mark_notification_read")?;
        let mut state = self.state.lock().unwrap();
        if let Some(n) = state.notifications.iter_mut().find(|n| n.id == notification_id) {
            n.read = true;
        }
        Ok(())
    }

    async fn mark_all_notifications_read(&self) -> Result<()> {
        self.begin("mark_all_notifications_read")?;
        for n in self.state.lock().unwrap().notifications.iter_mut() {
            n.read = true;
        }
        Ok(())
    }

    async fn delete_notification(&self, notification_id: &str) -> Result<()> {
        self.begin("delete_notification")?;
        self.state
            .lock()
            .unwrap()
            .notifications
            .retain(|n| n.id != notification_id);
        Ok(())
    }

    async fn clear_notifications(&self) -> Result<()> {
        self.begin("clear_notifications")?;
        self.state.lock().unwrap().notifications.clear();
        Ok(())
    }
}

pub fn notification(id: &str, read: bool) -> Notification {
    Notification {
        id: id.to_string(),
        kind: Some("offer".to_string()),
        title: None,
        message: format!("notification {}", id),
        link: None,
        read,
        created_at: None,
    }
}
